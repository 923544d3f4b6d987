//! Observable agent state.
//!
//! Workers publish [`AgentEvent`]s through a [`WorkerReporter`]. Observers get
//! a read-only [`MonitorHandle`] offering a state snapshot and an event
//! subscription; nothing outside the workers can mutate agent state.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::phase::Phase;
use crate::core::types::JobOutcome;

const RECENT_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    PhaseChanged {
        worker: String,
        phase: Phase,
        job_id: Option<i64>,
        iteration: u32,
    },
    Log {
        worker: String,
        job_id: Option<i64>,
        message: String,
    },
    InterventionRequested {
        worker: String,
        job_id: i64,
        prompt: String,
    },
    InterventionResolved {
        worker: String,
        job_id: i64,
    },
    JobFinished {
        worker: String,
        job_id: i64,
        outcome: JobOutcome,
    },
    StoreDown {
        worker: String,
        error: String,
        retry_in_secs: u64,
    },
    /// The decision model is unreachable; the job is held, not failed.
    ModelDown {
        worker: String,
        job_id: i64,
        error: String,
        retry_in_millis: u64,
    },
}

impl AgentEvent {
    pub fn worker(&self) -> &str {
        match self {
            AgentEvent::PhaseChanged { worker, .. }
            | AgentEvent::Log { worker, .. }
            | AgentEvent::InterventionRequested { worker, .. }
            | AgentEvent::InterventionResolved { worker, .. }
            | AgentEvent::JobFinished { worker, .. }
            | AgentEvent::StoreDown { worker, .. }
            | AgentEvent::ModelDown { worker, .. } => worker,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub worker: String,
    pub phase: Phase,
    pub job_id: Option<i64>,
    pub iteration: u32,
    pub last_outcome: Option<JobOutcome>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub worker: String,
    pub job_id: Option<i64>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    pub workers: Vec<WorkerStatus>,
    /// Oldest first.
    pub recent: Vec<LogEntry>,
}

#[derive(Debug, Default)]
struct MonitorState {
    workers: BTreeMap<String, WorkerStatus>,
    recent: VecDeque<LogEntry>,
    subscribers: Vec<Sender<AgentEvent>>,
}

impl MonitorState {
    fn worker_mut(&mut self, worker: &str) -> &mut WorkerStatus {
        self.workers
            .entry(worker.to_string())
            .or_insert_with(|| WorkerStatus {
                worker: worker.to_string(),
                phase: Phase::Idle,
                job_id: None,
                iteration: 0,
                last_outcome: None,
                updated_at: Utc::now(),
            })
    }

    fn record(&mut self, worker: &str, job_id: Option<i64>, message: String) {
        if self.recent.len() == RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(LogEntry {
            at: Utc::now(),
            worker: worker.to_string(),
            job_id,
            message,
        });
    }

    fn apply(&mut self, event: &AgentEvent) {
        let now = Utc::now();
        match event {
            AgentEvent::PhaseChanged {
                worker,
                phase,
                job_id,
                iteration,
            } => {
                let status = self.worker_mut(worker);
                status.phase = *phase;
                status.job_id = *job_id;
                status.iteration = *iteration;
                status.updated_at = now;
            }
            AgentEvent::Log {
                worker,
                job_id,
                message,
            } => self.record(worker, *job_id, message.clone()),
            AgentEvent::InterventionRequested {
                worker,
                job_id,
                prompt,
            } => self.record(worker, Some(*job_id), format!("waiting for human: {prompt}")),
            AgentEvent::InterventionResolved { worker, job_id } => {
                self.record(worker, Some(*job_id), "human input received".to_string());
            }
            AgentEvent::JobFinished {
                worker,
                job_id,
                outcome,
            } => {
                let status = self.worker_mut(worker);
                status.last_outcome = Some(outcome.clone());
                status.updated_at = now;
                self.record(worker, Some(*job_id), outcome.log_line());
            }
            AgentEvent::StoreDown {
                worker,
                error,
                retry_in_secs,
            } => self.record(
                worker,
                None,
                format!("job store unavailable, retrying in {retry_in_secs}s: {error}"),
            ),
            AgentEvent::ModelDown {
                worker,
                job_id,
                error,
                retry_in_millis,
            } => self.record(
                worker,
                Some(*job_id),
                format!("model server unavailable, retrying in {retry_in_millis}ms: {error}"),
            ),
        }
    }
}

/// Owner side of the observable state. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct Monitor {
    inner: Arc<Mutex<MonitorState>>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, event: AgentEvent) {
        let mut state = self.lock();
        state.apply(&event);
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Publishing handle bound to one worker name.
    pub fn reporter(&self, worker: impl Into<String>) -> WorkerReporter {
        let worker = worker.into();
        self.lock().worker_mut(&worker);
        WorkerReporter {
            monitor: self.clone(),
            worker,
        }
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Read-only view for observers.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    inner: Arc<Mutex<MonitorState>>,
}

impl MonitorHandle {
    pub fn snapshot(&self) -> MonitorSnapshot {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        MonitorSnapshot {
            workers: state.workers.values().cloned().collect(),
            recent: state.recent.iter().cloned().collect(),
        }
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .push(tx);
        rx
    }
}

/// Per-worker publisher.
#[derive(Debug, Clone)]
pub struct WorkerReporter {
    monitor: Monitor,
    worker: String,
}

impl WorkerReporter {
    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn phase(&self, phase: Phase, job_id: Option<i64>, iteration: u32) {
        self.monitor.publish(AgentEvent::PhaseChanged {
            worker: self.worker.clone(),
            phase,
            job_id,
            iteration,
        });
    }

    pub fn log(&self, job_id: Option<i64>, message: impl Into<String>) {
        self.monitor.publish(AgentEvent::Log {
            worker: self.worker.clone(),
            job_id,
            message: message.into(),
        });
    }

    pub fn intervention_requested(&self, job_id: i64, prompt: &str) {
        self.monitor.publish(AgentEvent::InterventionRequested {
            worker: self.worker.clone(),
            job_id,
            prompt: prompt.to_string(),
        });
    }

    pub fn intervention_resolved(&self, job_id: i64) {
        self.monitor.publish(AgentEvent::InterventionResolved {
            worker: self.worker.clone(),
            job_id,
        });
    }

    pub fn job_finished(&self, job_id: i64, outcome: &JobOutcome) {
        self.monitor.publish(AgentEvent::JobFinished {
            worker: self.worker.clone(),
            job_id,
            outcome: outcome.clone(),
        });
    }

    pub fn store_down(&self, error: &str, retry_in_secs: u64) {
        self.monitor.publish(AgentEvent::StoreDown {
            worker: self.worker.clone(),
            error: error.to_string(),
            retry_in_secs,
        });
    }

    pub fn model_down(&self, job_id: i64, error: &str, retry_in_millis: u64) {
        self.monitor.publish(AgentEvent::ModelDown {
            worker: self.worker.clone(),
            job_id,
            error: error.to_string(),
            retry_in_millis,
        });
    }
}
