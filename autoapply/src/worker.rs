//! Worker loop: claim a job, drive it, persist the outcome, repeat.
//!
//! Each worker owns one store connection and at most one browser session.
//! Workers share nothing but the database file, the intervention gate and
//! the monitor.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};

use crate::core::budget::Backoff;
use crate::core::phase::Phase;
use crate::core::types::{Job, JobOutcome};
use crate::io::browser::{BrowserDriver, BrowserFactory};
use crate::io::config::{AgentConfig, load_config};
use crate::io::init::StatePaths;
use crate::io::intervention::InterventionGate;
use crate::io::model::{TextModel, VisionModel};
use crate::io::monitor::{Monitor, WorkerReporter};
use crate::io::profile::{Profile, load_profile};
use crate::io::prompt::PromptBuilder;
use crate::io::store::{JobStore, StoreError};
use crate::job::{JobContext, drive_job};
use crate::perceive::{PerceptionBuilder, VisionSettings};

/// Granularity of interruptible sleeps.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Per-worker settings that do not depend on the browser or model types.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub name: String,
    pub config: AgentConfig,
    pub profile: Arc<Profile>,
    pub gate: InterventionGate,
    pub reporter: WorkerReporter,
    /// `None` disables per-iteration artifacts.
    pub attempts_dir: Option<PathBuf>,
    pub screenshot_path: PathBuf,
}

struct Session<D> {
    driver: D,
    perception: PerceptionBuilder,
}

pub struct Worker<F: BrowserFactory, M> {
    options: WorkerOptions,
    store: JobStore,
    factory: F,
    model: M,
    prompts: PromptBuilder,
    vision: Option<VisionSettings>,
    session: Option<Session<F::Driver>>,
    backoff: Backoff,
}

impl<F, M> Worker<F, M>
where
    F: BrowserFactory,
    M: TextModel + VisionModel,
{
    pub fn new(options: WorkerOptions, store: JobStore, factory: F, model: M) -> Result<Self> {
        let config = &options.config;
        let prompts = PromptBuilder::new(config.prompt_budget_bytes);
        let vision = if config.model.vision_enabled {
            Some(VisionSettings {
                model: config.model.vision_model.clone(),
                prompt: prompts.build_vision(None).context("render vision prompt")?,
                screenshot_path: options.screenshot_path.clone(),
            })
        } else {
            None
        };
        let backoff = Backoff::new(
            Duration::from_secs(config.store_backoff_initial_secs),
            Duration::from_secs(config.store_backoff_max_secs),
        );
        Ok(Self {
            options,
            store,
            factory,
            model,
            prompts,
            vision,
            session: None,
            backoff,
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Claim and drive at most one job. `Ok(None)` means the queue was empty.
    ///
    /// A store error is returned as-is; it is never reported as an empty queue.
    pub fn run_once(&mut self) -> Result<Option<JobOutcome>, StoreError> {
        self.run_once_until(&AtomicBool::new(false))
    }

    /// Like [`Worker::run_once`], but a model outage wait gives up once
    /// `shutdown` is set.
    pub fn run_once_until(
        &mut self,
        shutdown: &AtomicBool,
    ) -> Result<Option<JobOutcome>, StoreError> {
        let reporter = &self.options.reporter;
        reporter.phase(Phase::Claiming, None, 0);
        let Some(job) = self.store.claim_next()? else {
            reporter.phase(Phase::Idle, None, 0);
            return Ok(None);
        };
        Ok(Some(self.process(&job, shutdown)))
    }

    /// Keep claiming until `shutdown` is set. Store outages back off exponentially.
    #[instrument(skip_all, fields(worker = %self.options.name))]
    pub fn run_forever(&mut self, shutdown: &AtomicBool) {
        info!("worker started");
        while !shutdown.load(Ordering::SeqCst) {
            match self.run_once_until(shutdown) {
                Ok(Some(_)) => self.backoff.reset(),
                Ok(None) => {
                    self.backoff.reset();
                    sleep_unless_shutdown(self.options.config.idle_poll(), shutdown);
                }
                Err(err) => {
                    let delay = self.backoff.next_delay();
                    error!(error = %err, retry_in_secs = delay.as_secs(), "job store unavailable");
                    self.options
                        .reporter
                        .store_down(&err.to_string(), delay.as_secs());
                    sleep_unless_shutdown(delay, shutdown);
                }
            }
        }
        self.close_session();
        self.options.reporter.phase(Phase::Idle, None, 0);
        info!("worker stopped");
    }

    #[instrument(skip_all, fields(job_id = job.id, url = %job.url))]
    fn process(&mut self, job: &Job, shutdown: &AtomicBool) -> JobOutcome {
        info!("processing job");
        let outcome = match self.ensure_session() {
            Ok(()) => self.drive(job, shutdown),
            Err(err) => JobOutcome::Crashed {
                error: format!("{err:#}"),
                iterations: 0,
            },
        };
        self.finish(job, &outcome);
        outcome
    }

    fn ensure_session(&mut self) -> Result<()> {
        if self.session.is_none() {
            let driver = self.factory.open().context("open browser session")?;
            info!("browser session opened");
            self.session = Some(Session {
                driver,
                perception: PerceptionBuilder::new(
                    self.options.config.perception.limits(),
                    self.vision.clone(),
                ),
            });
        }
        Ok(())
    }

    fn drive(&mut self, job: &Job, shutdown: &AtomicBool) -> JobOutcome {
        let Some(session) = self.session.as_mut() else {
            return JobOutcome::Crashed {
                error: "no browser session".to_string(),
                iterations: 0,
            };
        };
        let ctx = JobContext {
            config: &self.options.config,
            profile: &self.options.profile,
            model: &self.model,
            prompts: &self.prompts,
            gate: &self.options.gate,
            reporter: &self.options.reporter,
            shutdown,
            attempts_dir: self
                .options
                .attempts_dir
                .as_deref()
                .filter(|_| self.options.config.record_attempts),
        };
        drive_job(
            &ctx,
            &mut self.store,
            &mut session.driver,
            &mut session.perception,
            job,
        )
    }

    /// Persist the outcome, publish it, and drop the session when required.
    fn finish(&mut self, job: &Job, outcome: &JobOutcome) {
        let reporter = &self.options.reporter;
        if let Some(status) = outcome.terminal_status() {
            match self.store.set_status(job.id, status, &outcome.log_line()) {
                Ok(true) => info!(status = %status, "job finished"),
                Ok(false) => warn!("job was already terminal; outcome not written"),
                Err(err) => error!(error = %err, "could not write job outcome"),
            }
        }
        reporter.job_finished(job.id, outcome);
        reporter.phase(terminal_phase(outcome), Some(job.id), outcome.iterations());

        let keep = !outcome.requires_session_reset() && self.options.config.keep_session_after_success;
        if !keep {
            self.close_session();
        }
        self.options.reporter.phase(Phase::Idle, None, 0);
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.driver.close() {
                warn!(error = %err, "failed to close browser session");
            }
            info!("browser session closed");
        }
    }
}

fn terminal_phase(outcome: &JobOutcome) -> Phase {
    match outcome {
        JobOutcome::Succeeded { .. } => Phase::Finished,
        JobOutcome::TimedOut { .. } => Phase::TimedOut,
        JobOutcome::Crashed { .. } => Phase::Crashed,
        JobOutcome::Aborted { .. } => Phase::Aborted,
    }
}

fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}

/// Everything needed to start a pool of workers over one state directory.
#[derive(Debug, Clone)]
pub struct PoolSpec {
    pub paths: StatePaths,
    pub config: AgentConfig,
    pub profile: Arc<Profile>,
    pub gate: InterventionGate,
    pub monitor: Monitor,
}

impl PoolSpec {
    /// Load config and profile from an initialized state directory.
    pub fn load(paths: StatePaths, gate: InterventionGate, monitor: Monitor) -> Result<Self> {
        if !paths.db_path.exists() {
            anyhow::bail!(
                "{} not found; run `autoapply init` first",
                paths.db_path.display()
            );
        }
        let config = load_config(&paths.config_path)?;
        let profile = Arc::new(load_profile(&paths.profile_path)?);
        Ok(Self {
            paths,
            config,
            profile,
            gate,
            monitor,
        })
    }

    pub fn worker_options(&self, index: usize) -> WorkerOptions {
        let name = format!("worker-{index}");
        WorkerOptions {
            reporter: self.monitor.reporter(name.clone()),
            screenshot_path: self.paths.screenshot_path(&name),
            name,
            config: self.config.clone(),
            profile: Arc::clone(&self.profile),
            gate: self.gate.clone(),
            attempts_dir: Some(self.paths.attempts_dir.clone()),
        }
    }
}

/// Start `count` worker threads, each with its own store connection and session.
pub fn spawn_workers<F, M>(
    spec: &PoolSpec,
    count: usize,
    factory: F,
    model: M,
    shutdown: Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>>
where
    F: BrowserFactory + Clone + Send + 'static,
    F::Driver: Send,
    M: TextModel + VisionModel + Clone + Send + 'static,
{
    let mut handles = Vec::with_capacity(count);
    for index in 0..count {
        let options = spec.worker_options(index);
        let name = options.name.clone();
        let store = JobStore::open(&spec.paths.db_path)
            .with_context(|| format!("open job store for {name}"))?;
        let mut worker = Worker::new(options, store, factory.clone(), model.clone())?;
        let shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run_forever(&shutdown))
            .with_context(|| format!("spawn {name}"))?;
        handles.push(handle);
    }
    Ok(handles)
}
