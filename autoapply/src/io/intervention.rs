//! Human-in-the-loop intervention gate.
//!
//! A worker that needs a human (CAPTCHA, 2FA code, unknown screen) parks in
//! [`InterventionGate::request`] until an operator resolves it through the
//! CLI or the console API. At most one request is pending at a time.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

/// How often a parked request re-checks its cancellation predicate.
const CANCEL_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterventionError {
    #[error("an intervention is already pending: {prompt}")]
    Busy { prompt: String },
    #[error("no intervention is pending")]
    NothingPending,
    #[error("intervention cancelled")]
    Cancelled,
}

/// The currently pending question, as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingIntervention {
    /// Worker that asked.
    pub owner: String,
    pub prompt: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct GateState {
    pending: Option<PendingIntervention>,
    resolved: Option<String>,
    cancelled: bool,
}

/// Shared, cloneable handle to the single intervention slot.
#[derive(Debug, Clone, Default)]
pub struct InterventionGate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

impl InterventionGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a value is supplied, or until `cancelled()` returns true.
    ///
    /// Never busy-waits: the caller sleeps on a condition variable and wakes
    /// on resolve/cancel or once per tick to evaluate `cancelled`.
    pub fn request(
        &self,
        owner: &str,
        prompt: &str,
        cancelled: impl Fn() -> bool,
    ) -> Result<String, InterventionError> {
        let (_, condvar) = &*self.inner;
        let mut state = self.lock();
        if let Some(pending) = &state.pending {
            return Err(InterventionError::Busy {
                prompt: pending.prompt.clone(),
            });
        }
        state.pending = Some(PendingIntervention {
            owner: owner.to_string(),
            prompt: prompt.to_string(),
            requested_at: Utc::now(),
        });
        state.resolved = None;
        state.cancelled = false;
        info!(owner, prompt, "waiting for human input");

        loop {
            if let Some(value) = state.resolved.take() {
                state.pending = None;
                return Ok(value);
            }
            if state.cancelled {
                state.pending = None;
                state.cancelled = false;
                return Err(InterventionError::Cancelled);
            }
            // Evaluate the predicate without holding the lock; it may touch the store.
            drop(state);
            let stop = cancelled();
            state = self.lock();
            if stop && state.resolved.is_none() {
                warn!(owner, "intervention cancelled by owner");
                state.pending = None;
                state.cancelled = false;
                return Err(InterventionError::Cancelled);
            }
            if state.resolved.is_some() || state.cancelled {
                continue;
            }
            state = condvar
                .wait_timeout(state, CANCEL_TICK)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Supply the value for the pending request.
    pub fn resolve(&self, value: impl Into<String>) -> Result<(), InterventionError> {
        let mut state = self.lock();
        if state.pending.is_none() || state.resolved.is_some() || state.cancelled {
            return Err(InterventionError::NothingPending);
        }
        state.resolved = Some(value.into());
        self.inner.1.notify_all();
        Ok(())
    }

    /// Abandon the pending request; the waiting worker receives `Cancelled`.
    pub fn cancel(&self) -> Result<(), InterventionError> {
        let mut state = self.lock();
        if state.pending.is_none() || state.resolved.is_some() {
            return Err(InterventionError::NothingPending);
        }
        state.cancelled = true;
        self.inner.1.notify_all();
        Ok(())
    }

    /// The pending request, if one is waiting for a value.
    pub fn pending(&self) -> Option<PendingIntervention> {
        let state = self.lock();
        if state.resolved.is_some() || state.cancelled {
            return None;
        }
        state.pending.clone()
    }
}
