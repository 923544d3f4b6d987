//! Shared deterministic types for the agent core.
//!
//! These types define stable contracts between the job store, the worker loop
//! and external observers. They must not depend on I/O.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a queued job.
///
/// Transitions are monotonic: `Pending -> InProgress -> {Success, Failed}`.
/// A claimed job never returns to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` respects the monotonic lifecycle.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::InProgress)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::InProgress, JobStatus::Success)
                | (JobStatus::InProgress, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// One queued target page, processed by one full agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub company: String,
    pub status: JobStatus,
    /// Newline-separated, append-only log.
    pub log: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn log_lines(&self) -> impl Iterator<Item = &str> {
        self.log.lines().filter(|line| !line.is_empty())
    }
}

/// How a single job run ended, as seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The model finished with a justified confirmation.
    Succeeded { message: String, iterations: u32 },
    /// The iteration bound was exhausted without a finish.
    TimedOut { iterations: u32 },
    /// A browser, session or model transport failure ended the job.
    Crashed { error: String, iterations: u32 },
    /// The job was marked terminal by someone else (operator abort).
    Aborted { iterations: u32 },
}

impl JobOutcome {
    pub fn iterations(&self) -> u32 {
        match self {
            JobOutcome::Succeeded { iterations, .. }
            | JobOutcome::TimedOut { iterations }
            | JobOutcome::Crashed { iterations, .. }
            | JobOutcome::Aborted { iterations } => *iterations,
        }
    }

    /// Terminal status to persist, or `None` when the store already holds one.
    pub fn terminal_status(&self) -> Option<JobStatus> {
        match self {
            JobOutcome::Succeeded { .. } => Some(JobStatus::Success),
            JobOutcome::TimedOut { .. } | JobOutcome::Crashed { .. } => Some(JobStatus::Failed),
            JobOutcome::Aborted { .. } => None,
        }
    }

    /// Line appended to the job log alongside the terminal status.
    pub fn log_line(&self) -> String {
        match self {
            JobOutcome::Succeeded {
                message,
                iterations,
            } => format!("finished after {iterations} iterations: {message}"),
            JobOutcome::TimedOut { iterations } => {
                format!("exceeded max iterations ({iterations})")
            }
            JobOutcome::Crashed { error, iterations } => {
                format!("crashed after {iterations} iterations: {error}")
            }
            JobOutcome::Aborted { iterations } => {
                format!("aborted externally after {iterations} iterations")
            }
        }
    }

    /// Whether the browser session must be recreated before the next claim.
    pub fn requires_session_reset(&self) -> bool {
        !matches!(self, JobOutcome::Succeeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Success,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn transitions_are_monotonic() {
        use JobStatus::{Failed, InProgress, Pending, Success};
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Success));
        assert!(InProgress.can_transition_to(Failed));
        assert!(!InProgress.can_transition_to(Pending));
        assert!(!Success.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Success));
        assert!(!Pending.can_transition_to(Success));
    }

    #[test]
    fn timed_out_log_line_names_the_bound() {
        let outcome = JobOutcome::TimedOut { iterations: 50 };
        assert!(outcome.log_line().contains("exceeded max iterations"));
        assert_eq!(outcome.terminal_status(), Some(JobStatus::Failed));
        assert!(outcome.requires_session_reset());
    }

    #[test]
    fn aborted_outcome_leaves_status_alone() {
        let outcome = JobOutcome::Aborted { iterations: 3 };
        assert_eq!(outcome.terminal_status(), None);
        assert_eq!(outcome.iterations(), 3);
    }
}
