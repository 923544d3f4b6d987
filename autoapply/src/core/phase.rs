//! Worker state machine phases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a worker is in its claim/perceive/decide/act cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Claiming,
    Perceiving,
    Deciding,
    Acting,
    Intervening,
    ParsingRecovery,
    Observing,
    Finished,
    TimedOut,
    Crashed,
    Aborted,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Claiming => "claiming",
            Phase::Perceiving => "perceiving",
            Phase::Deciding => "deciding",
            Phase::Acting => "acting",
            Phase::Intervening => "intervening",
            Phase::ParsingRecovery => "parsing_recovery",
            Phase::Observing => "observing",
            Phase::Finished => "finished",
            Phase::TimedOut => "timed_out",
            Phase::Crashed => "crashed",
            Phase::Aborted => "aborted",
        }
    }

    /// Whether the phase ends a job attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Finished | Phase::TimedOut | Phase::Crashed | Phase::Aborted
        )
    }

    /// Whether the worker currently holds a claimed job.
    pub fn holds_job(self) -> bool {
        !matches!(self, Phase::Idle | Phase::Claiming) && !self.is_terminal()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_name_matches_as_str() {
        for phase in [Phase::ParsingRecovery, Phase::TimedOut, Phase::Idle] {
            let json = serde_json::to_string(&phase).expect("serialize");
            assert_eq!(json, format!("\"{}\"", phase.as_str()));
        }
    }

    #[test]
    fn terminal_phases_do_not_hold_jobs() {
        assert!(Phase::Acting.holds_job());
        assert!(Phase::Intervening.holds_job());
        assert!(!Phase::Finished.holds_job());
        assert!(!Phase::Idle.holds_job());
        assert!(Phase::Crashed.is_terminal());
    }
}
