//! Shared budget helpers for deterministic orchestration.

use std::time::Duration;

/// Counts loop iterations against a fixed upper bound.
///
/// Every pass through the decide step consumes one iteration, including
/// passes whose model output could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationBudget {
    max: u32,
    used: u32,
}

impl IterationBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Consume one iteration, returning its 1-indexed number, or `None` once exhausted.
    pub fn next_iteration(&mut self) -> Option<u32> {
        if self.used >= self.max {
            return None;
        }
        self.used += 1;
        Some(self.used)
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.max
    }
}

/// Exponential backoff used while the job store or the model server is unreachable.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: None,
        }
    }

    /// Delay before the next retry: `initial`, then doubling up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_yields_exactly_max_iterations() {
        let mut budget = IterationBudget::new(3);
        let iters: Vec<u32> = std::iter::from_fn(|| budget.next_iteration()).collect();
        assert_eq!(iters, vec![1, 2, 3]);
        assert!(budget.exhausted());
        assert_eq!(budget.next_iteration(), None);
        assert_eq!(budget.used(), 3);
    }

    #[test]
    fn zero_budget_never_starts() {
        let mut budget = IterationBudget::new(0);
        assert_eq!(budget.next_iteration(), None);
    }

    #[test]
    fn backoff_doubles_until_capped_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
