use std::time::{Duration, Instant};

/// Wall-clock budget for one invocation.
///
/// Phases check it after each page or item, so every call completes at
/// least one unit of work even with a zero budget.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    started: Instant,
    limit: Duration,
}

impl TimeBudget {
    pub fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    pub fn exhausted(&self) -> bool {
        self.elapsed() >= self.limit
    }

    /// Fair share of what is left for one of `parts` remaining consumers.
    pub fn share(&self, parts: usize) -> TimeBudget {
        let parts = u32::try_from(parts.max(1)).unwrap_or(u32::MAX);
        TimeBudget::start(self.remaining() / parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_budget_is_exhausted() {
        let budget = TimeBudget::start(Duration::ZERO);
        assert!(budget.exhausted());
        assert_eq!(budget.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_share_splits_remaining() {
        let budget = TimeBudget::start(Duration::from_secs(60));
        let share = budget.share(3);
        assert!(share.remaining() <= Duration::from_secs(20));
        assert!(share.remaining() > Duration::from_secs(19));
        assert!(!share.exhausted());

        let none = TimeBudget::start(Duration::ZERO).share(0);
        assert!(none.exhausted());
    }
}
