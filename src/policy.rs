//! Policy engine for circuit breaker trip and close decisions.

/// Counters the state machine exposes to a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCounts {
    /// Failures since the last success while closed.
    pub failure_count: u32,
    /// Successful trial calls since entering half-open.
    pub consecutive_successes: u32,
}

/// A policy that decides when a breaker opens and when it closes again.
pub trait BreakerPolicy: Send + Sync + 'static {
    /// Called after a failure while closed; `true` opens the circuit.
    fn should_trip(&self, counts: &FailureCounts) -> bool;

    /// Called after a successful trial while half-open; `true` closes the
    /// circuit.
    fn should_close(&self, counts: &FailureCounts) -> bool;
}

/// Consecutive-count policy: trip after `failure_threshold` failures without
/// an intervening success, close after `success_threshold` successful trials.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdPolicy {
    failure_threshold: u32,
    success_threshold: u32,
}

impl ThresholdPolicy {
    /// Creates a threshold policy.
    pub fn new(failure_threshold: u32, success_threshold: u32) -> Self {
        Self {
            failure_threshold,
            success_threshold,
        }
    }
}

impl BreakerPolicy for ThresholdPolicy {
    fn should_trip(&self, counts: &FailureCounts) -> bool {
        counts.failure_count >= self.failure_threshold
    }

    fn should_close(&self, counts: &FailureCounts) -> bool {
        counts.consecutive_successes >= self.success_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_policy_boundaries() {
        let policy = ThresholdPolicy::new(3, 2);
        let counts = |failure_count, consecutive_successes| FailureCounts {
            failure_count,
            consecutive_successes,
        };

        assert!(!policy.should_trip(&counts(2, 0)));
        assert!(policy.should_trip(&counts(3, 0)));
        assert!(!policy.should_close(&counts(0, 1)));
        assert!(policy.should_close(&counts(0, 2)));
    }
}
