use failsafe::{backoff, failure_policy, CircuitBreaker, Config, StateMachine};
use std::time::Duration;

/// Concrete breaker type so per-provider breakers can live in a map that is
/// built once per run and shared by every worker.
pub type ProviderBreaker =
    StateMachine<failure_policy::ConsecutiveFailures<backoff::Exponential>, ()>;

/// Creates a circuit breaker for one enrichment provider.
///
/// A vendor that fails 5 times in a row is skipped (OPEN) instead of
/// hammered; recovery attempts back off exponentially from 10s to 60s.
pub fn create_provider_breaker() -> ProviderBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

/// Record one call outcome on the breaker. NotFound counts as a healthy
/// vendor answer; only transport-level and fatal vendor failures trip it.
pub fn record_outcome(breaker: &ProviderBreaker, healthy: bool) {
    let _ = breaker.call(|| if healthy { Ok::<(), ()>(()) } else { Err(()) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use failsafe::{CircuitBreaker, Error};

    #[test]
    fn test_breaker_opens_after_failures() {
        let cb = create_provider_breaker();

        // Simulate 5 consecutive failures
        for _ in 0..5 {
            let result: Result<(), Error<&str>> = cb.call(|| Err::<(), &str>("simulated error"));
            assert!(result.is_err());
        }

        // Next call should be rejected (circuit is open)
        let result: Result<(), Error<&str>> = cb.call(|| Ok::<(), &str>(()));

        match result {
            Err(Error::Rejected) => {
                // Circuit is open, expected behavior
            }
            _ => panic!("Expected circuit to be open and reject requests"),
        }
    }

    #[test]
    fn test_breaker_allows_success() {
        let cb = create_provider_breaker();

        let result: Result<i32, Error<&str>> = cb.call(|| Ok::<i32, &str>(42));

        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_record_outcome_trips_breaker() {
        let cb = create_provider_breaker();

        for _ in 0..5 {
            record_outcome(&cb, false);
        }

        assert!(!cb.is_call_permitted());
    }
}
