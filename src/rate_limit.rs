use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Cooldown imposed on a provider after it answers RateLimited. Defends
/// against bursts that slip past local accounting due to clock skew.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
}

impl Bucket {
    fn new(rate_per_sec: f64, burst: u32) -> Self {
        let capacity = (burst.max(1)) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: rate_per_sec,
            last_refill: Instant::now(),
            cooldown_until: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or say how long to wait before trying again.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Err(until - now);
            }
            self.cooldown_until = None;
        }
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let deficit = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
    }
}

/// Cooperative per-provider throttle.
///
/// `acquire` suspends the calling task until a token is available; requests
/// are delayed, never rejected. Buckets are the only shared mutable state
/// between workers; each sits behind its own mutex.
pub struct RateLimiter {
    buckets: HashMap<String, Mutex<Bucket>>,
    cooldown: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_cooldown(DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            buckets: HashMap::new(),
            cooldown,
        }
    }

    /// Register a bucket for a provider. Called once at startup for every
    /// provider in the registry (plus the scorer).
    pub fn add_bucket(&mut self, provider_id: impl Into<String>, rate_per_sec: f64, burst: u32) {
        self.buckets
            .insert(provider_id.into(), Mutex::new(Bucket::new(rate_per_sec, burst)));
    }

    /// Wait until a token for `provider_id` is available, then consume it.
    pub async fn acquire(&self, provider_id: &str) {
        let bucket = match self.buckets.get(provider_id) {
            Some(bucket) => bucket,
            None => {
                // Unregistered ids are not throttled; registry construction
                // is expected to have created every bucket.
                tracing::debug!("No rate-limit bucket for provider '{}'", provider_id);
                return;
            }
        };

        loop {
            let wait = {
                let mut guard = bucket.lock().await;
                match guard.try_take(Instant::now()) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Impose the cooldown window on a provider that answered RateLimited.
    pub async fn penalize(&self, provider_id: &str) {
        if let Some(bucket) = self.buckets.get(provider_id) {
            let mut guard = bucket.lock().await;
            guard.cooldown_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                "Provider '{}' rate limited upstream, cooling down for {:?}",
                provider_id,
                self.cooldown
            );
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reusable retry policy for transient provider failures: exponential
/// backoff with a cap and random jitter. RateLimited responses go through
/// the limiter cooldown instead and never count against `max_attempts`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based): base × 2^attempt,
    /// capped, plus up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ceiling = (exp.as_millis() / 4) as u64;
        let jitter = if jitter_ceiling > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ceiling))
        } else {
            Duration::ZERO
        };
        exp + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_tokens_are_immediate() {
        let mut limiter = RateLimiter::new();
        limiter.add_bucket("fast", 1000.0, 2);

        let start = Instant::now();
        limiter.acquire("fast").await;
        limiter.acquire("fast").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn exhausted_bucket_delays_instead_of_rejecting() {
        let mut limiter = RateLimiter::new();
        // 20 tokens/sec, burst 1: second acquire must wait ~50ms.
        limiter.add_bucket("slow", 20.0, 1);

        limiter.acquire("slow").await;
        let start = Instant::now();
        limiter.acquire("slow").await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn cooldown_blocks_next_token() {
        let mut limiter = RateLimiter::with_cooldown(Duration::from_millis(100));
        limiter.add_bucket("hot", 1000.0, 10);

        limiter.penalize("hot").await;
        let start = Instant::now();
        limiter.acquire("hot").await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn unregistered_provider_is_not_throttled() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        limiter.acquire("ghost").await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };

        for attempt in 0..5 {
            let delay = policy.delay_for(attempt);
            let floor = Duration::from_millis(100 * 2u64.pow(attempt)).min(Duration::from_millis(400));
            assert!(delay >= floor, "attempt {} below floor", attempt);
            // Jitter adds at most 25%.
            assert!(delay <= floor + Duration::from_millis(floor.as_millis() as u64 / 4 + 1));
        }
    }
}
