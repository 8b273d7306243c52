//! Resilient transport: retry with exponential backoff around one
//! source's network calls, plus optional request pacing for providers
//! that mandate a minimum inter-request interval.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use scholia_common::config::RetryConfig;
use scholia_common::{ErrorKind, SourceError};

/// Maximum jitter added to computed backoff delays.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Exponential backoff configuration.
///
/// Delay for a failed attempt n (1-indexed):
/// `min(base * multiplier^(n-1), max) + jitter`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            multiplier,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as f64;
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64) + jitter()
    }
}

/// Random jitter spreads simultaneous retries apart.
fn jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=MAX_JITTER.as_millis() as u64))
}

/// Serializes requests to one provider and enforces its minimum
/// inter-request interval, independent of retry backoff. The first
/// request proceeds immediately.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Option<Duration>,
    last_request: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_interval: Option<Duration>) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn unpaced() -> Self {
        Self::new(None)
    }

    /// Waits until this provider may be contacted again. The lock is
    /// held across the sleep so concurrent callers queue up.
    pub async fn acquire(&self) {
        let Some(min_interval) = self.min_interval else {
            return;
        };

        let mut last_request = self.last_request.lock().await;
        if let Some(last) = *last_request {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                let wait = min_interval.saturating_sub(elapsed);
                debug!(wait_ms = wait.as_millis() as u64, "pacing request");
                tokio::time::sleep(wait).await;
            }
        }
        *last_request = Some(Instant::now());
    }
}

/// Wraps an adapter's network calls with pacing and retry.
#[derive(Debug)]
pub struct Transport {
    policy: RetryPolicy,
    pacer: Pacer,
}

impl Transport {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pacer: Pacer::unpaced(),
        }
    }

    pub fn with_pacing(policy: RetryPolicy, min_interval: Duration) -> Self {
        Self {
            policy,
            pacer: Pacer::new(Some(min_interval)),
        }
    }

    /// Runs `op` up to the attempt budget.
    ///
    /// Retryable failures (rate_limit, timeout, network) back off
    /// exponentially, honoring a provider-supplied retry-after hint over
    /// the computed delay. `unknown` retries once, conservatively.
    /// Non-retryable failures (auth, parse, plain 4xx) surface at once.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempt = 1u32;
        loop {
            self.pacer.acquire().await;

            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let budget = if error.kind == ErrorKind::Unknown {
                self.policy.max_attempts.min(2)
            } else {
                self.policy.max_attempts
            };

            if !error.retryable() || attempt >= budget {
                return Err(error);
            }

            let delay = error
                .retry_after
                .unwrap_or_else(|| self.policy.backoff_delay(attempt));
            debug!(
                attempt,
                next_attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                kind = error.kind.as_str(),
                "transient failure, will retry"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
