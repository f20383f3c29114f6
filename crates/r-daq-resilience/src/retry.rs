//! ---
//! daq_section: "07-resilience-fault-tolerance"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Retry delegate and resilience metrics."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use r_daq_common::{DaqError, DaqResult, RetryConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::ResilienceMetrics;

/// Backoff parameters of one retry call site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Growth factor applied after every retry.
    pub multiplier: f64,
    /// Upper bound of a single delay.
    pub max_delay: Duration,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Maximum random delay added on top of the computed backoff.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Policy without jitter. `max_attempts` is at least one and `multiplier` at least 1.
    pub fn new(
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            multiplier: multiplier.max(1.0),
            max_delay: max_delay.max(initial_delay),
            max_attempts: max_attempts.max(1),
            jitter: Duration::ZERO,
        }
    }

    /// Same policy with a different attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Same policy with random jitter.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the `retry`-th retry (1-indexed), without jitter:
    /// `min(initial_delay * multiplier^(retry - 1), max_delay)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= cap {
            self.max_delay
        } else {
            Duration::from_nanos(nanos.round() as u64)
        }
    }

    fn jittered(&self, retry: u32, rng: &mut StdRng) -> Duration {
        let base = self.delay_for(retry);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(
            config.initial_delay,
            config.multiplier,
            config.max_delay,
            config.max_attempts,
        )
        .with_jitter(config.jitter)
    }
}

/// Runs fallible operations under a [`RetryPolicy`].
///
/// Failures are branched on [`DaqError::is_retryable`]: configuration and long-lost
/// failures surface after the first attempt, communication and disconnection
/// failures are retried until the attempt ceiling. The delegate holds no per-call
/// state, so clones may run concurrently from independent call sites.
#[derive(Debug, Clone)]
pub struct RetryDelegate {
    policy: RetryPolicy,
    metrics: Option<ResilienceMetrics>,
    rng: Arc<Mutex<StdRng>>,
}

impl RetryDelegate {
    /// Create a delegate with the provided policy and optional metrics handle.
    pub fn new(policy: RetryPolicy, metrics: Option<ResilienceMetrics>) -> Self {
        Self {
            policy,
            metrics,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Seed the jitter RNG for deterministic testing.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Policy applied by [`RetryDelegate::run`].
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Metrics handle, if any.
    pub fn metrics(&self) -> Option<&ResilienceMetrics> {
        self.metrics.as_ref()
    }

    /// Run `op` with the configured attempt ceiling.
    ///
    /// `op` receives the 1-indexed attempt number. Cancelling `cancel` aborts the
    /// running attempt or the pending backoff and yields [`DaqError::Cancelled`].
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> DaqResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DaqResult<T>>,
    {
        self.run_with_attempts(operation, self.policy.max_attempts, cancel, op)
            .await
    }

    /// Run `op` with a call-site specific attempt ceiling.
    pub async fn run_with_attempts<T, F, Fut>(
        &self,
        operation: &str,
        max_attempts: u32,
        cancel: &CancellationToken,
        mut op: F,
    ) -> DaqResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DaqResult<T>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(self.cancelled(operation, attempt));
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DaqError::Cancelled),
                result = op(attempt) => result,
            };

            let err = match result {
                Ok(value) => {
                    self.record(operation, "success");
                    if attempt > 1 {
                        info!(operation, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(DaqError::Cancelled) => return Err(self.cancelled(operation, attempt)),
                Err(err) => err,
            };

            if !err.is_retryable() {
                self.record(operation, "fatal");
                warn!(operation, attempt, kind = %err.kind(), error = %err, "operation failed; not retrying");
                return Err(err);
            }

            if attempt >= max_attempts {
                self.record(operation, "exhausted");
                error!(operation, attempts = attempt, error = %err, "retry attempts exhausted");
                return Err(err);
            }

            let delay = self.policy.jittered(attempt, &mut self.rng.lock());
            self.record(operation, "retry");
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %err.kind(),
                error = %err,
                "operation failed; retrying",
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(operation, attempt)),
                _ = sleep(delay) => {}
            }
        }
    }

    fn cancelled(&self, operation: &str, attempt: u32) -> DaqError {
        self.record(operation, "cancelled");
        debug!(operation, attempt, "retry loop cancelled");
        DaqError::Cancelled
    }

    fn record(&self, operation: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_attempt(operation, outcome);
        }
    }
}

impl Default for RetryDelegate {
    fn default() -> Self {
        RetryDelegate::new(RetryPolicy::default(), None)
    }
}
