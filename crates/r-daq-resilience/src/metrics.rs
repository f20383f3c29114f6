//! ---
//! daq_section: "07-resilience-fault-tolerance"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Retry delegate and resilience metrics."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, Opts};
use r_daq_metrics::SharedRegistry;

/// Metrics published by retry loops and the failover controller.
#[derive(Clone)]
pub struct ResilienceMetrics {
    registry: SharedRegistry,
    retry_attempts_total: IntCounterVec,
    failovers_total: IntCounterVec,
    failover_duration_seconds: HistogramVec,
    subscription_recreations_total: IntCounterVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let retry_attempts_total = IntCounterVec::new(
            Opts::new(
                "r_daq_retry_attempts_total",
                "Attempts executed by retry loops, by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let failovers_total = IntCounterVec::new(
            Opts::new(
                "r_daq_failovers_total",
                "Completed switches from one server to another",
            ),
            &["from", "to"],
        )?;
        registry.register(Box::new(failovers_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "r_daq_failover_duration_seconds",
            "Duration between a switch trigger and the alternate server serving again",
        )
        .buckets(prometheus::exponential_buckets(0.01, 2.0, 14)?);
        let failover_duration_seconds = HistogramVec::new(histogram_opts, &["from", "to"])?;
        registry.register(Box::new(failover_duration_seconds.clone()))?;

        let subscription_recreations_total = IntCounterVec::new(
            Opts::new(
                "r_daq_subscription_recreations_total",
                "Subscriptions recreated after a failed transfer",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(subscription_recreations_total.clone()))?;

        Ok(Self {
            registry,
            retry_attempts_total,
            failovers_total,
            failover_duration_seconds,
            subscription_recreations_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Count one attempt outcome (`success`, `retry`, `fatal`, `exhausted`, `cancelled`).
    pub fn record_attempt(&self, operation: &str, outcome: &str) {
        self.retry_attempts_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Record a completed switch and its duration.
    pub fn observe_failover(&self, from: &str, to: &str, duration: Duration) {
        let labels = [from, to];
        self.failovers_total.with_label_values(&labels).inc();
        self.failover_duration_seconds
            .with_label_values(&labels)
            .observe(duration.as_secs_f64());
    }

    /// Count a subscription recreation attempt sequence.
    pub fn record_subscription_recreation(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.subscription_recreations_total
            .with_label_values(&[outcome])
            .inc();
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_text_output() {
        let registry = r_daq_metrics::new_registry();
        let metrics = ResilienceMetrics::new(registry.clone()).unwrap();
        metrics.record_attempt("connect", "retry");
        metrics.observe_failover("opc.tcp://a:4840", "opc.tcp://b:4840", Duration::from_millis(420));
        metrics.record_subscription_recreation(true);

        let text = r_daq_metrics::render_text(&registry).unwrap();
        assert!(text.contains("r_daq_retry_attempts_total{operation=\"connect\",outcome=\"retry\"} 1"));
        assert!(text.contains("r_daq_failovers_total"));
        assert!(text.contains("r_daq_subscription_recreations_total{outcome=\"success\"} 1"));
    }

    #[test]
    fn registering_twice_fails() {
        let registry = r_daq_metrics::new_registry();
        ResilienceMetrics::new(registry.clone()).unwrap();
        assert!(ResilienceMetrics::new(registry).is_err());
    }
}
