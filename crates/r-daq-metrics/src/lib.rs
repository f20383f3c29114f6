//! ---
//! daq_section: "03-observability"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Metrics collection and export utilities."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::debug;

/// Shared registry type used across crates.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render every registered family in the Prometheus text exposition format.
pub fn render_text(registry: &SharedRegistry) -> Result<String> {
    let families = registry.gather();
    let body = TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metrics")?;
    debug!(families = families.len(), bytes = body.len(), "metrics rendered");
    Ok(body)
}

/// Connection-level gauges and counters maintained by the failover controller.
#[derive(Clone, Debug)]
pub struct ConnectionMetrics {
    registry: SharedRegistry,
    endpoint_active: IntGaugeVec,
    equipment_states: IntCounterVec,
}

impl ConnectionMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let endpoint_active = IntGaugeVec::new(
            Opts::new(
                "r_daq_endpoint_active",
                "Indicator (0/1) whether a server endpoint currently serves the equipment",
            ),
            &["equipment", "uri"],
        )?;
        registry.register(Box::new(endpoint_active.clone()))?;

        let equipment_states = IntCounterVec::new(
            Opts::new(
                "r_daq_equipment_state_updates_total",
                "Count of equipment state notifications by state",
            ),
            &["equipment", "state"],
        )?;
        registry.register(Box::new(equipment_states.clone()))?;

        Ok(Self {
            registry,
            endpoint_active,
            equipment_states,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_active(&self, equipment: &str, uri: &str, active: bool) {
        let gauge = self.endpoint_active.with_label_values(&[equipment, uri]);
        gauge.set(if active { 1 } else { 0 });
    }

    pub fn record_state(&self, equipment: &str, state: &str) {
        self.equipment_states
            .with_label_values(&[equipment, state])
            .inc();
    }
}

pub use prometheus;
