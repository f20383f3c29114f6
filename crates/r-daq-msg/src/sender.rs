//! ---
//! daq_section: "02-messaging-data-model"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Downstream message contract and value types."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

use crate::types::{EquipmentState, Quality, TagId, ValueUpdate};

/// Sink for equipment state transitions and tag notifications.
///
/// Implementations are invoked from session dispatcher tasks and must not block.
pub trait MessageSender: Send + Sync {
    /// The equipment connection state changed.
    fn on_equipment_state_update(&self, state: EquipmentState);
    /// A subscribed tag produced a new value.
    fn on_value_update(&self, tag: TagId, update: ValueUpdate);
    /// A tag could not be subscribed or its value turned bad.
    fn on_tag_invalid(&self, tag: TagId, quality: Quality);
}

/// Event captured by [`RecordingSender`].
#[derive(Debug, Clone, PartialEq)]
pub enum SenderEvent {
    /// Equipment state notification.
    State(EquipmentState),
    /// Value notification.
    Value(TagId, ValueUpdate),
    /// Invalid tag notification.
    Invalid(TagId, Quality),
}

/// In-memory sender that records every notification, primarily for tests and
/// single-process integration.
#[derive(Clone, Default)]
pub struct RecordingSender {
    events: Arc<Mutex<Vec<SenderEvent>>>,
}

impl RecordingSender {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all recorded events in arrival order.
    pub fn events(&self) -> Vec<SenderEvent> {
        self.events.lock().clone()
    }

    /// Recorded equipment states in arrival order.
    pub fn states(&self) -> Vec<EquipmentState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SenderEvent::State(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    /// Recorded value updates for one tag.
    pub fn values_for(&self, tag: TagId) -> Vec<ValueUpdate> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SenderEvent::Value(id, update) if id == tag => Some(update),
                _ => None,
            })
            .collect()
    }

    /// Recorded invalidations for one tag.
    pub fn invalidations_for(&self, tag: TagId) -> Vec<Quality> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SenderEvent::Invalid(id, quality) if id == tag => Some(quality),
                _ => None,
            })
            .collect()
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Poll the recorded events until `predicate` holds or `timeout` elapses.
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&[SenderEvent]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let guard = self.events.lock();
                if predicate(&guard) {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn push(&self, event: SenderEvent) {
        self.events.lock().push(event);
    }
}

impl MessageSender for RecordingSender {
    fn on_equipment_state_update(&self, state: EquipmentState) {
        self.push(SenderEvent::State(state));
    }

    fn on_value_update(&self, tag: TagId, update: ValueUpdate) {
        self.push(SenderEvent::Value(tag, update));
    }

    fn on_tag_invalid(&self, tag: TagId, quality: Quality) {
        self.push(SenderEvent::Invalid(tag, quality));
    }
}

/// Sender that only logs notifications; used when no downstream sink is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSender;

impl MessageSender for TracingSender {
    fn on_equipment_state_update(&self, state: EquipmentState) {
        tracing::info!(state = %state, "equipment state update");
    }

    fn on_value_update(&self, tag: TagId, update: ValueUpdate) {
        tracing::debug!(tag = %tag, value = %update.value, quality = ?update.quality.code, "value update");
    }

    fn on_tag_invalid(&self, tag: TagId, quality: Quality) {
        tracing::warn!(tag = %tag, quality = ?quality.code, reason = %quality.description, "tag invalid");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QualityCode;
    use serde_json::json;

    #[test]
    fn recorder_keeps_arrival_order() {
        let sender = RecordingSender::new();
        sender.on_equipment_state_update(EquipmentState::Ok);
        sender.on_value_update(TagId(1), ValueUpdate::new(json!(1.5), Quality::good(), None));
        sender.on_tag_invalid(TagId(2), Quality::new(QualityCode::NodeNotFound, "unknown"));

        let events = sender.events();
        assert_eq!(events.len(), 3);
        assert_eq!(sender.states(), vec![EquipmentState::Ok]);
        assert_eq!(sender.values_for(TagId(1)).len(), 1);
        assert_eq!(
            sender.invalidations_for(TagId(2))[0].code,
            QualityCode::NodeNotFound
        );
    }

    #[tokio::test]
    async fn wait_for_observes_late_events() {
        let sender = RecordingSender::new();
        let writer = sender.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            writer.on_equipment_state_update(EquipmentState::ConnectionLost);
        });
        let seen = sender
            .wait_for(Duration::from_secs(1), |events| {
                events.contains(&SenderEvent::State(EquipmentState::ConnectionLost))
            })
            .await;
        assert!(seen);
    }
}
