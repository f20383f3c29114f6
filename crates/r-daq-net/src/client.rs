//! ---
//! daq_section: "05-networking-external-interfaces"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Protocol client seam and protocol value types."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::types::{
    ClientHandle, DataValue, MonitoredItemRequest, NodeAddress, RedundancyInfo, StatusCode,
    SubscriptionId,
};

/// Asynchronous notification raised by an open session.
///
/// Events of one session are delivered in order through its [`SessionEventSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session became usable (`true`) or was lost (`false`).
    SessionActivity {
        /// New activity flag.
        active: bool,
    },
    /// A monitored item reported a value.
    DataChange {
        /// Subscription owning the item.
        subscription: SubscriptionId,
        /// Handle supplied when the item was created.
        handle: ClientHandle,
        /// Reported value.
        value: DataValue,
    },
    /// After a session recovery the server could not carry the subscription over.
    SubscriptionTransferFailed {
        /// Subscription that is gone on the server.
        subscription: SubscriptionId,
    },
}

/// Channel through which a session publishes its [`SessionEvent`]s.
pub type SessionEventSink = mpsc::UnboundedSender<SessionEvent>;

/// Factory for protocol sessions.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    /// Open a session against `uri`; session events are pushed into `events` until
    /// the session is closed.
    async fn open_session(
        &self,
        uri: &str,
        events: SessionEventSink,
    ) -> Result<Arc<dyn ProtocolClient>, ClientError>;
}

/// Operations available on one open session.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// URI the session is connected to.
    fn uri(&self) -> &str;

    /// Create a subscription publishing at `publish_interval`.
    async fn create_subscription(
        &self,
        publish_interval: Duration,
    ) -> Result<SubscriptionId, ClientError>;

    /// Delete a subscription and all its monitored items.
    async fn delete_subscription(&self, subscription: SubscriptionId) -> Result<(), ClientError>;

    /// Create monitored items; one status per request, in request order.
    async fn create_monitored_items(
        &self,
        subscription: SubscriptionId,
        items: &[MonitoredItemRequest],
    ) -> Result<Vec<StatusCode>, ClientError>;

    /// Delete monitored items by handle.
    async fn delete_monitored_items(
        &self,
        subscription: SubscriptionId,
        handles: &[ClientHandle],
    ) -> Result<(), ClientError>;

    /// Read the current value of a node.
    async fn read_value(&self, node: &NodeAddress) -> Result<DataValue, ClientError>;

    /// Write a value; the returned status is the per-node write result.
    async fn write_value(&self, node: &NodeAddress, value: Value)
        -> Result<StatusCode, ClientError>;

    /// Query the redundancy capability of the server.
    async fn redundancy_info(&self) -> Result<RedundancyInfo, ClientError>;

    /// Close the session. Closing twice is not an error.
    async fn close(&self) -> Result<(), ClientError>;
}
