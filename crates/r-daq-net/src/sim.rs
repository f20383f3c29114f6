//! ---
//! daq_section: "05-networking-external-interfaces"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Protocol client seam and protocol value types."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
//! In-memory protocol server used by tests and local runs.
//!
//! A [`SimulatedServer`] keeps an address space of node values and at most one
//! session. Reachability, latency and per-operation failures are scriptable, and
//! helpers drive the session events a real client library would raise.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::client::{ProtocolClient, ProtocolConnector, SessionEvent, SessionEventSink};
use crate::error::ClientError;
use crate::types::{
    ClientHandle, DataValue, MonitoredItemRequest, NodeAddress, RedundancyInfo, ServerState,
    StatusCode, SubscriptionId,
};

/// Client operation, used to script failures and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`ProtocolConnector::open_session`]
    OpenSession,
    /// [`ProtocolClient::create_subscription`]
    CreateSubscription,
    /// [`ProtocolClient::delete_subscription`]
    DeleteSubscription,
    /// [`ProtocolClient::create_monitored_items`]
    CreateMonitoredItems,
    /// [`ProtocolClient::delete_monitored_items`]
    DeleteMonitoredItems,
    /// [`ProtocolClient::read_value`]
    Read,
    /// [`ProtocolClient::write_value`]
    Write,
    /// [`ProtocolClient::redundancy_info`]
    RedundancyInfo,
    /// [`ProtocolClient::close`]
    Close,
}

#[derive(Debug, Default)]
struct SimSubscription {
    items: HashMap<ClientHandle, NodeAddress>,
}

#[derive(Debug)]
struct SimSession {
    id: u64,
    events: SessionEventSink,
    active: bool,
    subscriptions: HashMap<SubscriptionId, SimSubscription>,
}

impl SimSession {
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!(session = self.id, "session event receiver dropped");
        }
    }
}

fn active_session(slot: &mut Option<SimSession>, id: u64) -> Result<&mut SimSession, ClientError> {
    match slot.as_mut() {
        Some(session) if session.id == id => {
            if session.active {
                Ok(session)
            } else {
                Err(ClientError::Status(StatusCode::BAD_CONNECTION_CLOSED))
            }
        }
        _ => Err(ClientError::Status(StatusCode::BAD_SESSION_CLOSED)),
    }
}

#[derive(Debug)]
struct ServerInner {
    reachable: bool,
    latency: Duration,
    nodes: HashMap<NodeAddress, DataValue>,
    redundancy: Result<RedundancyInfo, ClientError>,
    scripted: HashMap<Operation, VecDeque<ClientError>>,
    calls: HashMap<Operation, u32>,
    session: Option<SimSession>,
    next_session: u64,
    next_subscription: u32,
}

impl ServerInner {
    fn record(&mut self, op: Operation) -> Result<(), ClientError> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(err) = self.scripted.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        if !self.reachable {
            return Err(ClientError::Transport("connection refused".into()));
        }
        Ok(())
    }

    fn session_mut(&mut self, id: u64) -> Result<&mut SimSession, ClientError> {
        active_session(&mut self.session, id)
    }

    fn publish(&self, node: &NodeAddress, value: &DataValue) {
        let Some(session) = self.session.as_ref().filter(|session| session.active) else {
            return;
        };
        for (subscription, state) in &session.subscriptions {
            for (handle, item) in &state.items {
                if item == node {
                    session.emit(SessionEvent::DataChange {
                        subscription: *subscription,
                        handle: *handle,
                        value: value.clone(),
                    });
                }
            }
        }
    }
}

/// Scriptable in-memory server.
#[derive(Debug, Clone)]
pub struct SimulatedServer {
    uri: Arc<str>,
    inner: Arc<Mutex<ServerInner>>,
}

impl SimulatedServer {
    /// Reachable server with healthy service level and a running state.
    pub fn new(uri: impl Into<String>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(NodeAddress::SERVICE_LEVEL, DataValue::good(255));
        nodes.insert(
            NodeAddress::SERVER_STATE,
            DataValue::good(ServerState::Running.value()),
        );
        let uri: String = uri.into();
        Self {
            uri: Arc::from(uri),
            inner: Arc::new(Mutex::new(ServerInner {
                reachable: true,
                latency: Duration::ZERO,
                nodes,
                redundancy: Ok(RedundancyInfo::default()),
                scripted: HashMap::new(),
                calls: HashMap::new(),
                session: None,
                next_session: 1,
                next_subscription: 1,
            })),
        }
    }

    /// URI the server answers on.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Builder variant of [`SimulatedServer::set_value`].
    pub fn with_node(self, node: NodeAddress, value: impl Into<Value>) -> Self {
        self.set_value(&node, value);
        self
    }

    /// Builder variant of [`SimulatedServer::set_redundancy`].
    pub fn with_redundancy(self, info: RedundancyInfo) -> Self {
        self.set_redundancy(info);
        self
    }

    /// Store a good value and notify every monitored item on the node.
    pub fn set_value(&self, node: &NodeAddress, value: impl Into<Value>) {
        self.set_data_value(node, DataValue::good(value));
    }

    /// Store a value with explicit status and notify monitored items.
    pub fn set_data_value(&self, node: &NodeAddress, value: DataValue) {
        let mut inner = self.inner.lock();
        inner.publish(node, &value);
        inner.nodes.insert(node.clone(), value);
    }

    /// Remove a node from the address space.
    pub fn remove_node(&self, node: &NodeAddress) {
        self.inner.lock().nodes.remove(node);
    }

    /// Current value of a node.
    pub fn value(&self, node: &NodeAddress) -> Option<DataValue> {
        self.inner.lock().nodes.get(node).cloned()
    }

    /// Update the service level health node.
    pub fn set_service_level(&self, level: u8) {
        self.set_value(&NodeAddress::SERVICE_LEVEL, level);
    }

    /// Update the run state health node.
    pub fn set_server_state(&self, state: ServerState) {
        self.set_value(&NodeAddress::SERVER_STATE, state.value());
    }

    /// Redundancy capability returned by the capability query.
    pub fn set_redundancy(&self, info: RedundancyInfo) {
        self.inner.lock().redundancy = Ok(info);
    }

    /// Make the capability query fail with `error`.
    pub fn fail_redundancy_query(&self, error: ClientError) {
        self.inner.lock().redundancy = Err(error);
    }

    /// Delay applied before every request is answered.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Toggle reachability. Going offline drops the open session.
    pub fn set_reachable(&self, reachable: bool) {
        let mut inner = self.inner.lock();
        inner.reachable = reachable;
        if !reachable {
            if let Some(session) = inner.session.as_mut().filter(|session| session.active) {
                session.active = false;
                session.emit(SessionEvent::SessionActivity { active: false });
            }
        }
    }

    /// Fail the next call of `op` with `error`.
    pub fn fail_next(&self, op: Operation, error: ClientError) {
        self.fail_times(op, 1, error);
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_times(&self, op: Operation, times: usize, error: ClientError) {
        let mut inner = self.inner.lock();
        let queue = inner.scripted.entry(op).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Number of calls of `op` received so far, failed ones included.
    pub fn calls(&self, op: Operation) -> u32 {
        self.inner.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Whether a session is open and active.
    pub fn session_active(&self) -> bool {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|session| session.active)
            .unwrap_or(false)
    }

    /// Whether any session, active or not, is held.
    pub fn has_session(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    /// Number of subscriptions of the open session.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|session| session.subscriptions.len())
            .unwrap_or(0)
    }

    /// Number of monitored items across the subscriptions of the open session.
    pub fn monitored_item_count(&self) -> usize {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|session| {
                session
                    .subscriptions
                    .values()
                    .map(|subscription| subscription.items.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Mark the session lost, as a broken connection would.
    pub fn drop_session(&self) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.session.as_mut().filter(|session| session.active) {
            session.active = false;
            session.emit(SessionEvent::SessionActivity { active: false });
        }
    }

    /// Reactivate a lost session with its subscriptions intact.
    pub fn restore_session(&self) {
        let mut inner = self.inner.lock();
        inner.reachable = true;
        if let Some(session) = inner.session.as_mut().filter(|session| !session.active) {
            session.active = true;
            session.emit(SessionEvent::SessionActivity { active: true });
        }
    }

    /// Reactivate a lost session whose subscriptions could not be transferred.
    pub fn restore_session_without_subscriptions(&self) {
        let mut inner = self.inner.lock();
        inner.reachable = true;
        if let Some(session) = inner.session.as_mut() {
            let lost: Vec<SubscriptionId> = session.subscriptions.drain().map(|(id, _)| id).collect();
            if !session.active {
                session.active = true;
                session.emit(SessionEvent::SessionActivity { active: true });
            }
            for subscription in lost {
                session.emit(SessionEvent::SubscriptionTransferFailed { subscription });
            }
        }
    }

    async fn begin(&self, op: Operation) -> Result<(), ClientError> {
        let latency = self.inner.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.inner.lock().record(op)
    }

    async fn open(&self, events: SessionEventSink) -> Result<u64, ClientError> {
        self.begin(Operation::OpenSession).await?;
        let mut inner = self.inner.lock();
        let id = inner.next_session;
        inner.next_session += 1;
        let session = SimSession {
            id,
            events,
            active: true,
            subscriptions: HashMap::new(),
        };
        session.emit(SessionEvent::SessionActivity { active: true });
        inner.session = Some(session);
        debug!(uri = %self.uri, session = id, "simulated session opened");
        Ok(id)
    }
}

/// Connector resolving URIs to registered [`SimulatedServer`]s.
#[derive(Debug, Clone, Default)]
pub struct SimulatedConnector {
    servers: Arc<Mutex<HashMap<String, SimulatedServer>>>,
}

impl SimulatedConnector {
    /// Connector without servers; every URI is an unknown host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder variant of [`SimulatedConnector::register`].
    pub fn with_server(self, server: SimulatedServer) -> Self {
        self.register(server);
        self
    }

    /// Make `server` reachable under its URI.
    pub fn register(&self, server: SimulatedServer) {
        self.servers.lock().insert(server.uri().to_owned(), server);
    }

    /// Registered server for `uri`.
    pub fn server(&self, uri: &str) -> Option<SimulatedServer> {
        self.servers.lock().get(uri).cloned()
    }
}

#[async_trait]
impl ProtocolConnector for SimulatedConnector {
    async fn open_session(
        &self,
        uri: &str,
        events: SessionEventSink,
    ) -> Result<Arc<dyn ProtocolClient>, ClientError> {
        let server = self
            .server(uri)
            .ok_or_else(|| ClientError::UnknownHost(uri.to_owned()))?;
        let session = server.open(events).await?;
        Ok(Arc::new(SimulatedClient { server, session }))
    }
}

struct SimulatedClient {
    server: SimulatedServer,
    session: u64,
}

#[async_trait]
impl ProtocolClient for SimulatedClient {
    fn uri(&self) -> &str {
        self.server.uri()
    }

    async fn create_subscription(
        &self,
        _publish_interval: Duration,
    ) -> Result<SubscriptionId, ClientError> {
        self.server.begin(Operation::CreateSubscription).await?;
        let mut inner = self.server.inner.lock();
        let id = SubscriptionId(inner.next_subscription);
        inner.next_subscription += 1;
        inner
            .session_mut(self.session)?
            .subscriptions
            .insert(id, SimSubscription::default());
        Ok(id)
    }

    async fn delete_subscription(&self, subscription: SubscriptionId) -> Result<(), ClientError> {
        self.server.begin(Operation::DeleteSubscription).await?;
        let mut inner = self.server.inner.lock();
        inner
            .session_mut(self.session)?
            .subscriptions
            .remove(&subscription)
            .map(|_| ())
            .ok_or(ClientError::Status(StatusCode::BAD_SUBSCRIPTION_ID_INVALID))
    }

    async fn create_monitored_items(
        &self,
        subscription: SubscriptionId,
        items: &[MonitoredItemRequest],
    ) -> Result<Vec<StatusCode>, ClientError> {
        self.server.begin(Operation::CreateMonitoredItems).await?;
        let mut guard = self.server.inner.lock();
        let inner = &mut *guard;
        let session = active_session(&mut inner.session, self.session)?;
        let state = session
            .subscriptions
            .get_mut(&subscription)
            .ok_or(ClientError::Status(StatusCode::BAD_SUBSCRIPTION_ID_INVALID))?;

        let mut statuses = Vec::with_capacity(items.len());
        let mut initial = Vec::new();
        for item in items {
            match inner.nodes.get(&item.node) {
                Some(value) => {
                    state.items.insert(item.handle, item.node.clone());
                    initial.push((item.handle, value.clone()));
                    statuses.push(StatusCode::GOOD);
                }
                None => statuses.push(StatusCode::BAD_NODE_ID_UNKNOWN),
            }
        }
        for (handle, value) in initial {
            session.emit(SessionEvent::DataChange {
                subscription,
                handle,
                value,
            });
        }
        Ok(statuses)
    }

    async fn delete_monitored_items(
        &self,
        subscription: SubscriptionId,
        handles: &[ClientHandle],
    ) -> Result<(), ClientError> {
        self.server.begin(Operation::DeleteMonitoredItems).await?;
        let mut inner = self.server.inner.lock();
        let state = inner
            .session_mut(self.session)?
            .subscriptions
            .get_mut(&subscription)
            .ok_or(ClientError::Status(StatusCode::BAD_SUBSCRIPTION_ID_INVALID))?;
        for handle in handles {
            state.items.remove(handle);
        }
        Ok(())
    }

    async fn read_value(&self, node: &NodeAddress) -> Result<DataValue, ClientError> {
        self.server.begin(Operation::Read).await?;
        let mut inner = self.server.inner.lock();
        inner.session_mut(self.session)?;
        Ok(inner.nodes.get(node).cloned().unwrap_or(DataValue {
            value: Value::Null,
            status: StatusCode::BAD_NODE_ID_UNKNOWN,
            source_timestamp: None,
        }))
    }

    async fn write_value(
        &self,
        node: &NodeAddress,
        value: Value,
    ) -> Result<StatusCode, ClientError> {
        self.server.begin(Operation::Write).await?;
        let mut inner = self.server.inner.lock();
        inner.session_mut(self.session)?;
        if !inner.nodes.contains_key(node) {
            return Ok(StatusCode::BAD_NODE_ID_UNKNOWN);
        }
        let value = DataValue::good(value);
        inner.publish(node, &value);
        inner.nodes.insert(node.clone(), value);
        Ok(StatusCode::GOOD)
    }

    async fn redundancy_info(&self) -> Result<RedundancyInfo, ClientError> {
        self.server.begin(Operation::RedundancyInfo).await?;
        let mut inner = self.server.inner.lock();
        inner.session_mut(self.session)?;
        inner.redundancy.clone()
    }

    async fn close(&self) -> Result<(), ClientError> {
        let mut inner = self.server.inner.lock();
        *inner.calls.entry(Operation::Close).or_default() += 1;
        if inner.session.as_ref().map(|session| session.id) == Some(self.session) {
            inner.session = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RedundancySupport;
    use tokio::sync::mpsc;

    fn item(handle: u32, node: NodeAddress) -> MonitoredItemRequest {
        MonitoredItemRequest {
            handle: ClientHandle(handle),
            node,
            sampling_interval: Duration::from_millis(500),
            filter: None,
        }
    }

    #[tokio::test]
    async fn unknown_uri_is_an_unknown_host() {
        let connector = SimulatedConnector::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = connector
            .open_session("opc.tcp://nowhere:4840", tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::UnknownHost(_)));
    }

    #[tokio::test]
    async fn monitored_items_report_per_item_status_and_initial_values() {
        let temperature = NodeAddress::string(2, "Temperature");
        let server =
            SimulatedServer::new("opc.tcp://primary:4840").with_node(temperature.clone(), 21.5);
        let connector = SimulatedConnector::new().with_server(server.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = connector.open_session(server.uri(), tx).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::SessionActivity { active: true })
        );

        let subscription = client
            .create_subscription(Duration::from_millis(500))
            .await
            .unwrap();
        let statuses = client
            .create_monitored_items(
                subscription,
                &[
                    item(1, temperature.clone()),
                    item(2, NodeAddress::string(2, "Missing")),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            statuses,
            vec![StatusCode::GOOD, StatusCode::BAD_NODE_ID_UNKNOWN]
        );
        assert_eq!(server.monitored_item_count(), 1);

        match rx.recv().await {
            Some(SessionEvent::DataChange { handle, value, .. }) => {
                assert_eq!(handle, ClientHandle(1));
                assert_eq!(value.value, serde_json::json!(21.5));
            }
            other => panic!("unexpected event {other:?}"),
        }

        server.set_value(&temperature, 22.0);
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::DataChange { handle: ClientHandle(1), .. })
        ));
    }

    #[tokio::test]
    async fn scripted_failures_and_lost_sessions() {
        let server = SimulatedServer::new("opc.tcp://primary:4840").with_redundancy(RedundancyInfo {
            support: RedundancySupport::Cold,
            server_uris: vec!["opc.tcp://backup:4840".into()],
        });
        let connector = SimulatedConnector::new().with_server(server.clone());

        server.fail_next(Operation::OpenSession, ClientError::Timeout);
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(connector.open_session(server.uri(), tx.clone()).await.is_err());
        let client = connector.open_session(server.uri(), tx).await.unwrap();
        assert_eq!(server.calls(Operation::OpenSession), 2);
        assert_eq!(
            client.redundancy_info().await.unwrap().support,
            RedundancySupport::Cold
        );

        server.drop_session();
        let err = client
            .read_value(&NodeAddress::SERVICE_LEVEL)
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Status(StatusCode::BAD_CONNECTION_CLOSED));

        let subscription_lost = {
            server.restore_session();
            let sub = client
                .create_subscription(Duration::from_secs(1))
                .await
                .unwrap();
            server.drop_session();
            server.restore_session_without_subscriptions();
            sub
        };
        let mut seen_transfer_failure = false;
        while let Ok(event) = rx.try_recv() {
            if event
                == (SessionEvent::SubscriptionTransferFailed {
                    subscription: subscription_lost,
                })
            {
                seen_transfer_failure = true;
            }
        }
        assert!(seen_transfer_failure);
        assert_eq!(server.subscription_count(), 0);

        client.close().await.unwrap();
        assert!(!server.has_session());
    }
}
