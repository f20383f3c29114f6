//! ---
//! daq_section: "01-core-functionality"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Tag subscription bookkeeping and single-server endpoints."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
//! Single-server connection handle.
//!
//! Session events are consumed by one dispatcher task per session. The dispatcher
//! never awaits network calls itself; subscription recreation runs on spawned
//! tasks that stop with the session.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use r_daq_common::{DaqConfig, DaqError, DaqResult};
use r_daq_msg::{EquipmentState, MessageSender, Quality, QualityCode, ValueUpdate};
use r_daq_net::{
    ClientError, ClientHandle, DataValue, MonitoredItemRequest, NodeAddress, ProtocolClient,
    ProtocolConnector, RedundancyInfo, ServerState, SessionEvent, StatusCode, SubscriptionId,
};
use r_daq_resilience::RetryDelegate;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify::classify_error;
use crate::mapper::{GroupBatch, SubscriptionGroup, TagSubscriptionMapper};
use crate::quality::quality_from_status;
use crate::tag::{AddressRole, ItemDefinition};

const SERVICE_LEVEL_HANDLE: ClientHandle = ClientHandle(u32::MAX - 1);
const SERVER_STATE_HANDLE: ClientHandle = ClientHandle(u32::MAX);

/// Per-request limits of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSettings {
    /// Upper bound of every protocol request.
    pub request_timeout: Duration,
    /// Disconnection duration after which failures are long-lost.
    pub long_lost_threshold: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        EndpointSettings::from(&DaqConfig::default())
    }
}

impl From<&DaqConfig> for EndpointSettings {
    fn from(config: &DaqConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            long_lost_threshold: config.long_lost_threshold,
        }
    }
}

/// Collaborators shared by every endpoint of one equipment.
#[derive(Clone)]
pub struct EndpointContext {
    pub connector: Arc<dyn ProtocolConnector>,
    pub mapper: Arc<TagSubscriptionMapper>,
    pub sender: Arc<dyn MessageSender>,
    pub retry: RetryDelegate,
    pub settings: EndpointSettings,
}

impl fmt::Debug for EndpointContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointContext")
            .field("settings", &self.settings)
            .field("retry", self.retry.policy())
            .finish_non_exhaustive()
    }
}

/// Server health sample delivered to a health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthUpdate {
    ServiceLevel(u8),
    ServerState(ServerState),
}

struct HealthMonitor {
    subscription: SubscriptionId,
    publish_interval: Duration,
    updates: mpsc::UnboundedSender<HealthUpdate>,
}

struct Session {
    client: Arc<dyn ProtocolClient>,
    cancel: CancellationToken,
}

struct EndpointInner {
    uri: String,
    role: AddressRole,
    ctx: EndpointContext,
    session: RwLock<Option<Session>>,
    disconnected_since: Mutex<Option<Instant>>,
    health: Mutex<Option<HealthMonitor>>,
    activity: watch::Sender<bool>,
}

/// Connection handle for one server.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("uri", &self.inner.uri)
            .field("role", &self.inner.role)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Endpoint {
    /// Endpoint for `uri`, not yet connected.
    pub fn new(uri: impl Into<String>, role: AddressRole, ctx: EndpointContext) -> Self {
        let (activity, _) = watch::channel(false);
        Self {
            inner: Arc::new(EndpointInner {
                uri: uri.into(),
                role,
                ctx,
                session: RwLock::new(None),
                disconnected_since: Mutex::new(None),
                health: Mutex::new(None),
                activity,
            }),
        }
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn role(&self) -> AddressRole {
        self.inner.role
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.read().is_some()
    }

    /// Session activity flag; `false` while the session is lost or closed.
    pub fn activity(&self) -> watch::Receiver<bool> {
        self.inner.activity.subscribe()
    }

    /// How long the session has been lost, if it is.
    pub fn disconnected_for(&self) -> Option<Duration> {
        self.inner
            .disconnected_since
            .lock()
            .map(|since| since.elapsed())
    }

    /// Open a session.
    ///
    /// Transport failures are communication errors; unknown hosts and rejected
    /// credentials are configuration errors. Connecting twice is a no-op.
    pub async fn initialize(&self) -> DaqResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let uri = self.uri();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = self
            .call(
                "open_session",
                self.inner.ctx.connector.open_session(uri, events_tx),
            )
            .await?;

        let cancel = CancellationToken::new();
        *self.inner.disconnected_since.lock() = None;
        let previous = self.inner.session.write().replace(Session {
            client,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        tokio::spawn(dispatch(Arc::downgrade(&self.inner), events_rx, cancel));
        info!(uri, role = ?self.inner.role, "endpoint session opened");
        Ok(())
    }

    /// Close the session and stop everything bound to it. Never fails.
    pub async fn disconnect(&self) {
        let session = self.inner.session.write().take();
        self.inner.health.lock().take();
        *self.inner.disconnected_since.lock() = None;
        self.inner.activity.send_replace(false);

        let Some(session) = session else {
            return;
        };
        session.cancel.cancel();
        match self.request(session.client.close()).await {
            Ok(()) => info!(uri = %self.uri(), "endpoint session closed"),
            Err(err) => debug!(uri = %self.uri(), error = %err, "closing session failed"),
        }
    }

    /// Apply groups to the session: one subscription per group, one bulk item request
    /// per group.
    ///
    /// Items that the server rejects are reported with a bad quality and are not
    /// added to their group; the rest of the batch is unaffected.
    pub async fn subscribe(&self, batch: &GroupBatch) -> DaqResult<HashMap<ClientHandle, Quality>> {
        let mut qualities = HashMap::new();
        for (group, definitions) in batch {
            for (definition, quality) in self.apply_group(group, definitions).await? {
                qualities.insert(definition.handle, quality);
            }
        }
        Ok(qualities)
    }

    /// Remove the item behind `handle`; the group's subscription is deleted once
    /// the group is empty. Returns `false` for unknown handles.
    pub async fn unsubscribe(&self, handle: ClientHandle) -> DaqResult<bool> {
        let mapper = &self.inner.ctx.mapper;
        let Some(tag) = mapper.get_tag_id(handle) else {
            return Ok(false);
        };
        let Some(group) = mapper.deadband_group(tag) else {
            return Ok(mapper.remove_tag(tag));
        };

        // Waits for an in-flight apply of the same group so the item it creates
        // is deleted below.
        let _apply = group.lock_apply().await;
        if mapper.get_tag_id(handle) != Some(tag) {
            return Ok(false);
        }
        if let Some(subscription) = group.subscription() {
            if group.is_monitored(handle) {
                let client = self.client()?;
                self.call(
                    "delete_monitored_items",
                    client.delete_monitored_items(subscription, &[handle]),
                )
                .await?;
                group.unmark_monitored(handle);
            }
        }

        let removed = mapper.remove_tag(tag);
        if group.is_empty() {
            if let Some(subscription) = group.subscription() {
                group.set_subscription(None);
                if let Some(client) = self.current_client() {
                    if let Err(err) = self
                        .call("delete_subscription", client.delete_subscription(subscription))
                        .await
                    {
                        warn!(uri = %self.uri(), subscription = %subscription, error = %err, "deleting empty subscription failed");
                    }
                }
            }
        }
        debug!(uri = %self.uri(), tag = %tag, handle = %handle, "tag unsubscribed");
        Ok(removed)
    }

    /// Read the current value of `node`.
    pub async fn read(&self, node: &NodeAddress) -> DaqResult<(Value, Quality)> {
        let client = self.client()?;
        let value = self.call("read", client.read_value(node)).await?;
        Ok((value.value, quality_from_status(value.status)))
    }

    /// Write `value` to `node`; `true` when the server accepted it.
    pub async fn write(&self, node: &NodeAddress, value: Value) -> DaqResult<bool> {
        let client = self.client()?;
        let status = self.call("write", client.write_value(node, value)).await?;
        if !status.is_good() {
            warn!(uri = %self.uri(), node = %node, status = %status, "write rejected");
        }
        Ok(status.is_good())
    }

    /// Redundancy capability reported by the server.
    pub async fn redundancy_info(&self) -> DaqResult<RedundancyInfo> {
        let client = self.client()?;
        self.call("redundancy_info", client.redundancy_info()).await
    }

    /// Subscribe to the service level and run state nodes.
    pub async fn monitor_health(
        &self,
        publish_interval: Duration,
    ) -> DaqResult<mpsc::UnboundedReceiver<HealthUpdate>> {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        self.stop_health_monitoring().await;
        self.start_health(publish_interval, updates_tx).await?;
        Ok(updates_rx)
    }

    /// Stop forwarding health samples and delete the health subscription.
    pub async fn stop_health_monitoring(&self) {
        let Some(monitor) = self.inner.health.lock().take() else {
            return;
        };
        if let Some(client) = self.current_client() {
            if let Err(err) = self
                .call(
                    "delete_subscription",
                    client.delete_subscription(monitor.subscription),
                )
                .await
            {
                debug!(uri = %self.uri(), error = %err, "deleting health subscription failed");
            }
        }
        info!(uri = %self.uri(), "health monitoring stopped");
    }

    async fn start_health(
        &self,
        publish_interval: Duration,
        updates: mpsc::UnboundedSender<HealthUpdate>,
    ) -> DaqResult<()> {
        let client = self.client()?;
        let subscription = self
            .call(
                "create_subscription",
                client.create_subscription(publish_interval),
            )
            .await?;
        *self.inner.health.lock() = Some(HealthMonitor {
            subscription,
            publish_interval,
            updates,
        });

        let requests = [
            (SERVICE_LEVEL_HANDLE, NodeAddress::SERVICE_LEVEL),
            (SERVER_STATE_HANDLE, NodeAddress::SERVER_STATE),
        ]
        .map(|(handle, node)| MonitoredItemRequest {
            handle,
            node,
            sampling_interval: publish_interval,
            filter: None,
        });
        match self
            .call(
                "create_monitored_items",
                client.create_monitored_items(subscription, &requests),
            )
            .await
        {
            Ok(statuses) => {
                for (request, status) in requests.iter().zip(statuses) {
                    if !status.is_good() {
                        warn!(uri = %self.uri(), node = %request.node, status = %status, "health node not monitored");
                    }
                }
            }
            Err(err) => {
                self.inner.health.lock().take();
                let _ = self.request(client.delete_subscription(subscription)).await;
                return Err(err);
            }
        }
        info!(uri = %self.uri(), publish_interval_ms = publish_interval.as_millis() as u64, "health monitoring armed");
        Ok(())
    }

    async fn apply_group(
        &self,
        group: &Arc<SubscriptionGroup>,
        definitions: &[Arc<ItemDefinition>],
    ) -> DaqResult<Vec<(Arc<ItemDefinition>, Quality)>> {
        let _apply = group.lock_apply().await;
        let mapper = &self.inner.ctx.mapper;
        let (known, removed): (Vec<_>, Vec<_>) = definitions
            .iter()
            .cloned()
            .partition(|definition| mapper.get_tag_id(definition.handle) == Some(definition.tag));
        let mut results: Vec<_> = removed
            .into_iter()
            .map(|definition| (definition, removed_while_subscribing()))
            .collect();
        if known.is_empty() {
            return Ok(results);
        }

        let client = self.client()?;
        let subscription = match group.subscription() {
            Some(subscription) => subscription,
            None => {
                let subscription = self
                    .call(
                        "create_subscription",
                        client.create_subscription(group.publish_interval()),
                    )
                    .await?;
                group.set_subscription(Some(subscription));
                debug!(uri = %self.uri(), subscription = %subscription, publish_interval_ms = group.publish_interval().as_millis() as u64, "subscription created");
                subscription
            }
        };

        let (pending, existing): (Vec<_>, Vec<_>) = known
            .into_iter()
            .partition(|definition| !group.is_monitored(definition.handle));
        results.extend(
            existing
                .into_iter()
                .map(|definition| (definition, Quality::good())),
        );
        if pending.is_empty() {
            return Ok(results);
        }

        let requests: Vec<MonitoredItemRequest> = pending
            .iter()
            .map(|definition| MonitoredItemRequest {
                handle: definition.handle,
                node: definition.address_for(self.inner.role).clone(),
                sampling_interval: group.publish_interval(),
                filter: group.deadband().filter(),
            })
            .collect();
        let statuses = match self
            .request(client.create_monitored_items(subscription, &requests))
            .await
        {
            Ok(statuses) => statuses,
            Err(err) => {
                if err
                    .status()
                    .is_some_and(|status| status.matches(StatusCode::BAD_SUBSCRIPTION_ID_INVALID))
                {
                    group.set_subscription(None);
                }
                return Err(self.classify(&err));
            }
        };

        let mut orphaned = Vec::new();
        for (index, definition) in pending.into_iter().enumerate() {
            let status = statuses
                .get(index)
                .copied()
                .unwrap_or(StatusCode::BAD_UNEXPECTED_ERROR);
            if !status.is_good() {
                debug!(uri = %self.uri(), tag = %definition.tag, node = %definition.node, status = %status, "monitored item rejected");
                results.push((definition, quality_from_status(status)));
                continue;
            }
            match mapper.add_tag_to_group(definition.tag) {
                Ok(_) => {
                    group.mark_monitored(definition.handle);
                    results.push((definition, quality_from_status(status)));
                }
                Err(err) => {
                    debug!(uri = %self.uri(), tag = %definition.tag, error = %err, "tag removed while subscribing");
                    orphaned.push(definition.handle);
                    results.push((definition, removed_while_subscribing()));
                }
            }
        }
        if !orphaned.is_empty() {
            if let Err(err) = self
                .call(
                    "delete_monitored_items",
                    client.delete_monitored_items(subscription, &orphaned),
                )
                .await
            {
                warn!(uri = %self.uri(), subscription = %subscription, items = orphaned.len(), error = %err, "deleting items of removed tags failed");
            }
        }
        if group.is_empty() {
            group.set_subscription(None);
            if let Err(err) = self
                .call("delete_subscription", client.delete_subscription(subscription))
                .await
            {
                warn!(uri = %self.uri(), subscription = %subscription, error = %err, "deleting empty subscription failed");
            }
        }
        Ok(results)
    }

    async fn recreate_subscription(&self, lost: SubscriptionId, cancel: CancellationToken) {
        let retry = &self.inner.ctx.retry;
        let health = {
            let mut health = self.inner.health.lock();
            match health.as_ref() {
                Some(monitor) if monitor.subscription == lost => health.take(),
                _ => None,
            }
        };
        if let Some(monitor) = health {
            let result = retry
                .run("recreate_health_subscription", &cancel, |_| {
                    self.start_health(monitor.publish_interval, monitor.updates.clone())
                })
                .await;
            if let Err(err) = result {
                if err != DaqError::Cancelled {
                    error!(uri = %self.uri(), error = %err, "health subscription could not be recreated");
                }
            }
            return;
        }

        let Some(group) = self.inner.ctx.mapper.group_for_subscription(lost) else {
            debug!(uri = %self.uri(), subscription = %lost, "no group owns the lost subscription");
            return;
        };
        group.set_subscription(None);
        info!(uri = %self.uri(), subscription = %lost, tags = group.size(), "recreating subscription after failed transfer");

        let result = retry
            .run("recreate_subscription", &cancel, |_| {
                let group = group.clone();
                async move { self.apply_group(&group, &group.definitions()).await }
            })
            .await;
        let sender = &self.inner.ctx.sender;
        match result {
            Ok(results) => {
                self.record_recreation(true);
                for (definition, quality) in results {
                    if !quality.is_valid() {
                        sender.on_tag_invalid(definition.tag, quality);
                    }
                }
                info!(uri = %self.uri(), subscription = ?group.subscription(), "subscription recreated");
            }
            Err(DaqError::Cancelled) => {
                debug!(uri = %self.uri(), "subscription recreation cancelled");
            }
            Err(err) => {
                self.record_recreation(false);
                error!(uri = %self.uri(), error = %err, "subscription recreation abandoned");
                for definition in group.definitions() {
                    sender.on_tag_invalid(
                        definition.tag,
                        Quality::new(QualityCode::Unreachable, err.to_string()),
                    );
                }
            }
        }
    }

    fn record_recreation(&self, success: bool) {
        if let Some(metrics) = self.inner.ctx.retry.metrics() {
            metrics.record_subscription_recreation(success);
        }
    }

    fn handle_event(&self, event: SessionEvent, cancel: &CancellationToken) {
        let sender = &self.inner.ctx.sender;
        match event {
            SessionEvent::SessionActivity { active: false } => {
                self.inner
                    .disconnected_since
                    .lock()
                    .get_or_insert_with(Instant::now);
                warn!(uri = %self.uri(), "session lost");
                sender.on_equipment_state_update(EquipmentState::ConnectionLost);
                self.inner.activity.send_replace(false);
            }
            SessionEvent::SessionActivity { active: true } => {
                *self.inner.disconnected_since.lock() = None;
                info!(uri = %self.uri(), "session active");
                sender.on_equipment_state_update(EquipmentState::Ok);
                self.inner.activity.send_replace(true);
            }
            SessionEvent::DataChange {
                subscription,
                handle,
                value,
            } => self.route_value(subscription, handle, value),
            SessionEvent::SubscriptionTransferFailed { subscription } => {
                let endpoint = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    endpoint.recreate_subscription(subscription, cancel).await;
                });
            }
        }
    }

    fn route_value(&self, subscription: SubscriptionId, handle: ClientHandle, value: DataValue) {
        if self.forward_health(subscription, handle, &value) {
            return;
        }
        let Some(tag) = self.inner.ctx.mapper.get_tag_id(handle) else {
            debug!(uri = %self.uri(), handle = %handle, "value for unknown handle dropped");
            return;
        };
        let sender = &self.inner.ctx.sender;
        let quality = quality_from_status(value.status);
        let bad = value.status.is_bad();
        sender.on_value_update(
            tag,
            ValueUpdate::new(value.value, quality.clone(), value.source_timestamp),
        );
        if bad {
            sender.on_tag_invalid(tag, quality);
        }
    }

    fn forward_health(
        &self,
        subscription: SubscriptionId,
        handle: ClientHandle,
        value: &DataValue,
    ) -> bool {
        let health = self.inner.health.lock();
        let Some(monitor) = health
            .as_ref()
            .filter(|monitor| monitor.subscription == subscription)
        else {
            return false;
        };
        if value.status.is_bad() {
            debug!(uri = %self.uri(), handle = %handle, status = %value.status, "bad health sample ignored");
            return true;
        }
        let update = match handle {
            SERVICE_LEVEL_HANDLE => value
                .value
                .as_u64()
                .map(|level| HealthUpdate::ServiceLevel(level.min(u64::from(u8::MAX)) as u8)),
            SERVER_STATE_HANDLE => value
                .value
                .as_i64()
                .map(|state| HealthUpdate::ServerState(ServerState::from_value(state))),
            _ => None,
        };
        match update {
            Some(update) => {
                let _ = monitor.updates.send(update);
            }
            None => debug!(uri = %self.uri(), handle = %handle, value = %value.value, "unexpected health sample"),
        }
        true
    }

    fn current_client(&self) -> Option<Arc<dyn ProtocolClient>> {
        self.inner
            .session
            .read()
            .as_ref()
            .map(|session| session.client.clone())
    }

    fn client(&self) -> DaqResult<Arc<dyn ProtocolClient>> {
        self.current_client()
            .ok_or_else(|| self.classify(&ClientError::NotConnected))
    }

    fn classify(&self, err: &ClientError) -> DaqError {
        classify_error(
            err,
            self.disconnected_for(),
            self.inner.ctx.settings.long_lost_threshold,
        )
    }

    async fn request<T, F>(&self, fut: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        match timeout(self.inner.ctx.settings.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn call<T, F>(&self, operation: &str, fut: F) -> DaqResult<T>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        self.request(fut).await.map_err(|err| {
            let classified = self.classify(&err);
            debug!(uri = %self.uri(), operation, error = %err, kind = %classified.kind(), "request failed");
            classified
        })
    }
}

async fn dispatch(
    endpoint: Weak<EndpointInner>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = endpoint.upgrade() else {
            break;
        };
        Endpoint { inner }.handle_event(event, &cancel);
    }
    debug!("session dispatcher stopped");
}
fn removed_while_subscribing() -> Quality {
    Quality::new(QualityCode::Unknown, "tag removed while subscribing")
}

