//! ---
//! daq_section: "07-resilience-fault-tolerance"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Failover controller and redundancy modes."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use r_daq_common::{DaqConfig, DaqError, DaqResult};
use r_daq_core::{
    AddressRole, DataTag, Endpoint, EndpointContext, EndpointSettings, GroupBatch,
    TagSubscriptionMapper,
};
use r_daq_metrics::ConnectionMetrics;
use r_daq_msg::{EquipmentState, MessageSender, Quality, QualityCode, TagId, ValueUpdate};
use r_daq_net::ProtocolConnector;
use r_daq_resilience::{ResilienceMetrics, RetryDelegate, RetryPolicy};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::mode::{FailoverFactory, FailoverMode, NoFailover};
use crate::state::ControllerState;

/// Connection state shared between the controller and its failover mode.
pub(crate) struct ControllerShared {
    pub(crate) equipment: String,
    pub(crate) config: DaqConfig,
    pub(crate) ctx: EndpointContext,
    metrics: Option<ConnectionMetrics>,
    primary_uri: RwLock<Option<String>>,
    active: RwLock<Option<Endpoint>>,
    state: watch::Sender<ControllerState>,
}

impl ControllerShared {
    pub(crate) fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ControllerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(equipment = %self.equipment, from = %previous, to = %state, "controller state changed");
        }
    }

    pub(crate) fn notify(&self, state: EquipmentState) {
        self.ctx.sender.on_equipment_state_update(state);
    }

    pub(crate) fn active(&self) -> Option<Endpoint> {
        self.active.read().clone()
    }

    /// Swap the active endpoint, returning the previous one.
    pub(crate) fn set_active(&self, endpoint: Option<Endpoint>) -> Option<Endpoint> {
        let previous = std::mem::replace(&mut *self.active.write(), endpoint.clone());
        if let Some(metrics) = &self.metrics {
            if let Some(previous) = &previous {
                metrics.set_active(&self.equipment, previous.uri(), false);
            }
            if let Some(endpoint) = &endpoint {
                metrics.set_active(&self.equipment, endpoint.uri(), true);
            }
        }
        previous
    }

    /// Unconnected endpoint for `uri`; servers other than the first configured
    /// one use the redundant tag addresses.
    pub(crate) fn endpoint_for(&self, uri: &str) -> Endpoint {
        let role = match self.primary_uri.read().as_deref() {
            Some(primary) if primary != uri => AddressRole::Redundant,
            _ => AddressRole::Primary,
        };
        Endpoint::new(uri, role, self.ctx.clone())
    }

    /// Forget server-side subscription ids and return every known group.
    pub(crate) fn pending_restore(&self) -> GroupBatch {
        let mapper = &self.ctx.mapper;
        mapper.reset_subscriptions();
        mapper.batch()
    }

    /// Apply `batch` to `endpoint`, reporting the tags the server rejected.
    /// Groups and items already created by an earlier pass are reused.
    pub(crate) async fn apply_batch(&self, endpoint: &Endpoint, batch: &GroupBatch) -> DaqResult<()> {
        let qualities = endpoint.subscribe(batch).await?;
        for definition in batch.values().flatten() {
            if let Some(quality) = qualities
                .get(&definition.handle)
                .filter(|quality| !quality.is_valid())
            {
                self.ctx
                    .sender
                    .on_tag_invalid(definition.tag, quality.clone());
            }
        }
        info!(equipment = %self.equipment, uri = endpoint.uri(), groups = batch.len(), "subscriptions restored");
        Ok(())
    }

    /// Apply every known group to a freshly connected endpoint in one pass.
    pub(crate) async fn restore_subscriptions(&self, endpoint: &Endpoint) -> DaqResult<()> {
        let batch = self.pending_restore();
        if batch.is_empty() {
            return Ok(());
        }
        self.apply_batch(endpoint, &batch).await
    }

    /// Mark every tag of `batch` unreachable after its restore was given up.
    pub(crate) fn report_unrestored(&self, batch: &GroupBatch, err: &DaqError) {
        let reason = format!("subscription not restored: {err}");
        for definition in batch.values().flatten() {
            self.ctx.sender.on_tag_invalid(
                definition.tag,
                Quality::new(QualityCode::Unreachable, reason.clone()),
            );
        }
    }
}

/// Counts equipment state notifications before passing them on.
struct MeteredSender {
    inner: Arc<dyn MessageSender>,
    metrics: ConnectionMetrics,
    equipment: String,
}

impl MessageSender for MeteredSender {
    fn on_equipment_state_update(&self, state: EquipmentState) {
        self.metrics.record_state(&self.equipment, state.as_str());
        self.inner.on_equipment_state_update(state);
    }

    fn on_value_update(&self, tag: TagId, update: ValueUpdate) {
        self.inner.on_value_update(tag, update);
    }

    fn on_tag_invalid(&self, tag: TagId, quality: Quality) {
        self.inner.on_tag_invalid(tag, quality);
    }
}

/// Connection facade of one equipment.
///
/// Owns the active [`Endpoint`] and the [`FailoverMode`] chosen for it. The Tag
/// Subscription Mapper outlives connections: [`DaqController::stop`] keeps it and
/// the next connect re-applies its groups, [`DaqController::reset`] clears it.
pub struct DaqController {
    shared: Arc<ControllerShared>,
    mode: RwLock<Arc<dyn FailoverMode>>,
    cancel: Mutex<CancellationToken>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl fmt::Debug for DaqController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaqController")
            .field("equipment", &self.shared.equipment)
            .field("state", &self.state())
            .field("active", &self.active_uri())
            .field("mode", &self.mode.read().name())
            .finish()
    }
}

impl DaqController {
    /// Controller wired from configuration values.
    pub fn new(
        equipment: impl Into<String>,
        config: DaqConfig,
        connector: Arc<dyn ProtocolConnector>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        let ctx = EndpointContext {
            connector,
            mapper: Arc::new(TagSubscriptionMapper::new(config.min_time_deadband)),
            sender,
            retry: RetryDelegate::new(RetryPolicy::from(&config.retry), None),
            settings: EndpointSettings::from(&config),
        };
        Self::from_parts(equipment, config, ctx, None)
    }

    /// Controller over explicitly constructed collaborators.
    pub fn from_parts(
        equipment: impl Into<String>,
        config: DaqConfig,
        mut ctx: EndpointContext,
        metrics: Option<ConnectionMetrics>,
    ) -> Self {
        let equipment = equipment.into();
        if let Some(metrics) = &metrics {
            ctx.sender = Arc::new(MeteredSender {
                inner: ctx.sender,
                metrics: metrics.clone(),
                equipment: equipment.clone(),
            });
        }
        let (state, _) = watch::channel(ControllerState::Disconnected);
        let mode: Arc<dyn FailoverMode> = Arc::new(NoFailover);
        Self {
            shared: Arc::new(ControllerShared {
                equipment,
                config,
                ctx,
                metrics,
                primary_uri: RwLock::new(None),
                active: RwLock::new(None),
                state,
            }),
            mode: RwLock::new(mode),
            cancel: Mutex::new(CancellationToken::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Register connection and resilience metrics on `registry`.
    pub fn with_metrics(
        equipment: impl Into<String>,
        config: DaqConfig,
        connector: Arc<dyn ProtocolConnector>,
        sender: Arc<dyn MessageSender>,
        registry: r_daq_metrics::SharedRegistry,
    ) -> anyhow::Result<Self> {
        let connection = ConnectionMetrics::new(registry.clone())?;
        let resilience = ResilienceMetrics::new(registry)?;
        let ctx = EndpointContext {
            connector,
            mapper: Arc::new(TagSubscriptionMapper::new(config.min_time_deadband)),
            sender,
            retry: RetryDelegate::new(RetryPolicy::from(&config.retry), Some(resilience)),
            settings: EndpointSettings::from(&config),
        };
        Ok(Self::from_parts(equipment, config, ctx, Some(connection)))
    }

    pub fn equipment(&self) -> &str {
        &self.shared.equipment
    }

    pub fn mapper(&self) -> &Arc<TagSubscriptionMapper> {
        &self.shared.ctx.mapper
    }

    pub fn state(&self) -> ControllerState {
        self.shared.state()
    }

    /// Receiver observing every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ControllerState> {
        self.shared.state.subscribe()
    }

    /// URI of the server currently serving the equipment.
    pub fn active_uri(&self) -> Option<String> {
        self.shared
            .active()
            .map(|endpoint| endpoint.uri().to_owned())
    }

    /// Name of the redundancy mode in use.
    pub fn mode_name(&self) -> &'static str {
        self.mode.read().name()
    }

    /// Connect to the first reachable server of `uris`, then resolve redundancy.
    ///
    /// Each URI is tried under the retry policy before moving to the next one.
    /// An empty list is a configuration error; exhausting the list is a
    /// communication error. Both report `CONNECTION_FAILED`. A [`Self::stop`]
    /// arriving at any stage abandons the connection with [`DaqError::Cancelled`]
    /// and leaves the controller `DISCONNECTED`.
    pub async fn connect(&self, uris: &[String]) -> DaqResult<()> {
        if uris.is_empty() {
            error!(equipment = %self.shared.equipment, "no server address configured");
            self.fail();
            return Err(DaqError::configuration("no server address configured"));
        }
        let cancel = {
            let mut current = self.cancel.lock();
            if current.is_cancelled() {
                *current = CancellationToken::new();
            }
            current.clone()
        };
        let _lifecycle = self.lifecycle.lock().await;
        if cancel.is_cancelled() {
            return Err(DaqError::Cancelled);
        }
        if self.shared.active().is_some() {
            self.teardown().await;
        }

        *self.shared.primary_uri.write() = Some(uris[0].clone());
        self.shared.set_state(ControllerState::Connecting);

        let endpoint = match self.connect_first(uris, &cancel).await {
            Ok(endpoint) => endpoint,
            Err(DaqError::Cancelled) => {
                self.shared.set_state(ControllerState::Disconnected);
                return Err(DaqError::Cancelled);
            }
            Err(err) => {
                error!(equipment = %self.shared.equipment, error = %err, "connect abandoned");
                self.fail();
                return Err(err);
            }
        };
        self.shared.set_active(Some(endpoint.clone()));
        if cancel.is_cancelled() {
            return Err(self.abandon(&endpoint, None).await);
        }

        let batch = self.shared.pending_restore();
        if !batch.is_empty() {
            let restored = self
                .shared
                .ctx
                .retry
                .run("restore_subscriptions", &cancel, |_| {
                    self.shared.apply_batch(&endpoint, &batch)
                })
                .await;
            match restored {
                Ok(()) => {}
                Err(DaqError::Cancelled) => return Err(self.abandon(&endpoint, None).await),
                Err(err) => {
                    error!(equipment = %self.shared.equipment, uri = endpoint.uri(), error = %err, "known subscriptions could not be restored");
                    self.shared.report_unrestored(&batch, &err);
                }
            }
        }

        let plan = FailoverFactory::resolve(&self.shared.config.redundancy, &endpoint).await;
        if cancel.is_cancelled() {
            return Err(self.abandon(&endpoint, None).await);
        }
        let mode = FailoverFactory::create(
            &plan,
            self.shared.clone(),
            endpoint.uri(),
            cancel.child_token(),
        );
        let mode: Arc<dyn FailoverMode> = match mode.activate().await {
            Ok(()) => mode,
            Err(err) => {
                warn!(equipment = %self.shared.equipment, mode = mode.name(), error = %err, "failover supervision unavailable; serving a single server");
                mode.stop().await;
                Arc::new(NoFailover)
            }
        };
        if cancel.is_cancelled() {
            return Err(self.abandon(&endpoint, Some(&mode)).await);
        }
        info!(equipment = %self.shared.equipment, uri = endpoint.uri(), mode = mode.name(), alternates = ?plan.alternates, "connected");
        self.shared.set_state(mode.serving_state());
        *self.mode.write() = mode;
        Ok(())
    }

    /// Undo a connect preempted by [`Self::stop`].
    async fn abandon(&self, endpoint: &Endpoint, mode: Option<&Arc<dyn FailoverMode>>) -> DaqError {
        if let Some(mode) = mode {
            mode.stop().await;
        }
        self.shared.set_active(None);
        endpoint.disconnect().await;
        self.shared.set_state(ControllerState::Disconnected);
        info!(equipment = %self.shared.equipment, uri = endpoint.uri(), "connect cancelled");
        DaqError::Cancelled
    }

    async fn connect_first(
        &self,
        uris: &[String],
        cancel: &CancellationToken,
    ) -> DaqResult<Endpoint> {
        let retry = &self.shared.ctx.retry;
        let mut last_error = None;
        for uri in uris {
            let endpoint = self.shared.endpoint_for(uri);
            match retry.run("connect", cancel, |_| endpoint.initialize()).await {
                Ok(()) => return Ok(endpoint),
                Err(DaqError::Cancelled) => return Err(DaqError::Cancelled),
                Err(err) => {
                    warn!(equipment = %self.shared.equipment, uri = %uri, error = %err, "server unavailable");
                    last_error = Some(err);
                }
            }
        }
        let reason = last_error
            .map(|err| err.to_string())
            .unwrap_or_default();
        Err(DaqError::communication(format!(
            "none of {} servers could be connected: {}",
            uris.len(),
            reason
        )))
    }

    fn fail(&self) {
        self.shared.set_state(ControllerState::Failed);
        self.shared.notify(EquipmentState::ConnectionFailed);
    }

    /// Switch to the next redundant server. A no-op without redundancy or while a
    /// switch is already running.
    pub async fn trigger_switch(&self) -> bool {
        let mode = self.mode.read().clone();
        mode.trigger_switch().await
    }

    /// Subscribe `tags`, grouped by deadband, on the active server.
    ///
    /// Tags whose address cannot be resolved or that the server rejects are
    /// reported invalid and returned with a bad quality; the rest are unaffected.
    pub async fn subscribe(&self, tags: &[DataTag]) -> DaqResult<HashMap<TagId, Quality>> {
        let mapper = &self.shared.ctx.mapper;
        let sender = &self.shared.ctx.sender;
        let mut qualities = HashMap::with_capacity(tags.len());
        let mut batch = GroupBatch::new();
        for tag in tags {
            match mapper.get_or_create_definition(tag) {
                Ok(definition) => {
                    let definitions = batch.entry(mapper.group_for_tag(tag)).or_default();
                    if !definitions
                        .iter()
                        .any(|known| known.handle == definition.handle)
                    {
                        definitions.push(definition);
                    }
                }
                Err(err) => {
                    warn!(equipment = %self.shared.equipment, tag = %tag.id, error = %err, "tag address rejected");
                    let quality = Quality::new(QualityCode::NodeNotFound, err.to_string());
                    sender.on_tag_invalid(tag.id, quality.clone());
                    qualities.insert(tag.id, quality);
                }
            }
        }
        if batch.is_empty() {
            return Ok(qualities);
        }

        let endpoint = self.active_endpoint()?;
        let cancel = self.cancel.lock().clone();
        let results = self
            .shared
            .ctx
            .retry
            .run("subscribe", &cancel, |_| endpoint.subscribe(&batch))
            .await?;
        for definition in batch.values().flatten() {
            let quality = results
                .get(&definition.handle)
                .cloned()
                .unwrap_or_else(Quality::good);
            if !quality.is_valid() {
                sender.on_tag_invalid(definition.tag, quality.clone());
            }
            qualities.insert(definition.tag, quality);
        }
        debug!(equipment = %self.shared.equipment, tags = qualities.len(), groups = batch.len(), "tags subscribed");
        Ok(qualities)
    }

    /// Remove `tag`; `false` when it was not known.
    pub async fn unsubscribe(&self, tag: TagId) -> DaqResult<bool> {
        let mapper = &self.shared.ctx.mapper;
        let Some(definition) = mapper.definition(tag) else {
            return Ok(false);
        };
        let Some(endpoint) = self.shared.active() else {
            return Ok(mapper.remove_tag(tag));
        };
        let cancel = self.cancel.lock().clone();
        self.shared
            .ctx
            .retry
            .run("unsubscribe", &cancel, |_| endpoint.unsubscribe(definition.handle))
            .await
    }

    /// Read the current value of `tag` from the active server.
    pub async fn read(&self, tag: &DataTag) -> DaqResult<(Value, Quality)> {
        let definition = self.shared.ctx.mapper.get_or_create_definition(tag)?;
        let endpoint = self.active_endpoint()?;
        let node = definition.address_for(endpoint.role()).clone();
        let cancel = self.cancel.lock().clone();
        self.shared
            .ctx
            .retry
            .run("read", &cancel, |_| endpoint.read(&node))
            .await
    }

    /// Write `value` to `tag`; `true` when the server accepted it.
    pub async fn write(&self, tag: &DataTag, value: Value) -> DaqResult<bool> {
        let definition = self.shared.ctx.mapper.get_or_create_definition(tag)?;
        let endpoint = self.active_endpoint()?;
        let node = definition.address_for(endpoint.role()).clone();
        let cancel = self.cancel.lock().clone();
        self.shared
            .ctx
            .retry
            .run("write", &cancel, |_| endpoint.write(&node, value.clone()))
            .await
    }

    /// Disconnect every endpoint and stop supervision, preempting an in-flight
    /// switch or connect. Known tags are kept.
    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
        self.shared.set_state(ControllerState::Disconnected);
        info!(equipment = %self.shared.equipment, "controller stopped");
    }

    async fn teardown(&self) {
        let idle: Arc<dyn FailoverMode> = Arc::new(NoFailover);
        let mode = std::mem::replace(&mut *self.mode.write(), idle);
        mode.stop().await;
        if let Some(endpoint) = self.shared.set_active(None) {
            endpoint.disconnect().await;
        }
        *self.shared.primary_uri.write() = None;
    }

    /// Stop and forget every known tag.
    pub async fn reset(&self) {
        self.stop().await;
        self.shared.ctx.mapper.clear();
        info!(equipment = %self.shared.equipment, "subscriptions cleared");
    }

    fn active_endpoint(&self) -> DaqResult<Endpoint> {
        self.shared
            .active()
            .ok_or_else(|| DaqError::disconnected("no server connected"))
    }
}
