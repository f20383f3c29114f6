//! ---
//! daq_section: "07-resilience-fault-tolerance"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Failover controller and redundancy modes."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
//! Redundancy modes.
//!
//! [`NoFailover`] serves a single server. [`ColdFailover`] keeps one session open at
//! a time, supervises its health and reconnects to the next server of the set
//! when the active one degrades or stays lost for longer than the failover delay.
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use r_daq_common::{DaqError, DaqResult, RedundancyConfig, RedundancyMode};
use r_daq_core::{Endpoint, HealthUpdate};
use r_daq_msg::EquipmentState;
use r_daq_net::RedundancySupport;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::ControllerShared;
use crate::health::requires_switch;
use crate::state::{ControllerState, SwitchState};

/// Redundancy behaviour of a connected controller.
#[async_trait]
pub trait FailoverMode: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// State reported while this mode serves the equipment.
    fn serving_state(&self) -> ControllerState;

    /// Arm supervision of the freshly connected endpoint.
    async fn activate(&self) -> DaqResult<()>;

    /// Move to the next server. Returns `false` when no switch ran, either because
    /// the mode cannot switch or because a switch is already in flight.
    async fn trigger_switch(&self) -> bool;

    /// Stop supervision and wait for an in-flight switch to unwind.
    async fn stop(&self);
}

/// Mode of a server without redundant partner.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFailover;

#[async_trait]
impl FailoverMode for NoFailover {
    fn name(&self) -> &'static str {
        "none"
    }

    fn serving_state(&self) -> ControllerState {
        ControllerState::SingleServer
    }

    async fn activate(&self) -> DaqResult<()> {
        Ok(())
    }

    async fn trigger_switch(&self) -> bool {
        debug!("no redundant server configured; switch ignored");
        false
    }

    async fn stop(&self) {}
}

/// Outcome of the redundancy resolution that follows a connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedundancyPlan {
    pub mode: RedundancyMode,
    /// Servers to fail over to, never containing the connected one.
    pub alternates: Vec<String>,
}

impl RedundancyPlan {
    pub fn single_server() -> Self {
        Self {
            mode: RedundancyMode::None,
            alternates: Vec::new(),
        }
    }
}

/// Chooses the [`FailoverMode`] of a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailoverFactory;

impl FailoverFactory {
    /// Mode modelled for a reported capability. Every active redundancy flavour is
    /// served as cold failover.
    pub fn mode_for(support: RedundancySupport) -> RedundancyMode {
        match support {
            RedundancySupport::None | RedundancySupport::Transparent => RedundancyMode::None,
            RedundancySupport::Cold
            | RedundancySupport::Warm
            | RedundancySupport::Hot
            | RedundancySupport::HotAndMirrored => RedundancyMode::Cold,
        }
    }

    /// Decide mode and alternates for `endpoint`.
    ///
    /// A configured mode wins over the reported capability and configured server
    /// URIs win over the server's own listing. A failing capability query keeps the
    /// controller on a single server.
    pub async fn resolve(config: &RedundancyConfig, endpoint: &Endpoint) -> RedundancyPlan {
        let connected = endpoint.uri();
        let configured = alternates_of(&config.server_uris, connected);
        match config.mode {
            Some(RedundancyMode::None) => return RedundancyPlan::single_server(),
            Some(RedundancyMode::Cold) if !configured.is_empty() => {
                return RedundancyPlan {
                    mode: RedundancyMode::Cold,
                    alternates: configured,
                }
            }
            _ => {}
        }

        let info = match endpoint.redundancy_info().await {
            Ok(info) => info,
            Err(err) => {
                warn!(uri = connected, error = %err, "redundancy capability unavailable; serving a single server");
                return RedundancyPlan::single_server();
            }
        };
        let mode = config
            .mode
            .unwrap_or_else(|| Self::mode_for(info.support));
        if mode == RedundancyMode::None {
            debug!(uri = connected, support = ?info.support, "server reports no redundancy");
            return RedundancyPlan::single_server();
        }

        let alternates = if configured.is_empty() {
            alternates_of(&info.server_uris, connected)
        } else {
            configured
        };
        if alternates.is_empty() {
            warn!(uri = connected, support = ?info.support, "redundancy reported without alternate servers; serving a single server");
            return RedundancyPlan::single_server();
        }
        RedundancyPlan { mode, alternates }
    }

    pub(crate) fn create(
        plan: &RedundancyPlan,
        shared: Arc<ControllerShared>,
        connected: &str,
        cancel: CancellationToken,
    ) -> Arc<dyn FailoverMode> {
        match plan.mode {
            RedundancyMode::None => Arc::new(NoFailover),
            RedundancyMode::Cold => Arc::new(ColdFailover::new(
                shared,
                connected,
                &plan.alternates,
                cancel,
            )),
        }
    }
}

fn alternates_of(uris: &[String], connected: &str) -> Vec<String> {
    let mut alternates: Vec<String> = Vec::with_capacity(uris.len());
    for uri in uris {
        let uri = uri.trim();
        if uri.is_empty() || uri == connected || alternates.iter().any(|known| known == uri) {
            continue;
        }
        alternates.push(uri.to_owned());
    }
    alternates
}

struct ColdInner {
    shared: Arc<ControllerShared>,
    /// Server ring; index 0 is the server connected first.
    servers: Vec<String>,
    current: Mutex<usize>,
    switch: SwitchState,
    cancel: CancellationToken,
    supervision: Mutex<Option<CancellationToken>>,
}

/// One active server at a time; switching requires a reconnect.
#[derive(Clone)]
pub struct ColdFailover {
    inner: Arc<ColdInner>,
}

impl fmt::Debug for ColdFailover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColdFailover")
            .field("servers", &self.inner.servers)
            .field("current", &*self.inner.current.lock())
            .field("switch", &self.inner.switch.phase())
            .finish()
    }
}

impl ColdFailover {
    pub(crate) fn new(
        shared: Arc<ControllerShared>,
        connected: &str,
        alternates: &[String],
        cancel: CancellationToken,
    ) -> Self {
        let mut servers = Vec::with_capacity(alternates.len() + 1);
        servers.push(connected.to_owned());
        servers.extend(alternates_of(alternates, connected));
        Self {
            inner: Arc::new(ColdInner {
                shared,
                servers,
                current: Mutex::new(0),
                switch: SwitchState::new(),
                cancel,
                supervision: Mutex::new(None),
            }),
        }
    }

    /// Servers of the redundant set, connected one first.
    pub fn servers(&self) -> &[String] {
        &self.inner.servers
    }

    /// Server targeted by the `attempt`-th try of a switch leaving `origin`.
    fn candidate(&self, origin: usize, attempt: u32) -> usize {
        let len = self.inner.servers.len();
        if len < 2 {
            return origin;
        }
        let offset = 1 + (attempt.max(1) as usize - 1) % (len - 1);
        (origin + offset) % len
    }

    async fn supervise(&self, endpoint: &Endpoint) -> DaqResult<()> {
        let token = self.inner.cancel.child_token();
        if let Some(previous) = self.inner.supervision.lock().replace(token.clone()) {
            previous.cancel();
        }
        let config = &self.inner.shared.config;
        let activity = endpoint.activity();
        let updates = endpoint
            .monitor_health(config.health.publish_interval)
            .await?;
        tokio::spawn(watch_health(self.clone(), updates, token.clone()));
        tokio::spawn(watch_session(self.clone(), activity, token));
        debug!(uri = endpoint.uri(), "failover supervision armed");
        Ok(())
    }

    fn release_supervision(&self) {
        if let Some(token) = self.inner.supervision.lock().take() {
            token.cancel();
        }
    }

    async fn attempt_switch(&self, origin: usize, attempt: u32) -> DaqResult<String> {
        let shared = &self.inner.shared;
        if let Some(previous) = shared.set_active(None) {
            previous.disconnect().await;
        }
        let index = self.candidate(origin, attempt);
        let uri = self.inner.servers[index].clone();
        info!(equipment = %shared.equipment, uri = %uri, attempt, "connecting to redundant server");

        let endpoint = shared.endpoint_for(&uri);
        endpoint.initialize().await?;
        shared.set_active(Some(endpoint.clone()));
        *self.inner.current.lock() = index;

        shared.restore_subscriptions(&endpoint).await?;
        self.supervise(&endpoint).await?;
        Ok(uri)
    }
}

#[async_trait]
impl FailoverMode for ColdFailover {
    fn name(&self) -> &'static str {
        "cold"
    }

    fn serving_state(&self) -> ControllerState {
        ControllerState::RedundantActive
    }

    async fn activate(&self) -> DaqResult<()> {
        let endpoint = self
            .inner
            .shared
            .active()
            .ok_or_else(|| DaqError::disconnected("no active endpoint to supervise"))?;
        self.supervise(&endpoint).await
    }

    async fn trigger_switch(&self) -> bool {
        let Some(guard) = self.inner.switch.try_begin() else {
            debug!("switch already in progress; trigger ignored");
            return false;
        };
        let cancel = self.inner.cancel.clone();
        if cancel.is_cancelled() {
            return false;
        }
        let shared = &self.inner.shared;
        let started = Instant::now();
        let origin = *self.inner.current.lock();
        let from = self.inner.servers[origin].clone();
        shared.set_state(ControllerState::Switching);

        self.release_supervision();
        if let Some(endpoint) = shared.active() {
            endpoint.stop_health_monitoring().await;
        }
        warn!(equipment = %shared.equipment, from = %from, "switching to the next redundant server");

        let result = shared
            .ctx
            .retry
            .run("failover", &cancel, |attempt| {
                self.attempt_switch(origin, attempt)
            })
            .await;

        let switched = match result {
            Ok(to) => {
                let elapsed = started.elapsed();
                if let Some(metrics) = shared.ctx.retry.metrics() {
                    metrics.observe_failover(&from, &to, elapsed);
                }
                shared.set_state(ControllerState::RedundantActive);
                info!(equipment = %shared.equipment, from = %from, to = %to, elapsed_ms = elapsed.as_millis() as u64, "failover completed");
                true
            }
            Err(DaqError::Cancelled) => {
                debug!(equipment = %shared.equipment, "failover cancelled");
                false
            }
            Err(err) => {
                error!(equipment = %shared.equipment, from = %from, error = %err, "failover abandoned");
                shared.set_state(ControllerState::Failed);
                shared.notify(EquipmentState::ConnectionFailed);
                false
            }
        };
        drop(guard);
        switched
    }

    async fn stop(&self) {
        self.inner.cancel.cancel();
        self.release_supervision();
        self.inner.switch.wait_idle().await;
    }
}

async fn watch_health(
    failover: ColdFailover,
    mut updates: mpsc::UnboundedReceiver<HealthUpdate>,
    token: CancellationToken,
) {
    let threshold = failover.inner.shared.config.health.service_level_threshold;
    loop {
        let update = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            update = updates.recv() => match update {
                Some(update) => update,
                None => return,
            },
        };
        if requires_switch(update, threshold) {
            warn!(?update, threshold, "server health degraded");
            FailoverMode::trigger_switch(&failover).await;
            return;
        }
        debug!(?update, "health sample");
    }
}

async fn watch_session(
    failover: ColdFailover,
    mut activity: watch::Receiver<bool>,
    token: CancellationToken,
) {
    let delay = failover.inner.shared.config.redundancy.failover_delay;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            changed = activity.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        if *activity.borrow_and_update() {
            continue;
        }

        warn!(delay_ms = delay.as_millis() as u64, "session lost; failover armed");
        let recovered = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            recovered = wait_active(&mut activity) => recovered,
            _ = sleep(delay) => false,
        };
        if recovered {
            info!("session recovered before the failover delay");
            continue;
        }
        FailoverMode::trigger_switch(&failover).await;
        return;
    }
}

async fn wait_active(activity: &mut watch::Receiver<bool>) -> bool {
    activity.wait_for(|active| *active).await.is_ok()
}
