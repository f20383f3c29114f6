//! ---
//! daq_section: "07-resilience-fault-tolerance"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Failover controller and redundancy modes."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

/// Lifecycle of the failover controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ControllerState {
    #[default]
    Disconnected,
    Connecting,
    /// Connected without a redundant partner.
    SingleServer,
    /// Connected to one server of a redundant set, health supervised.
    RedundantActive,
    Switching,
    /// Connecting or switching was abandoned.
    Failed,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Disconnected => "disconnected",
            ControllerState::Connecting => "connecting",
            ControllerState::SingleServer => "single_server",
            ControllerState::RedundantActive => "redundant_active",
            ControllerState::Switching => "switching",
            ControllerState::Failed => "failed",
        }
    }

    /// Whether an endpoint is serving the equipment.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ControllerState::SingleServer | ControllerState::RedundantActive
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the single-flight switch guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwitchPhase {
    Idle = 0,
    Switching = 1,
}

impl SwitchPhase {
    fn from_u8(raw: u8) -> Self {
        if raw == SwitchPhase::Switching as u8 {
            SwitchPhase::Switching
        } else {
            SwitchPhase::Idle
        }
    }
}

/// Single-flight flag for server switches.
///
/// `Idle -> Switching` is the only transition taken by [`SwitchState::try_begin`];
/// the returned guard performs `Switching -> Idle` when dropped, including when
/// the switching future is cancelled.
#[derive(Debug, Default)]
pub struct SwitchState {
    phase: AtomicU8,
    idle: Notify,
}

impl SwitchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SwitchPhase {
        SwitchPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_switching(&self) -> bool {
        self.phase() == SwitchPhase::Switching
    }

    /// Claim the flag; `None` while another switch holds it.
    pub fn try_begin(&self) -> Option<SwitchGuard<'_>> {
        self.phase
            .compare_exchange(
                SwitchPhase::Idle as u8,
                SwitchPhase::Switching as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| SwitchGuard { state: self })
    }

    /// Resolve once no switch is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_switching() {
                return;
            }
            notified.await;
        }
    }
}

/// Holds [`SwitchPhase::Switching`] until dropped.
#[derive(Debug)]
pub struct SwitchGuard<'a> {
    state: &'a SwitchState,
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        self.state
            .phase
            .store(SwitchPhase::Idle as u8, Ordering::Release);
        self.state.idle.notify_waiters();
    }
}
