//! ---
//! daq_section: "07-resilience-fault-tolerance"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Failover controller and redundancy modes."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use r_daq_core::HealthUpdate;
use r_daq_net::ServerState;

/// Whether a health sample reports a server that should be left.
///
/// A service level below `service_level_threshold` or a run state other than
/// running or unknown qualifies.
pub fn requires_switch(update: HealthUpdate, service_level_threshold: u8) -> bool {
    match update {
        HealthUpdate::ServiceLevel(level) => level < service_level_threshold,
        HealthUpdate::ServerState(state) => {
            !matches!(state, ServerState::Running | ServerState::Unknown)
        }
    }
}
