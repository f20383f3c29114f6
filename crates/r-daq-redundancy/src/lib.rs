//! ---
//! daq_section: "07-resilience-fault-tolerance"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Failover controller and redundancy modes."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
//! Failover controller for redundant server pairs.
//!
//! [`DaqController`] is the surface the rest of the DAQ talks to. The redundancy
//! behaviour behind it is a [`FailoverMode`] chosen by [`FailoverFactory`] after
//! each successful connect.

mod controller;
mod health;
mod mode;
mod state;

pub use controller::DaqController;
pub use health::requires_switch;
pub use mode::{ColdFailover, FailoverFactory, FailoverMode, NoFailover, RedundancyPlan};
pub use state::{ControllerState, SwitchGuard, SwitchPhase, SwitchState};
