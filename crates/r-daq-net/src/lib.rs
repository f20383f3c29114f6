//! ---
//! daq_section: "05-networking-external-interfaces"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Protocol client seam and protocol value types."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod client;
pub mod error;
pub mod sim;
pub mod types;

pub use client::{ProtocolClient, ProtocolConnector, SessionEvent, SessionEventSink};
pub use error::ClientError;
pub use sim::{Operation, SimulatedConnector, SimulatedServer};
pub use types::{
    ClientHandle, DataChangeFilter, DataValue, DeadbandType, MonitoredItemRequest, NodeAddress,
    NodeIdentifier, RedundancyInfo, RedundancySupport, ServerState, StatusCode, SubscriptionId,
};
