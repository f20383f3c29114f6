//! ---
//! daq_section: "02-messaging-data-model"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Downstream message contract and value types."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod sender;
pub mod types;

pub use sender::{MessageSender, RecordingSender, SenderEvent, TracingSender};
pub use types::{EquipmentState, Quality, QualityCode, TagId, ValueUpdate};
