//! ---
//! daq_section: "01-core-functionality"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Tag subscription bookkeeping and single-server endpoints."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
//! Subscription bookkeeping and the single-server [`Endpoint`].
//!
//! The [`TagSubscriptionMapper`] owns every tag definition and deadband group and
//! performs no I/O. An [`Endpoint`] wraps one protocol session, applies groups to
//! it and classifies raw protocol failures into [`r_daq_common::DaqError`].

pub mod classify;
pub mod endpoint;
pub mod mapper;
pub mod quality;
pub mod tag;

pub use classify::classify_error;
pub use endpoint::{Endpoint, EndpointContext, EndpointSettings, HealthUpdate};
pub use mapper::{GroupBatch, SubscriptionGroup, TagSubscriptionMapper};
pub use quality::quality_from_status;
pub use tag::{AddressRole, AddressType, DataTag, Deadband, HardwareAddress, ItemDefinition};
