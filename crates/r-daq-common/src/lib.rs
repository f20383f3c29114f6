//! ---
//! daq_section: "01-core-functionality"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Shared primitives and utilities for the acquisition runtime."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
//! Core shared primitives for the R-DAQ workspace.
//! This crate exposes configuration loading, logging initialisation, and the
//! error taxonomy every other crate branches on.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    AppConfig, DaqConfig, HealthConfig, LoggingConfig, MetricsConfig, RedundancyConfig,
    RedundancyMode, RetryConfig,
};
pub use error::{DaqError, DaqResult, ErrorKind};
pub use logging::{init_tracing, resolve_filter, FilterSource, LogFormat, DEFAULT_DIRECTIVES};
