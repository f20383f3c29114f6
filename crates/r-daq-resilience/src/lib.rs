//! ---
//! daq_section: "07-resilience-fault-tolerance"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Retry delegate and resilience metrics."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod metrics;
pub mod retry;

pub use metrics::ResilienceMetrics;
pub use retry::{RetryDelegate, RetryPolicy};

/// Crate prelude collecting the most commonly used types.
pub mod prelude {
    pub use super::metrics::ResilienceMetrics;
    pub use super::retry::{RetryDelegate, RetryPolicy};
    pub use tokio_util::sync::CancellationToken;
}
