//! ---
//! daq_section: "01-core-functionality"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Shared primitives and utilities for the acquisition runtime."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
//! Failure taxonomy shared by the endpoint, retry and failover layers.
//!
//! Raw protocol errors never leave an endpoint; they are classified into one of
//! these kinds first, and every retry or switch decision branches on the kind.

use std::fmt;
use std::time::Duration;

/// Shared result type for acquisition operations.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Classified failure surfaced by the acquisition layers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DaqError {
    /// Misaddressed node, unparseable hardware address, unresolvable host or a
    /// structural error reported by the server. Retrying cannot fix it.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Transport fault, timeout or generic server-side failure.
    #[error("communication error: {0}")]
    Communication(String),
    /// The session was already torn down by either party.
    #[error("endpoint disconnected: {0}")]
    EndpointDisconnected(String),
    /// The connection has been down for longer than a recovery is plausible.
    #[error("connection lost for {elapsed:?}: {reason}")]
    LongLostConnection { elapsed: Duration, reason: String },
    /// The operation was cancelled while it was running or waiting to retry.
    #[error("operation cancelled")]
    Cancelled,
}

impl DaqError {
    pub fn configuration(message: impl Into<String>) -> Self {
        DaqError::Configuration(message.into())
    }

    pub fn communication(message: impl Into<String>) -> Self {
        DaqError::Communication(message.into())
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        DaqError::EndpointDisconnected(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Configuration(_) => ErrorKind::Configuration,
            DaqError::Communication(_) => ErrorKind::Communication,
            DaqError::EndpointDisconnected(_) => ErrorKind::EndpointDisconnected,
            DaqError::LongLostConnection { .. } => ErrorKind::LongLostConnection,
            DaqError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a retry loop may attempt the failed operation again.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Discriminant of [`DaqError`], used for metrics labels and policy tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Communication,
    EndpointDisconnected,
    LongLostConnection,
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Communication | ErrorKind::EndpointDisconnected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Communication => "communication",
            ErrorKind::EndpointDisconnected => "endpoint_disconnected",
            ErrorKind::LongLostConnection => "long_lost_connection",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(DaqError::communication("timeout").is_retryable());
        assert!(DaqError::disconnected("closed").is_retryable());
        assert!(!DaqError::configuration("bad node").is_retryable());
        assert!(!DaqError::Cancelled.is_retryable());
        assert!(!DaqError::LongLostConnection {
            elapsed: Duration::from_secs(90),
            reason: "session expired".into(),
        }
        .is_retryable());
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(
            DaqError::disconnected("x").kind().as_str(),
            "endpoint_disconnected"
        );
        assert_eq!(ErrorKind::LongLostConnection.to_string(), "long_lost_connection");
    }
}
