//! ---
//! daq_section: "05-networking-external-interfaces"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Protocol client seam and protocol value types."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use thiserror::Error;

use crate::types::StatusCode;

/// Failure reported by a protocol client call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The server answered with a bad service result.
    #[error("service fault {0}")]
    Status(StatusCode),
    /// The endpoint host could not be resolved.
    #[error("unknown host: {0}")]
    UnknownHost(String),
    /// The secure channel or certificate validation failed.
    #[error("security failure: {0}")]
    Security(String),
    /// Socket level failure.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The call did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// No session is open.
    #[error("client is not connected")]
    NotConnected,
}

impl ClientError {
    /// Status code carried by the error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status(code) => Some(*code),
            ClientError::Timeout => Some(StatusCode::BAD_TIMEOUT),
            ClientError::NotConnected => Some(StatusCode::BAD_NOT_CONNECTED),
            _ => None,
        }
    }
}

impl From<StatusCode> for ClientError {
    fn from(code: StatusCode) -> Self {
        ClientError::Status(code)
    }
}
