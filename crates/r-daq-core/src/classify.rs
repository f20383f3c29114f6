//! ---
//! daq_section: "01-core-functionality"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Tag subscription bookkeeping and single-server endpoints."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::time::Duration;

use r_daq_common::DaqError;
use r_daq_net::{ClientError, StatusCode};

const CONFIGURATION: &[StatusCode] = &[
    StatusCode::BAD_TCP_ENDPOINT_URL_INVALID,
    StatusCode::BAD_SECURITY_CHECKS_FAILED,
    StatusCode::BAD_USER_ACCESS_DENIED,
    StatusCode::BAD_IDENTITY_TOKEN_REJECTED,
    StatusCode::BAD_NODE_ID_UNKNOWN,
    StatusCode::BAD_NODE_ID_INVALID,
    StatusCode::BAD_SERVER_URI_INVALID,
];

const DISCONNECTED: &[StatusCode] = &[
    StatusCode::BAD_CONNECTION_CLOSED,
    StatusCode::BAD_SESSION_CLOSED,
    StatusCode::BAD_NOT_CONNECTED,
    StatusCode::BAD_SERVER_NOT_CONNECTED,
];

fn any_of(set: &[StatusCode], status: StatusCode) -> bool {
    set.iter().any(|code| status.matches(*code))
}

/// Translate a raw client failure into the retry taxonomy.
///
/// `disconnected_for` is how long the endpoint has been without a session, if it
/// lost one; disconnections longer than `long_lost_threshold` are long-lost.
pub fn classify_error(
    err: &ClientError,
    disconnected_for: Option<Duration>,
    long_lost_threshold: Duration,
) -> DaqError {
    let disconnected = |reason: String| match disconnected_for {
        Some(elapsed) if elapsed > long_lost_threshold => {
            DaqError::LongLostConnection { elapsed, reason }
        }
        _ => DaqError::EndpointDisconnected(reason),
    };

    match err {
        ClientError::UnknownHost(_) | ClientError::Security(_) => {
            DaqError::Configuration(err.to_string())
        }
        ClientError::NotConnected => disconnected(err.to_string()),
        ClientError::Status(status) if any_of(CONFIGURATION, *status) => {
            DaqError::Configuration(err.to_string())
        }
        ClientError::Status(status) if status.matches(StatusCode::BAD_SESSION_ID_INVALID) => {
            DaqError::LongLostConnection {
                elapsed: disconnected_for.unwrap_or_default(),
                reason: err.to_string(),
            }
        }
        ClientError::Status(status) if any_of(DISCONNECTED, *status) => {
            disconnected(err.to_string())
        }
        ClientError::Status(_) | ClientError::Transport(_) | ClientError::Timeout => {
            DaqError::Communication(err.to_string())
        }
    }
}
