//! ---
//! daq_section: "01-core-functionality"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Tag subscription bookkeeping and single-server endpoints."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use r_daq_msg::{Quality, QualityCode};
use r_daq_net::StatusCode;

const NODE_NOT_FOUND: &[StatusCode] = &[
    StatusCode::BAD_NODE_ID_UNKNOWN,
    StatusCode::BAD_NODE_ID_INVALID,
];

const ACCESS_DENIED: &[StatusCode] = &[
    StatusCode::BAD_USER_ACCESS_DENIED,
    StatusCode::BAD_SECURITY_CHECKS_FAILED,
    StatusCode::BAD_IDENTITY_TOKEN_REJECTED,
    StatusCode::BAD_NOT_WRITABLE,
];

const UNREACHABLE: &[StatusCode] = &[
    StatusCode::BAD_COMMUNICATION_ERROR,
    StatusCode::BAD_TIMEOUT,
    StatusCode::BAD_CONNECTION_CLOSED,
    StatusCode::BAD_NOT_CONNECTED,
    StatusCode::BAD_SERVER_NOT_CONNECTED,
    StatusCode::BAD_SESSION_CLOSED,
    StatusCode::BAD_SERVER_HALTED,
];

/// Tag quality for a protocol status.
pub fn quality_from_status(status: StatusCode) -> Quality {
    if status.is_good() {
        return Quality::good();
    }
    let code = if status.is_uncertain() {
        QualityCode::Uncertain
    } else if NODE_NOT_FOUND.iter().any(|c| status.matches(*c)) {
        QualityCode::NodeNotFound
    } else if ACCESS_DENIED.iter().any(|c| status.matches(*c)) {
        QualityCode::AccessDenied
    } else if UNREACHABLE.iter().any(|c| status.matches(*c)) {
        QualityCode::Unreachable
    } else {
        QualityCode::Unknown
    };
    Quality::new(code, status.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_status_families() {
        assert!(quality_from_status(StatusCode::GOOD).is_valid());
        assert_eq!(
            quality_from_status(StatusCode::UNCERTAIN).code,
            QualityCode::Uncertain
        );
        let missing = quality_from_status(StatusCode::BAD_NODE_ID_UNKNOWN);
        assert_eq!(missing.code, QualityCode::NodeNotFound);
        assert!(missing.description.contains("BadNodeIdUnknown"));
        assert_eq!(
            quality_from_status(StatusCode::BAD_USER_ACCESS_DENIED).code,
            QualityCode::AccessDenied
        );
        assert_eq!(
            quality_from_status(StatusCode::BAD_TIMEOUT).code,
            QualityCode::Unreachable
        );
        assert_eq!(
            quality_from_status(StatusCode::BAD_INTERNAL_ERROR).code,
            QualityCode::Unknown
        );
    }
}
