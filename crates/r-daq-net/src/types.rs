//! ---
//! daq_section: "05-networking-external-interfaces"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Protocol client seam and protocol value types."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Identifier part of a node address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeIdentifier {
    /// `i=<u32>`
    Numeric(u32),
    /// `s=<text>`
    String(String),
    /// `g=<uuid>`
    Guid(Uuid),
}

/// Protocol-level address of a value inside a server's address space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Namespace index.
    pub namespace: u16,
    /// Identifier within the namespace.
    pub identifier: NodeIdentifier,
}

impl NodeAddress {
    /// Numeric node in the given namespace.
    pub const fn numeric(namespace: u16, id: u32) -> Self {
        Self {
            namespace,
            identifier: NodeIdentifier::Numeric(id),
        }
    }

    /// String node in the given namespace.
    pub fn string(namespace: u16, id: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: NodeIdentifier::String(id.into()),
        }
    }

    /// `Server_ServiceLevel`, a 0..=255 health indicator.
    pub const SERVICE_LEVEL: NodeAddress = NodeAddress::numeric(0, 2267);
    /// `Server_ServerStatus_State`, the enumerated run state.
    pub const SERVER_STATE: NodeAddress = NodeAddress::numeric(0, 2259);
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns={};", self.namespace)?;
        match &self.identifier {
            NodeIdentifier::Numeric(id) => write!(f, "i={}", id),
            NodeIdentifier::String(id) => write!(f, "s={}", id),
            NodeIdentifier::Guid(id) => write!(f, "g={}", id),
        }
    }
}

impl FromStr for NodeAddress {
    type Err = String;

    /// Parse the textual form `ns=<u16>;<i|s|g>=<id>`; the namespace part is optional.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (namespace, rest) = match trimmed.strip_prefix("ns=") {
            Some(tail) => {
                let (ns, rest) = tail
                    .split_once(';')
                    .ok_or_else(|| format!("missing identifier in node address '{}'", s))?;
                let ns = ns
                    .parse::<u16>()
                    .map_err(|_| format!("invalid namespace '{}' in node address '{}'", ns, s))?;
                (ns, rest)
            }
            None => (0, trimmed),
        };
        let (kind, id) = rest
            .split_once('=')
            .ok_or_else(|| format!("malformed node address '{}'", s))?;
        let identifier = match kind {
            "i" => NodeIdentifier::Numeric(
                id.parse::<u32>()
                    .map_err(|_| format!("invalid numeric identifier '{}'", id))?,
            ),
            "s" if !id.is_empty() => NodeIdentifier::String(id.to_owned()),
            "g" => NodeIdentifier::Guid(
                Uuid::parse_str(id).map_err(|_| format!("invalid guid identifier '{}'", id))?,
            ),
            _ => return Err(format!("unsupported identifier '{}={}'", kind, id)),
        };
        Ok(NodeAddress {
            namespace,
            identifier,
        })
    }
}

/// Numeric status reported by the server for a request or a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

#[allow(missing_docs)]
impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);
    pub const UNCERTAIN: StatusCode = StatusCode(0x4000_0000);
    pub const BAD_UNEXPECTED_ERROR: StatusCode = StatusCode(0x8001_0000);
    pub const BAD_INTERNAL_ERROR: StatusCode = StatusCode(0x8002_0000);
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_SERVICE_UNSUPPORTED: StatusCode = StatusCode(0x800B_0000);
    pub const BAD_SERVER_NOT_CONNECTED: StatusCode = StatusCode(0x800D_0000);
    pub const BAD_SERVER_HALTED: StatusCode = StatusCode(0x800E_0000);
    pub const BAD_SECURITY_CHECKS_FAILED: StatusCode = StatusCode(0x8013_0000);
    pub const BAD_USER_ACCESS_DENIED: StatusCode = StatusCode(0x801F_0000);
    pub const BAD_IDENTITY_TOKEN_REJECTED: StatusCode = StatusCode(0x8021_0000);
    pub const BAD_SESSION_ID_INVALID: StatusCode = StatusCode(0x8025_0000);
    pub const BAD_SESSION_CLOSED: StatusCode = StatusCode(0x8026_0000);
    pub const BAD_SUBSCRIPTION_ID_INVALID: StatusCode = StatusCode(0x8028_0000);
    pub const BAD_NODE_ID_INVALID: StatusCode = StatusCode(0x8033_0000);
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8034_0000);
    pub const BAD_NOT_WRITABLE: StatusCode = StatusCode(0x803B_0000);
    pub const BAD_SERVER_URI_INVALID: StatusCode = StatusCode(0x804F_0000);
    pub const BAD_TCP_ENDPOINT_URL_INVALID: StatusCode = StatusCode(0x8083_0000);
    pub const BAD_NOT_CONNECTED: StatusCode = StatusCode(0x808A_0000);
    pub const BAD_CONNECTION_CLOSED: StatusCode = StatusCode(0x80AE_0000);

    const SEVERITY_MASK: u32 = 0xC000_0000;

    /// Severity bits are `00`.
    pub fn is_good(&self) -> bool {
        self.0 & Self::SEVERITY_MASK == 0
    }

    /// Severity bits are `01`.
    pub fn is_uncertain(&self) -> bool {
        self.0 & Self::SEVERITY_MASK == 0x4000_0000
    }

    /// Severity bits are `10` or `11`.
    pub fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Compare only the code bits, ignoring info flags in the low word.
    pub fn matches(&self, other: StatusCode) -> bool {
        self.0 & 0xFFFF_0000 == other.0 & 0xFFFF_0000
    }

    /// Symbolic name of well-known codes.
    pub fn name(&self) -> &'static str {
        const NAMES: &[(StatusCode, &str)] = &[
            (StatusCode::GOOD, "Good"),
            (StatusCode::UNCERTAIN, "Uncertain"),
            (StatusCode::BAD_UNEXPECTED_ERROR, "BadUnexpectedError"),
            (StatusCode::BAD_INTERNAL_ERROR, "BadInternalError"),
            (StatusCode::BAD_COMMUNICATION_ERROR, "BadCommunicationError"),
            (StatusCode::BAD_TIMEOUT, "BadTimeout"),
            (StatusCode::BAD_SERVICE_UNSUPPORTED, "BadServiceUnsupported"),
            (StatusCode::BAD_SERVER_NOT_CONNECTED, "BadServerNotConnected"),
            (StatusCode::BAD_SERVER_HALTED, "BadServerHalted"),
            (StatusCode::BAD_SECURITY_CHECKS_FAILED, "BadSecurityChecksFailed"),
            (StatusCode::BAD_USER_ACCESS_DENIED, "BadUserAccessDenied"),
            (StatusCode::BAD_IDENTITY_TOKEN_REJECTED, "BadIdentityTokenRejected"),
            (StatusCode::BAD_SESSION_ID_INVALID, "BadSessionIdInvalid"),
            (StatusCode::BAD_SESSION_CLOSED, "BadSessionClosed"),
            (StatusCode::BAD_SUBSCRIPTION_ID_INVALID, "BadSubscriptionIdInvalid"),
            (StatusCode::BAD_NODE_ID_INVALID, "BadNodeIdInvalid"),
            (StatusCode::BAD_NODE_ID_UNKNOWN, "BadNodeIdUnknown"),
            (StatusCode::BAD_NOT_WRITABLE, "BadNotWritable"),
            (StatusCode::BAD_SERVER_URI_INVALID, "BadServerUriInvalid"),
            (StatusCode::BAD_TCP_ENDPOINT_URL_INVALID, "BadTcpEndpointUrlInvalid"),
            (StatusCode::BAD_NOT_CONNECTED, "BadNotConnected"),
            (StatusCode::BAD_CONNECTION_CLOSED, "BadConnectionClosed"),
        ];
        NAMES
            .iter()
            .find(|(code, _)| self.matches(*code))
            .map(|(_, name)| *name)
            .unwrap_or("Unknown")
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.0)
    }
}

/// Value with status and source timestamp, as delivered by reads and notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue {
    /// The value itself.
    pub value: JsonValue,
    /// Status of the value.
    pub status: StatusCode,
    /// Timestamp assigned by the data source.
    pub source_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// Good value stamped now.
    pub fn good(value: impl Into<JsonValue>) -> Self {
        Self {
            value: value.into(),
            status: StatusCode::GOOD,
            source_timestamp: Some(Utc::now()),
        }
    }

    /// Value carrying an explicit status.
    pub fn with_status(value: impl Into<JsonValue>, status: StatusCode) -> Self {
        Self {
            value: value.into(),
            status,
            source_timestamp: Some(Utc::now()),
        }
    }
}

/// Server-side identifier of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u32);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-assigned handle correlating notifications with monitored items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientHandle(pub u32);

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a value-change threshold is interpreted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeadbandType {
    /// Every change is reported.
    #[default]
    None,
    /// Absolute difference threshold.
    Absolute,
    /// Percentage of the engineering range.
    Percent,
}

/// Data-change filter attached to a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataChangeFilter {
    /// Interpretation of `value`.
    pub kind: DeadbandType,
    /// Threshold value.
    pub value: f64,
}

/// Request for one monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemRequest {
    /// Handle echoed in every notification of the item.
    pub handle: ClientHandle,
    /// Node being sampled.
    pub node: NodeAddress,
    /// Requested sampling interval.
    pub sampling_interval: Duration,
    /// Optional deadband filter.
    pub filter: Option<DataChangeFilter>,
}

/// Redundancy support advertised by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RedundancySupport {
    /// Stand-alone server.
    None,
    /// Only one server is active; switching needs a reconnect.
    Cold,
    /// Backups are running but not serving data.
    Warm,
    /// Backups serve data and keep subscriptions in sync.
    Hot,
    /// Failover is handled by the server side.
    Transparent,
    /// Hot with mirrored sessions.
    HotAndMirrored,
}

impl RedundancySupport {
    /// Map the enumeration value used on the wire.
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(RedundancySupport::None),
            1 => Some(RedundancySupport::Cold),
            2 => Some(RedundancySupport::Warm),
            3 => Some(RedundancySupport::Hot),
            4 => Some(RedundancySupport::Transparent),
            5 => Some(RedundancySupport::HotAndMirrored),
            _ => None,
        }
    }
}

/// Result of the redundancy capability query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyInfo {
    /// Advertised support level.
    pub support: RedundancySupport,
    /// URIs of the redundant server set, when the server lists them.
    pub server_uris: Vec<String>,
}

impl Default for RedundancyInfo {
    fn default() -> Self {
        Self {
            support: RedundancySupport::None,
            server_uris: Vec::new(),
        }
    }
}

/// Run state reported through [`NodeAddress::SERVER_STATE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerState {
    /// Operating normally.
    Running,
    /// Vendor-specific fatal error.
    Failed,
    /// No configuration loaded.
    NoConfiguration,
    /// Suspended by the vendor.
    Suspended,
    /// Shutting down.
    Shutdown,
    /// Test mode.
    Test,
    /// Unable to reach its data sources.
    CommunicationFault,
    /// State is unknown.
    Unknown,
}

impl ServerState {
    /// Map the enumeration value used on the wire; unknown values map to [`ServerState::Unknown`].
    pub fn from_value(value: i64) -> Self {
        match value {
            0 => ServerState::Running,
            1 => ServerState::Failed,
            2 => ServerState::NoConfiguration,
            3 => ServerState::Suspended,
            4 => ServerState::Shutdown,
            5 => ServerState::Test,
            6 => ServerState::CommunicationFault,
            _ => ServerState::Unknown,
        }
    }

    /// Enumeration value used on the wire.
    pub fn value(&self) -> i64 {
        match self {
            ServerState::Running => 0,
            ServerState::Failed => 1,
            ServerState::NoConfiguration => 2,
            ServerState::Suspended => 3,
            ServerState::Shutdown => 4,
            ServerState::Test => 5,
            ServerState::CommunicationFault => 6,
            ServerState::Unknown => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_node_addresses() {
        let node: NodeAddress = "ns=2;s=Boiler.Temperature".parse().unwrap();
        assert_eq!(node, NodeAddress::string(2, "Boiler.Temperature"));
        assert_eq!(node.to_string(), "ns=2;s=Boiler.Temperature");

        let node: NodeAddress = "i=2267".parse().unwrap();
        assert_eq!(node, NodeAddress::SERVICE_LEVEL);

        let guid = "ns=3;g=72962b91-fa75-4ae6-8d28-b404dc7daf63";
        assert_eq!(guid.parse::<NodeAddress>().unwrap().to_string(), guid);
    }

    #[test]
    fn rejects_malformed_node_addresses() {
        for bad in ["", "ns=x;i=1", "ns=1", "ns=1;i=abc", "ns=1;s=", "q=7"] {
            assert!(bad.parse::<NodeAddress>().is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn status_severity_and_names() {
        assert!(StatusCode::GOOD.is_good());
        assert!(StatusCode::UNCERTAIN.is_uncertain());
        assert!(StatusCode::BAD_NODE_ID_UNKNOWN.is_bad());
        assert_eq!(StatusCode(0x8034_0400).name(), "BadNodeIdUnknown");
        assert_eq!(StatusCode(0x8FFF_0000).name(), "Unknown");
    }

    #[test]
    fn server_state_wire_mapping() {
        assert_eq!(ServerState::from_value(0), ServerState::Running);
        assert_eq!(ServerState::from_value(42), ServerState::Unknown);
        assert_eq!(ServerState::Shutdown.value(), 4);
        assert_eq!(RedundancySupport::from_value(1), Some(RedundancySupport::Cold));
    }
}
