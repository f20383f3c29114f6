//! ---
//! daq_section: "02-messaging-data-model"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Downstream message contract and value types."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Identifier of a logical data point configured in the DAQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(pub u64);

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TagId {
    fn from(value: u64) -> Self {
        TagId(value)
    }
}

/// Connection state of the equipment as reported downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EquipmentState {
    /// Connected and delivering values.
    Ok,
    /// The session was lost; recovery may still succeed.
    ConnectionLost,
    /// Connecting failed and was abandoned.
    ConnectionFailed,
}

impl EquipmentState {
    /// Static label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EquipmentState::Ok => "ok",
            EquipmentState::ConnectionLost => "connection_lost",
            EquipmentState::ConnectionFailed => "connection_failed",
        }
    }
}

impl fmt::Display for EquipmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse quality classification of a tag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityCode {
    /// The value is good.
    Ok,
    /// The server reports the value with uncertain quality.
    Uncertain,
    /// The node does not exist or its address is malformed.
    NodeNotFound,
    /// The server refused access to the node.
    AccessDenied,
    /// The server could not be reached for this item.
    Unreachable,
    /// Any other bad status.
    Unknown,
}

/// Quality attached to every tag notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quality {
    /// Classification of the quality.
    pub code: QualityCode,
    /// Human readable reason, empty for good values.
    #[serde(default)]
    pub description: String,
}

impl Quality {
    /// A good quality without description.
    pub fn good() -> Self {
        Self {
            code: QualityCode::Ok,
            description: String::new(),
        }
    }

    /// A quality with the supplied code and description.
    pub fn new(code: QualityCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// Whether the value may be used downstream without restriction.
    pub fn is_valid(&self) -> bool {
        self.code == QualityCode::Ok
    }
}

/// Value notification forwarded for a subscribed tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueUpdate {
    /// Value as reported by the server.
    pub value: JsonValue,
    /// Quality of the value.
    pub quality: Quality,
    /// Source timestamp, falling back to the reception time.
    pub timestamp: DateTime<Utc>,
}

impl ValueUpdate {
    /// Construct an update stamped with the supplied timestamp or now.
    pub fn new(value: JsonValue, quality: Quality, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            value,
            quality,
            timestamp: timestamp.unwrap_or_else(Utc::now),
        }
    }
}
