//! ---
//! daq_section: "01-core-functionality"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Tag subscription bookkeeping and single-server endpoints."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::hash::{Hash, Hasher};
use std::time::Duration;

use r_daq_msg::TagId;
use r_daq_net::{ClientHandle, DataChangeFilter, DeadbandType, NodeAddress};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

/// Identifier kind of a hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    #[default]
    String,
    Numeric,
    Guid,
}

impl AddressType {
    fn prefix(&self) -> char {
        match self {
            AddressType::String => 's',
            AddressType::Numeric => 'i',
            AddressType::Guid => 'g',
        }
    }
}

/// Where a tag lives on the server, as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareAddress {
    #[serde(default)]
    pub namespace: u16,
    pub item_name: String,
    /// Address used on the redundant server of a dual-address tag.
    #[serde(default)]
    pub redundant_item_name: Option<String>,
    #[serde(default)]
    pub address_type: AddressType,
}

impl HardwareAddress {
    pub fn new(namespace: u16, item_name: impl Into<String>, address_type: AddressType) -> Self {
        Self {
            namespace,
            item_name: item_name.into(),
            redundant_item_name: None,
            address_type,
        }
    }

    pub fn with_redundant_item(mut self, item_name: impl Into<String>) -> Self {
        self.redundant_item_name = Some(item_name.into());
        self
    }

    /// Primary node address.
    pub fn node(&self) -> Result<NodeAddress, String> {
        self.parse(&self.item_name)
    }

    /// Alternate node address, if configured.
    pub fn redundant_node(&self) -> Result<Option<NodeAddress>, String> {
        self.redundant_item_name
            .as_deref()
            .map(|item| self.parse(item))
            .transpose()
    }

    fn parse(&self, item: &str) -> Result<NodeAddress, String> {
        format!(
            "ns={};{}={}",
            self.namespace,
            self.address_type.prefix(),
            item.trim()
        )
        .parse()
    }
}

/// A logical data point configured in the DAQ.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTag {
    pub id: TagId,
    pub name: String,
    pub address: HardwareAddress,
    /// Minimum interval between two reported values.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default)]
    pub time_deadband: Duration,
    /// Value-change threshold, interpreted per `deadband_type`.
    #[serde(default)]
    pub value_deadband: f32,
    #[serde(default)]
    pub deadband_type: DeadbandType,
}

impl DataTag {
    pub fn new(id: TagId, name: impl Into<String>, address: HardwareAddress) -> Self {
        Self {
            id,
            name: name.into(),
            address,
            time_deadband: Duration::ZERO,
            value_deadband: 0.0,
            deadband_type: DeadbandType::None,
        }
    }

    pub fn with_deadband(mut self, time: Duration, value: f32, kind: DeadbandType) -> Self {
        self.time_deadband = time;
        self.value_deadband = value;
        self.deadband_type = kind;
        self
    }
}

/// Grouping key of a subscription: (time interval, value threshold, threshold kind).
///
/// The time interval never drops below the floor given at construction.
#[derive(Debug, Clone, Copy)]
pub struct Deadband {
    time: Duration,
    value: f32,
    kind: DeadbandType,
}

impl Deadband {
    /// Default floor of the time interval.
    pub const MIN_TIME: Duration = Duration::from_millis(500);

    pub fn new(time: Duration, value: f32, kind: DeadbandType, min_time: Duration) -> Self {
        let value = if value.is_finite() && value > 0.0 {
            value
        } else {
            0.0
        };
        Self {
            time: time.max(min_time),
            value,
            kind,
        }
    }

    /// Deadband declared by `tag`, clamped to `min_time`.
    pub fn of(tag: &DataTag, min_time: Duration) -> Self {
        Self::new(
            tag.time_deadband,
            tag.value_deadband,
            tag.deadband_type,
            min_time,
        )
    }

    pub fn time(&self) -> Duration {
        self.time
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn kind(&self) -> DeadbandType {
        self.kind
    }

    /// Server-side filter, absent when every change should be reported.
    pub fn filter(&self) -> Option<DataChangeFilter> {
        if self.kind == DeadbandType::None || self.value == 0.0 {
            return None;
        }
        Some(DataChangeFilter {
            kind: self.kind,
            value: f64::from(self.value),
        })
    }
}

impl PartialEq for Deadband {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
            && self.value.to_bits() == other.value.to_bits()
            && self.kind == other.kind
    }
}

impl Eq for Deadband {}

impl Hash for Deadband {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.time.hash(state);
        self.value.to_bits().hash(state);
        self.kind.hash(state);
    }
}

/// Which of a tag's addresses an endpoint subscribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressRole {
    #[default]
    Primary,
    Redundant,
}

/// Immutable protocol-side identity of a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDefinition {
    pub tag: TagId,
    pub node: NodeAddress,
    pub redundant_node: Option<NodeAddress>,
    pub handle: ClientHandle,
}

impl ItemDefinition {
    /// Address to use for `role`; falls back to the primary node.
    pub fn address_for(&self, role: AddressRole) -> &NodeAddress {
        match (role, &self.redundant_node) {
            (AddressRole::Redundant, Some(node)) => node,
            _ => &self.node,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_deadband_is_clamped_to_the_floor() {
        let tag = DataTag::new(TagId(1), "fast", HardwareAddress::new(2, "Fast", AddressType::String))
            .with_deadband(Duration::from_millis(100), 0.0, DeadbandType::None);
        let deadband = Deadband::of(&tag, Deadband::MIN_TIME);
        assert_eq!(deadband.time(), Duration::from_millis(500));

        let slow = Deadband::new(Duration::from_secs(2), 0.0, DeadbandType::None, Deadband::MIN_TIME);
        assert_eq!(slow.time(), Duration::from_secs(2));
    }

    #[test]
    fn time_deadband_is_carried_as_milliseconds() {
        let tag = DataTag::new(TagId(7), "slow", HardwareAddress::new(2, "Slow", AddressType::String))
            .with_deadband(Duration::from_millis(1500), 0.0, DeadbandType::None);
        let encoded = serde_json::to_value(&tag).unwrap();
        assert_eq!(encoded["time_deadband"], serde_json::json!(1500));

        let decoded: DataTag = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.time_deadband, Duration::from_millis(1500));
    }

    #[test]
    fn equal_deadbands_are_one_key() {
        let a = Deadband::new(Duration::from_millis(100), 0.5, DeadbandType::Absolute, Deadband::MIN_TIME);
        let b = Deadband::new(Duration::from_millis(500), 0.5, DeadbandType::Absolute, Deadband::MIN_TIME);
        let c = Deadband::new(Duration::from_millis(500), 0.5, DeadbandType::Percent, Deadband::MIN_TIME);
        let mut set = std::collections::HashSet::new();
        set.insert(a);
        set.insert(b);
        set.insert(c);
        assert_eq!(set.len(), 2);
        assert!(a.filter().is_some());
        assert!(Deadband::new(Duration::ZERO, 1.0, DeadbandType::None, Deadband::MIN_TIME)
            .filter()
            .is_none());
    }

    #[test]
    fn hardware_addresses_resolve_to_nodes() {
        let address = HardwareAddress::new(3, "1042", AddressType::Numeric).with_redundant_item("2042");
        assert_eq!(address.node().unwrap(), NodeAddress::numeric(3, 1042));
        assert_eq!(
            address.redundant_node().unwrap(),
            Some(NodeAddress::numeric(3, 2042))
        );
        assert!(HardwareAddress::new(3, "pump", AddressType::Numeric).node().is_err());
        assert!(HardwareAddress::new(2, "  ", AddressType::String).node().is_err());
    }

    #[test]
    fn tags_deserialise_from_toml() {
        let tag: DataTag = toml::from_str(
            r#"
            id = 7
            name = "boiler.temperature"
            time_deadband = 1000
            value_deadband = 0.5
            deadband_type = "absolute"

            [address]
            namespace = 2
            item_name = "Boiler.Temperature"
            "#,
        )
        .unwrap();
        assert_eq!(tag.id, TagId(7));
        assert_eq!(tag.address.address_type, AddressType::String);
        assert_eq!(tag.time_deadband, Duration::from_secs(1));
    }
}
