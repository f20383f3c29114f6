//! ---
//! daq_section: "01-core-functionality"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Tag subscription bookkeeping and single-server endpoints."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
//! Tag Subscription Mapper.
//!
//! All tables live behind one `RwLock` so a definition, its handle and its group
//! membership always change together. Lock order is mapper state, then group
//! members; group members are only written while the mapper write lock is held.
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use r_daq_common::{DaqError, DaqResult};
use r_daq_msg::TagId;
use r_daq_net::{ClientHandle, SubscriptionId};
use tracing::debug;

use crate::tag::{DataTag, Deadband, ItemDefinition};

/// Groups with the definitions to apply to each, in insertion order.
pub type GroupBatch = IndexMap<Arc<SubscriptionGroup>, Vec<Arc<ItemDefinition>>>;

/// Tags sharing one [`Deadband`] and the protocol subscription serving them.
///
/// Identity (`Eq`/`Hash`) is the deadband key, which never changes.
#[derive(Debug)]
pub struct SubscriptionGroup {
    deadband: Deadband,
    members: RwLock<IndexMap<TagId, Arc<ItemDefinition>>>,
    subscription: Mutex<SubscriptionState>,
    apply: tokio::sync::Mutex<()>,
}

/// Protocol subscription of a group and the items created on it.
#[derive(Debug, Default)]
struct SubscriptionState {
    id: Option<SubscriptionId>,
    monitored: HashSet<ClientHandle>,
}

impl SubscriptionGroup {
    fn new(deadband: Deadband) -> Self {
        Self {
            deadband,
            members: RwLock::new(IndexMap::new()),
            subscription: Mutex::new(SubscriptionState::default()),
            apply: tokio::sync::Mutex::new(()),
        }
    }

    pub fn deadband(&self) -> Deadband {
        self.deadband
    }

    /// Publish interval of the protocol subscription.
    pub fn publish_interval(&self) -> Duration {
        self.deadband.time()
    }

    pub fn size(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn contains(&self, tag: TagId) -> bool {
        self.members.read().contains_key(&tag)
    }

    /// Snapshot of the member definitions.
    pub fn definitions(&self) -> Vec<Arc<ItemDefinition>> {
        self.members.read().values().cloned().collect()
    }

    /// Protocol subscription on the current session, absent until created.
    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription.lock().id
    }

    /// Replace the protocol subscription; items of the previous one are forgotten.
    pub fn set_subscription(&self, subscription: Option<SubscriptionId>) {
        let mut state = self.subscription.lock();
        state.id = subscription;
        state.monitored.clear();
    }

    /// Whether `handle` has a monitored item on the current subscription.
    pub fn is_monitored(&self, handle: ClientHandle) -> bool {
        self.subscription.lock().monitored.contains(&handle)
    }

    pub(crate) fn mark_monitored(&self, handle: ClientHandle) {
        self.subscription.lock().monitored.insert(handle);
    }

    pub(crate) fn unmark_monitored(&self, handle: ClientHandle) {
        self.subscription.lock().monitored.remove(&handle);
    }

    /// Serialises protocol changes of this group across tasks.
    pub(crate) async fn lock_apply(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.apply.lock().await
    }
}

impl PartialEq for SubscriptionGroup {
    fn eq(&self, other: &Self) -> bool {
        self.deadband == other.deadband
    }
}

impl Eq for SubscriptionGroup {}

impl Hash for SubscriptionGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.deadband.hash(state);
    }
}

#[derive(Debug, Default)]
struct MapperState {
    definitions: HashMap<TagId, Arc<ItemDefinition>>,
    deadbands: HashMap<TagId, Deadband>,
    handles: HashMap<ClientHandle, TagId>,
    groups: HashMap<Deadband, Arc<SubscriptionGroup>>,
}

impl MapperState {
    fn group(&mut self, deadband: Deadband) -> Arc<SubscriptionGroup> {
        self.groups
            .entry(deadband)
            .or_insert_with(|| {
                debug!(time_ms = deadband.time().as_millis() as u64, value = deadband.value(), kind = ?deadband.kind(), "subscription group created");
                Arc::new(SubscriptionGroup::new(deadband))
            })
            .clone()
    }
}

/// In-memory index of tag definitions, client handles and deadband groups.
#[derive(Debug)]
pub struct TagSubscriptionMapper {
    state: RwLock<MapperState>,
    next_handle: AtomicU32,
    min_time_deadband: Duration,
}

impl Default for TagSubscriptionMapper {
    fn default() -> Self {
        Self::new(Deadband::MIN_TIME)
    }
}

impl TagSubscriptionMapper {
    /// Mapper clamping time deadbands to `min_time_deadband`.
    pub fn new(min_time_deadband: Duration) -> Self {
        Self {
            state: RwLock::new(MapperState::default()),
            next_handle: AtomicU32::new(1),
            min_time_deadband,
        }
    }

    /// Clamped deadband of `tag`.
    pub fn deadband_of(&self, tag: &DataTag) -> Deadband {
        Deadband::of(tag, self.min_time_deadband)
    }

    /// Definition of `tag`, created on first use.
    ///
    /// Fails with a configuration error when the hardware address does not parse.
    pub fn get_or_create_definition(&self, tag: &DataTag) -> DaqResult<Arc<ItemDefinition>> {
        if let Some(definition) = self.state.read().definitions.get(&tag.id) {
            return Ok(definition.clone());
        }

        let invalid = |reason: String| {
            DaqError::configuration(format!("tag {} ({}): {}", tag.id, tag.name, reason))
        };
        let node = tag.address.node().map_err(invalid)?;
        let redundant_node = tag.address.redundant_node().map_err(invalid)?;
        let deadband = self.deadband_of(tag);

        let mut state = self.state.write();
        if let Some(definition) = state.definitions.get(&tag.id) {
            return Ok(definition.clone());
        }
        let handle = ClientHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let definition = Arc::new(ItemDefinition {
            tag: tag.id,
            node,
            redundant_node,
            handle,
        });
        state.definitions.insert(tag.id, definition.clone());
        state.deadbands.insert(tag.id, deadband);
        state.handles.insert(handle, tag.id);
        debug!(tag = %tag.id, handle = %handle, node = %definition.node, "item definition created");
        Ok(definition)
    }

    /// Group for `deadband`, created on first use.
    pub fn get_group(&self, deadband: Deadband) -> Arc<SubscriptionGroup> {
        if let Some(group) = self.state.read().groups.get(&deadband) {
            return group.clone();
        }
        self.state.write().group(deadband)
    }

    /// Group for the deadband `tag` declares.
    pub fn group_for_tag(&self, tag: &DataTag) -> Arc<SubscriptionGroup> {
        self.get_group(self.deadband_of(tag))
    }

    /// Add a defined tag to the group of its deadband.
    pub fn add_tag_to_group(&self, tag: TagId) -> DaqResult<Arc<SubscriptionGroup>> {
        let mut state = self.state.write();
        let (Some(definition), Some(deadband)) = (
            state.definitions.get(&tag).cloned(),
            state.deadbands.get(&tag).copied(),
        ) else {
            return Err(DaqError::configuration(format!(
                "tag {} has no definition",
                tag
            )));
        };
        let group = state.group(deadband);
        group.members.write().insert(tag, definition);
        Ok(group)
    }

    /// Forget `tag`: its group membership, handle and definition.
    ///
    /// Returns `true` iff the tag was known.
    pub fn remove_tag(&self, tag: TagId) -> bool {
        let mut state = self.state.write();
        let Some(definition) = state.definitions.remove(&tag) else {
            return false;
        };
        state.handles.remove(&definition.handle);
        if let Some(deadband) = state.deadbands.remove(&tag) {
            if let Some(group) = state.groups.get(&deadband) {
                group.members.write().shift_remove(&tag);
            }
        }
        debug!(tag = %tag, handle = %definition.handle, "tag removed");
        true
    }

    /// Tag served by a client handle.
    pub fn get_tag_id(&self, handle: ClientHandle) -> Option<TagId> {
        self.state.read().handles.get(&handle).copied()
    }

    pub fn definition(&self, tag: TagId) -> Option<Arc<ItemDefinition>> {
        self.state.read().definitions.get(&tag).cloned()
    }

    /// Group `tag` is currently a member of.
    pub fn group_of(&self, tag: TagId) -> Option<Arc<SubscriptionGroup>> {
        let state = self.state.read();
        let deadband = state.deadbands.get(&tag)?;
        state
            .groups
            .get(deadband)
            .filter(|group| group.contains(tag))
            .cloned()
    }

    /// Group `tag` belongs to by its deadband, whether or not it has joined yet.
    pub fn deadband_group(&self, tag: TagId) -> Option<Arc<SubscriptionGroup>> {
        let mut state = self.state.write();
        let deadband = *state.deadbands.get(&tag)?;
        Some(state.group(deadband))
    }

    /// Group whose protocol subscription is `subscription`.
    pub fn group_for_subscription(
        &self,
        subscription: SubscriptionId,
    ) -> Option<Arc<SubscriptionGroup>> {
        self.state
            .read()
            .groups
            .values()
            .find(|group| group.subscription() == Some(subscription))
            .cloned()
    }

    /// Every non-empty group with its member definitions.
    pub fn batch(&self) -> GroupBatch {
        let state = self.state.read();
        state
            .groups
            .values()
            .filter(|group| !group.is_empty())
            .map(|group| (group.clone(), group.definitions()))
            .collect()
    }

    /// Forget every protocol subscription handle, e.g. before applying groups to a new session.
    pub fn reset_subscriptions(&self) {
        for group in self.state.read().groups.values() {
            group.set_subscription(None);
        }
    }

    /// Number of known definitions.
    pub fn len(&self) -> usize {
        self.state.read().definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all state.
    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = MapperState::default();
        debug!("tag subscription mapper cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{AddressType, HardwareAddress};
    use r_daq_net::DeadbandType;

    fn tag(id: u64, time_ms: u64) -> DataTag {
        DataTag::new(
            TagId(id),
            format!("tag-{id}"),
            HardwareAddress::new(2, format!("Item{id}"), AddressType::String),
        )
        .with_deadband(Duration::from_millis(time_ms), 0.0, DeadbandType::None)
    }

    #[test]
    fn definitions_are_idempotent_with_increasing_handles() {
        let mapper = TagSubscriptionMapper::default();
        let first = mapper.get_or_create_definition(&tag(1, 1000)).unwrap();
        let again = mapper.get_or_create_definition(&tag(1, 1000)).unwrap();
        let second = mapper.get_or_create_definition(&tag(2, 1000)).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(second.handle > first.handle);
        assert_eq!(mapper.get_tag_id(second.handle), Some(TagId(2)));
    }

    #[test]
    fn unparseable_addresses_are_configuration_errors() {
        let mapper = TagSubscriptionMapper::default();
        let bad = DataTag::new(
            TagId(9),
            "bad",
            HardwareAddress::new(2, "not-a-number", AddressType::Numeric),
        );
        let err = mapper.get_or_create_definition(&bad).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(mapper.is_empty());
    }

    #[test]
    fn equal_deadbands_share_one_group() {
        let mapper = TagSubscriptionMapper::default();
        let tags = [tag(1, 100), tag(2, 300), tag(3, 500), tag(4, 2000)];
        for t in &tags {
            mapper.get_or_create_definition(t).unwrap();
            mapper.add_tag_to_group(t.id).unwrap();
        }
        mapper.add_tag_to_group(TagId(1)).unwrap();

        let group = mapper.group_for_tag(&tags[0]);
        assert!(Arc::ptr_eq(&group, &mapper.group_for_tag(&tags[1])));
        assert!(Arc::ptr_eq(&group, &mapper.group_for_tag(&tags[2])));
        assert_eq!(group.size(), 3);
        assert_eq!(group.publish_interval(), Duration::from_millis(500));
        assert_eq!(mapper.group_for_tag(&tags[3]).size(), 1);
        assert_eq!(mapper.batch().len(), 2);
    }

    #[test]
    fn add_requires_a_definition() {
        let mapper = TagSubscriptionMapper::default();
        assert!(mapper.add_tag_to_group(TagId(5)).is_err());
    }

    #[test]
    fn remove_tag_drops_membership_and_definition() {
        let mapper = TagSubscriptionMapper::default();
        let t = tag(1, 1000);
        let definition = mapper.get_or_create_definition(&t).unwrap();
        let group = mapper.add_tag_to_group(t.id).unwrap();

        assert!(mapper.remove_tag(t.id));
        assert!(!mapper.remove_tag(t.id));
        assert!(group.is_empty());
        assert!(mapper.definition(t.id).is_none());
        assert!(mapper.get_tag_id(definition.handle).is_none());
        assert!(mapper.group_of(t.id).is_none());
    }

    #[test]
    fn subscriptions_resolve_and_reset() {
        let mapper = TagSubscriptionMapper::default();
        let t = tag(1, 1000);
        mapper.get_or_create_definition(&t).unwrap();
        let group = mapper.add_tag_to_group(t.id).unwrap();
        group.set_subscription(Some(SubscriptionId(42)));
        group.mark_monitored(ClientHandle(1));
        assert!(group.is_monitored(ClientHandle(1)));

        let found = mapper.group_for_subscription(SubscriptionId(42)).unwrap();
        assert!(Arc::ptr_eq(&found, &group));
        mapper.reset_subscriptions();
        assert_eq!(group.subscription(), None);
        assert!(!group.is_monitored(ClientHandle(1)));

        mapper.clear();
        assert!(mapper.is_empty());
        assert!(mapper.batch().is_empty());
    }

    #[test]
    fn concurrent_readers_and_writers_stay_consistent() {
        let mapper = Arc::new(TagSubscriptionMapper::default());
        let writers: Vec<_> = (0..4u64)
            .map(|w| {
                let mapper = mapper.clone();
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        let t = tag(w * 1000 + i, 1000);
                        let definition = mapper.get_or_create_definition(&t).unwrap();
                        mapper.add_tag_to_group(t.id).unwrap();
                        assert_eq!(mapper.get_tag_id(definition.handle), Some(t.id));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(mapper.len(), 400);
        assert_eq!(mapper.group_for_tag(&tag(0, 1000)).size(), 400);
    }
}
