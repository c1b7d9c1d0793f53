use std::collections::HashMap;

use crate::core::{Target, TargetIdGenerator};
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, DocumentKeySet, ListenSequenceNumber, SnapshotVersion, TargetId};

/// Durable record of every allocated target: its id, resume state, and the
/// set of document keys the server last reported as matching it.
pub trait TargetCache: Send {
    fn allocate_target_id(&mut self) -> TargetId;

    fn add_target_data(&mut self, target_data: TargetData);

    fn update_target_data(&mut self, target_data: TargetData);

    /// Drops the target and its matching-key associations.
    fn remove_target_data(&mut self, target_id: TargetId);

    fn get_target_data(&self, target: &Target) -> Option<TargetData>;

    fn target_count(&self) -> usize;

    fn highest_sequence_number(&self) -> ListenSequenceNumber;

    fn highest_target_id(&self) -> TargetId;

    fn get_last_remote_snapshot_version(&self) -> SnapshotVersion;

    /// Records global listen progress. A min `snapshot_version` leaves the
    /// last remote snapshot version untouched.
    fn set_targets_metadata(
        &mut self,
        sequence_number: ListenSequenceNumber,
        snapshot_version: SnapshotVersion,
    );

    fn add_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId);

    fn remove_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId);

    fn remove_matching_keys_for_target(&mut self, target_id: TargetId);

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet;

    /// Whether any target holds `key` in its matching set.
    fn contains_key(&self, key: &DocumentKey) -> bool;

    fn all_targets(&self) -> Vec<TargetData>;

    /// Evicts every target whose sequence number is at or below `upper_bound`
    /// and which is not in `active_targets`, returning the eviction count.
    fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_targets: &HashMap<TargetId, TargetData>,
    ) -> usize;
}

pub struct MemoryTargetCache {
    /// Keyed by the target's canonical id.
    targets: HashMap<String, TargetData>,
    references: ReferenceSet,
    id_generator: TargetIdGenerator,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self {
            targets: HashMap::new(),
            references: ReferenceSet::new(),
            id_generator: TargetIdGenerator::for_target_cache(),
            highest_target_id: 0,
            highest_sequence_number: 0,
            last_remote_snapshot_version: SnapshotVersion::MIN,
        }
    }

    fn save(&mut self, target_data: TargetData) {
        self.highest_target_id = self.highest_target_id.max(target_data.target_id);
        self.highest_sequence_number = self
            .highest_sequence_number
            .max(target_data.sequence_number);
        self.targets
            .insert(target_data.target.canonical_id(), target_data);
    }
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetCache for MemoryTargetCache {
    fn allocate_target_id(&mut self) -> TargetId {
        let id = self.id_generator.next();
        self.highest_target_id = self.highest_target_id.max(id);
        id
    }

    fn add_target_data(&mut self, target_data: TargetData) {
        self.save(target_data);
    }

    fn update_target_data(&mut self, target_data: TargetData) {
        self.save(target_data);
    }

    fn remove_target_data(&mut self, target_id: TargetId) {
        self.targets
            .retain(|_, data| data.target_id != target_id);
        self.references.remove_references_for_id(target_id);
    }

    fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.targets.get(&target.canonical_id()).cloned()
    }

    fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn highest_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    fn highest_target_id(&self) -> TargetId {
        self.highest_target_id
    }

    fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    fn set_targets_metadata(
        &mut self,
        sequence_number: ListenSequenceNumber,
        snapshot_version: SnapshotVersion,
    ) {
        self.highest_sequence_number = self.highest_sequence_number.max(sequence_number);
        if !snapshot_version.is_min() {
            self.last_remote_snapshot_version = snapshot_version;
        }
    }

    fn add_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        self.references.add_references(keys, target_id);
    }

    fn remove_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        self.references.remove_references(keys, target_id);
    }

    fn remove_matching_keys_for_target(&mut self, target_id: TargetId) {
        self.references.remove_references_for_id(target_id);
    }

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet {
        self.references.references_for_id(target_id)
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }

    fn all_targets(&self) -> Vec<TargetData> {
        self.targets.values().cloned().collect()
    }

    fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_targets: &HashMap<TargetId, TargetData>,
    ) -> usize {
        let doomed: Vec<TargetId> = self
            .targets
            .values()
            .filter(|data| {
                data.sequence_number <= upper_bound
                    && !active_targets.contains_key(&data.target_id)
            })
            .map(|data| data.target_id)
            .collect();
        for target_id in &doomed {
            self.remove_target_data(*target_id);
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::local::target_data::TargetPurpose;
    use crate::model::Timestamp;

    fn target(path: &str) -> Target {
        Query::at_path(crate::model::ResourcePath::from_string(path).unwrap()).to_target()
    }

    fn target_data(path: &str, target_id: TargetId, sequence_number: i64) -> TargetData {
        TargetData::new(target(path), target_id, TargetPurpose::Listen, sequence_number)
    }

    #[test]
    fn allocated_ids_are_even_and_increasing() {
        let mut cache = MemoryTargetCache::new();
        assert_eq!(cache.allocate_target_id(), 2);
        assert_eq!(cache.allocate_target_id(), 4);
        assert_eq!(cache.highest_target_id(), 4);
    }

    #[test]
    fn lookup_by_target_ignores_id() {
        let mut cache = MemoryTargetCache::new();
        cache.add_target_data(target_data("rooms", 2, 10));

        let found = cache.get_target_data(&target("rooms")).unwrap();
        assert_eq!(found.target_id, 2);
        assert!(cache.get_target_data(&target("other")).is_none());
        assert_eq!(cache.target_count(), 1);
        assert_eq!(cache.highest_sequence_number(), 10);
    }

    #[test]
    fn removing_target_drops_matching_keys() {
        let mut cache = MemoryTargetCache::new();
        cache.add_target_data(target_data("rooms", 2, 1));
        let mut keys = DocumentKeySet::new();
        keys.insert(DocumentKey::from_string("rooms/a").unwrap());
        cache.add_matching_keys(&keys, 2);
        assert!(cache.contains_key(&DocumentKey::from_string("rooms/a").unwrap()));

        cache.remove_target_data(2);
        assert_eq!(cache.target_count(), 0);
        assert!(!cache.contains_key(&DocumentKey::from_string("rooms/a").unwrap()));
    }

    #[test]
    fn eviction_skips_active_and_recent_targets() {
        let mut cache = MemoryTargetCache::new();
        cache.add_target_data(target_data("a", 2, 1));
        cache.add_target_data(target_data("b", 4, 2));
        cache.add_target_data(target_data("c", 6, 3));

        let mut active = HashMap::new();
        active.insert(4, target_data("b", 4, 2));

        let removed = cache.remove_targets(2, &active);
        assert_eq!(removed, 1);
        assert!(cache.get_target_data(&target("a")).is_none());
        assert!(cache.get_target_data(&target("b")).is_some());
        assert!(cache.get_target_data(&target("c")).is_some());
    }

    #[test]
    fn metadata_keeps_newest_remote_version() {
        let mut cache = MemoryTargetCache::new();
        let version = SnapshotVersion::new(Timestamp::new(10, 0));
        cache.set_targets_metadata(5, version);
        assert_eq!(cache.get_last_remote_snapshot_version(), version);

        cache.set_targets_metadata(6, SnapshotVersion::MIN);
        assert_eq!(cache.get_last_remote_snapshot_version(), version);
        assert_eq!(cache.highest_sequence_number(), 6);
    }
}
