use std::collections::{BTreeSet, HashMap};

use crate::core::Target;
use crate::model::{DocumentKeySet, ResourcePath, SnapshotVersion};

/// How completely a field index covers a target's filters and order-bys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    /// No usable index; the query must scan.
    None,
    /// The index narrows the candidate set but cannot enforce the limit.
    Partial,
    /// The index answers the query exactly.
    Full,
}

/// Index metadata backing query execution. Every backend tracks which
/// collection ids exist under which parent paths (collection-group queries
/// fan out over the parents); durable backends may additionally maintain
/// field indexes that accelerate or fully answer targets.
pub trait IndexManager: Send {
    /// Records that a collection exists at `collection_path` so collection
    /// group queries can find it.
    fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath);

    /// Parent paths of every known collection named `collection_id`, in path
    /// order.
    fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath>;

    fn index_type(&self, target: &Target) -> IndexType;

    /// Keys an index reports as matching `target`, or `None` when no usable
    /// index exists.
    fn documents_matching_target(&self, target: &Target) -> Option<DocumentKeySet>;

    /// Read time up to which the backing index has processed documents; a
    /// partial-index query re-scans everything newer.
    fn offset_read_time(&self, target: &Target) -> SnapshotVersion;
}

/// Keeps the collection-parent index only; reports no field indexes, which
/// routes every query through the scan paths.
#[derive(Default)]
pub struct MemoryIndexManager {
    collection_parents: HashMap<String, BTreeSet<ResourcePath>>,
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexManager for MemoryIndexManager {
    fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) {
        let Some(collection_id) = collection_path.last_segment() else {
            return;
        };
        self.collection_parents
            .entry(collection_id.to_string())
            .or_default()
            .insert(collection_path.without_last());
    }

    fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn index_type(&self, _target: &Target) -> IndexType {
        IndexType::None
    }

    fn documents_matching_target(&self, _target: &Target) -> Option<DocumentKeySet> {
        None
    }

    fn offset_read_time(&self, _target: &Target) -> SnapshotVersion {
        SnapshotVersion::MIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> ResourcePath {
        ResourcePath::from_string(s).unwrap()
    }

    #[test]
    fn tracks_parents_per_collection_id() {
        let mut manager = MemoryIndexManager::new();
        manager.add_to_collection_parent_index(&path("rooms"));
        manager.add_to_collection_parent_index(&path("rooms/a/messages"));
        manager.add_to_collection_parent_index(&path("rooms/b/messages"));
        manager.add_to_collection_parent_index(&path("rooms/b/messages"));

        let parents = manager.get_collection_parents("messages");
        assert_eq!(parents, vec![path("rooms/a"), path("rooms/b")]);
        assert_eq!(manager.get_collection_parents("rooms"), vec![ResourcePath::root()]);
        assert!(manager.get_collection_parents("missing").is_empty());
    }
}
