use std::collections::BTreeMap;

use crate::model::{
    DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, ResourcePath, SnapshotVersion,
};
use crate::value::{FieldValue, MapValue, ValueKind};

/// Cache of document states received from the backend (found documents,
/// tombstones, and unknown documents), keyed by document key and stamped with
/// the read time they were received at.
pub trait RemoteDocumentCache: Send {
    /// Stores `document`, which must carry a non-min read time.
    fn add_entry(&mut self, document: MutableDocument);

    fn remove_entry(&mut self, key: &DocumentKey);

    /// The cached state for `key`, or an invalid document when nothing is
    /// cached. Callers get their own mutable copy.
    fn get_entry(&self, key: &DocumentKey) -> MutableDocument;

    fn get_entries(&self, keys: &DocumentKeySet) -> DocumentMap;

    /// All cached documents directly inside `collection` whose read time is
    /// strictly newer than `since_read_time`.
    fn get_all_from_collection(
        &self,
        collection: &ResourcePath,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap;

    fn get_all_keys(&self) -> Vec<DocumentKey>;

    /// Approximate bytes used; feeds the eviction threshold check.
    fn byte_size(&self) -> u64;
}

#[derive(Default)]
pub struct MemoryRemoteDocumentCache {
    documents: BTreeMap<DocumentKey, MutableDocument>,
    byte_size: u64,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn add_entry(&mut self, document: MutableDocument) {
        let key = document.key().clone();
        if let Some(previous) = self.documents.get(&key) {
            self.byte_size -= document_byte_size(previous);
        }
        self.byte_size += document_byte_size(&document);
        self.documents.insert(key, document);
    }

    fn remove_entry(&mut self, key: &DocumentKey) {
        if let Some(previous) = self.documents.remove(key) {
            self.byte_size -= document_byte_size(&previous);
        }
    }

    fn get_entry(&self, key: &DocumentKey) -> MutableDocument {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid(key.clone()))
    }

    fn get_entries(&self, keys: &DocumentKeySet) -> DocumentMap {
        keys.iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    fn get_all_from_collection(
        &self,
        collection: &ResourcePath,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        // Range scan over the ordered key space: all keys with the collection
        // path as a strict prefix, then keep immediate children only. An empty
        // final segment sorts before every real document id.
        let mut results = DocumentMap::new();
        let Ok(start) = DocumentKey::from_segments(
            collection
                .as_vec()
                .iter()
                .cloned()
                .chain(std::iter::once(String::new())),
        ) else {
            return results;
        };
        for (key, document) in self.documents.range(start..) {
            if !collection.is_prefix_of(key.path()) {
                break;
            }
            if key.path().len() != collection.len() + 1 {
                continue;
            }
            if document.read_time() <= since_read_time {
                continue;
            }
            results.insert(key.clone(), document.clone());
        }
        results
    }

    fn get_all_keys(&self) -> Vec<DocumentKey> {
        self.documents.keys().cloned().collect()
    }

    fn byte_size(&self) -> u64 {
        self.byte_size
    }
}

fn document_byte_size(document: &MutableDocument) -> u64 {
    let mut size = document.key().to_string().len() as u64 + 32;
    size += map_byte_size(document.data());
    size
}

fn map_byte_size(map: &MapValue) -> u64 {
    map.fields()
        .iter()
        .map(|(name, value)| name.len() as u64 + value_byte_size(value))
        .sum()
}

fn value_byte_size(value: &FieldValue) -> u64 {
    match value.kind() {
        ValueKind::Null | ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 8,
        ValueKind::Timestamp(_) => 12,
        ValueKind::String(s) => s.len() as u64,
        ValueKind::Bytes(b) => b.as_slice().len() as u64,
        ValueKind::Reference(r) => r.len() as u64,
        ValueKind::GeoPoint(_) => 16,
        ValueKind::Array(array) => array.values().iter().map(value_byte_size).sum(),
        ValueKind::Map(map) => map_byte_size(map),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, read_seconds: i64) -> MutableDocument {
        let mut document = MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            version(read_seconds),
            SnapshotVersion::MIN,
            MapValue::empty(),
        );
        document.set_read_time(version(read_seconds));
        document
    }

    #[test]
    fn missing_entries_come_back_invalid() {
        let cache = MemoryRemoteDocumentCache::new();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        assert!(!cache.get_entry(&key).is_valid_document());
    }

    #[test]
    fn collection_scan_excludes_subcollections() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("rooms/a", 1));
        cache.add_entry(doc("rooms/a/messages/m", 1));
        cache.add_entry(doc("rooms/b", 1));
        cache.add_entry(doc("other/x", 1));

        let collection = ResourcePath::from_string("rooms").unwrap();
        let results = cache.get_all_from_collection(&collection, SnapshotVersion::MIN);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn collection_scan_honors_read_time_floor() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("rooms/a", 1));
        cache.add_entry(doc("rooms/b", 5));

        let collection = ResourcePath::from_string("rooms").unwrap();
        let results = cache.get_all_from_collection(&collection, version(1));
        assert_eq!(results.len(), 1);
        assert!(results.contains_key(&DocumentKey::from_string("rooms/b").unwrap()));
    }

    #[test]
    fn size_accounting_tracks_replacements() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("rooms/a", 1));
        let initial = cache.byte_size();
        cache.add_entry(doc("rooms/a", 2));
        assert_eq!(cache.byte_size(), initial);
        cache.remove_entry(&DocumentKey::from_string("rooms/a").unwrap());
        assert_eq!(cache.byte_size(), 0);
    }
}
