use std::collections::{BTreeMap, HashMap};

use crate::model::{BatchId, DocumentKey, DocumentKeySet, ResourcePath};
use crate::mutation::{Mutation, Overlay};

pub type OverlayMap = BTreeMap<DocumentKey, Overlay>;

/// Precomputed local views of mutated documents. Each overlay condenses every
/// queued batch touching one document into a single mutation so reads never
/// replay the mutation queue.
pub trait DocumentOverlayCache: Send {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay>;

    fn get_overlays(&self, keys: &DocumentKeySet) -> OverlayMap;

    /// Stores the given key-to-mutation map, attributing every entry to
    /// `largest_batch_id`. Entries replace any older overlay for the same key.
    fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: BTreeMap<DocumentKey, Mutation>);

    /// Drops all overlays created by `batch_id`. `keys` names the documents
    /// the batch affected.
    fn remove_overlays_for_batch_id(&mut self, keys: &DocumentKeySet, batch_id: BatchId);

    /// Overlays for immediate children of `collection` whose batch id is
    /// strictly greater than `since_batch_id`.
    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> OverlayMap;

    /// Overlays for `collection_group` newer than `since_batch_id`. Returns
    /// whole batches: processing stops at the first batch boundary after
    /// `count` documents have been collected.
    fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> OverlayMap;
}

#[derive(Default)]
pub struct MemoryDocumentOverlayCache {
    overlays: OverlayMap,
    overlay_keys_by_batch_id: HashMap<BatchId, DocumentKeySet>,
}

impl MemoryDocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn save_overlay(&mut self, largest_batch_id: BatchId, mutation: Mutation) {
        let key = mutation.key().clone();
        if let Some(existing) = self.overlays.get(&key) {
            if let Some(keys) = self.overlay_keys_by_batch_id.get_mut(&existing.largest_batch_id) {
                keys.remove(&key);
            }
        }
        self.overlays
            .insert(key.clone(), Overlay::new(largest_batch_id, mutation));
        self.overlay_keys_by_batch_id
            .entry(largest_batch_id)
            .or_default()
            .insert(key);
    }
}

impl DocumentOverlayCache for MemoryDocumentOverlayCache {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay> {
        self.overlays.get(key).cloned()
    }

    fn get_overlays(&self, keys: &DocumentKeySet) -> OverlayMap {
        keys.iter()
            .filter_map(|key| self.get_overlay(key).map(|overlay| (key.clone(), overlay)))
            .collect()
    }

    fn save_overlays(
        &mut self,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Mutation>,
    ) {
        for (_, mutation) in overlays {
            self.save_overlay(largest_batch_id, mutation);
        }
    }

    fn remove_overlays_for_batch_id(&mut self, _keys: &DocumentKeySet, batch_id: BatchId) {
        if let Some(keys) = self.overlay_keys_by_batch_id.remove(&batch_id) {
            for key in keys {
                self.overlays.remove(&key);
            }
        }
    }

    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> OverlayMap {
        let mut results = OverlayMap::new();
        let Ok(start) = DocumentKey::from_segments(
            collection
                .as_vec()
                .iter()
                .cloned()
                .chain(std::iter::once(String::new())),
        ) else {
            return results;
        };
        for (key, overlay) in self.overlays.range(start..) {
            if !collection.is_prefix_of(key.path()) {
                break;
            }
            if key.path().len() != collection.len() + 1 {
                continue;
            }
            if overlay.largest_batch_id > since_batch_id {
                results.insert(key.clone(), overlay.clone());
            }
        }
        results
    }

    fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> OverlayMap {
        let mut by_batch_id: BTreeMap<BatchId, Vec<&Overlay>> = BTreeMap::new();
        for (key, overlay) in &self.overlays {
            if key.collection_group() != Some(collection_group) {
                continue;
            }
            if overlay.largest_batch_id > since_batch_id {
                by_batch_id
                    .entry(overlay.largest_batch_id)
                    .or_default()
                    .push(overlay);
            }
        }

        // Take whole batches until the requested count is reached so a later
        // query sees either all or none of a batch's effects.
        let mut results = OverlayMap::new();
        for (_, overlays) in by_batch_id {
            for overlay in overlays {
                results.insert(overlay.key().clone(), overlay.clone());
            }
            if results.len() >= count {
                break;
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set_mutation(path: &str) -> Mutation {
        Mutation::set(key(path), MapValue::empty())
    }

    fn save(cache: &mut MemoryDocumentOverlayCache, batch_id: BatchId, paths: &[&str]) {
        let overlays = paths
            .iter()
            .map(|path| (key(path), set_mutation(path)))
            .collect();
        cache.save_overlays(batch_id, overlays);
    }

    #[test]
    fn newer_batches_replace_older_overlays() {
        let mut cache = MemoryDocumentOverlayCache::new();
        save(&mut cache, 1, &["rooms/a"]);
        save(&mut cache, 2, &["rooms/a"]);

        assert_eq!(cache.get_overlay(&key("rooms/a")).unwrap().largest_batch_id, 2);

        // Removing the superseded batch must not delete the newer overlay.
        cache.remove_overlays_for_batch_id(&DocumentKeySet::new(), 1);
        assert!(cache.get_overlay(&key("rooms/a")).is_some());
        cache.remove_overlays_for_batch_id(&DocumentKeySet::new(), 2);
        assert!(cache.get_overlay(&key("rooms/a")).is_none());
    }

    #[test]
    fn collection_scan_respects_batch_floor() {
        let mut cache = MemoryDocumentOverlayCache::new();
        save(&mut cache, 1, &["rooms/a"]);
        save(&mut cache, 2, &["rooms/b", "rooms/a/messages/m"]);
        save(&mut cache, 3, &["other/x"]);

        let collection = ResourcePath::from_string("rooms").unwrap();
        let all = cache.get_overlays_for_collection(&collection, -1);
        assert_eq!(all.len(), 2);

        let recent = cache.get_overlays_for_collection(&collection, 1);
        assert_eq!(recent.len(), 1);
        assert!(recent.contains_key(&key("rooms/b")));
    }

    #[test]
    fn collection_group_scan_keeps_batches_whole() {
        let mut cache = MemoryDocumentOverlayCache::new();
        save(&mut cache, 1, &["rooms/a/messages/m1"]);
        save(&mut cache, 2, &["rooms/b/messages/m2", "rooms/b/messages/m3"]);
        save(&mut cache, 3, &["rooms/c/messages/m4"]);

        // Asking for two documents lands mid-batch 2, which is still included
        // in full; batch 3 is not.
        let results = cache.get_overlays_for_collection_group("messages", 0, 2);
        assert_eq!(results.len(), 3);
        assert!(!results.contains_key(&key("rooms/c/messages/m4")));
    }
}
