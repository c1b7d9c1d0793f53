use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, DocumentKeySet, TargetId};

/// A two-way mapping between document keys and numeric ids (target ids or
/// similar). Supports lookup in both directions.
#[derive(Default)]
pub struct ReferenceSet {
    by_key: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    by_id: BTreeMap<TargetId, DocumentKeySet>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: TargetId) {
        self.by_key.entry(key.clone()).or_default().insert(id);
        self.by_id.entry(id).or_default().insert(key);
    }

    pub fn add_references(&mut self, keys: &DocumentKeySet, id: TargetId) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: TargetId) {
        if let Some(ids) = self.by_key.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_key.remove(key);
            }
        }
        if let Some(keys) = self.by_id.get_mut(&id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_id.remove(&id);
            }
        }
    }

    pub fn remove_references(&mut self, keys: &DocumentKeySet, id: TargetId) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held under `id` and returns the keys that were
    /// referenced.
    pub fn remove_references_for_id(&mut self, id: TargetId) -> Vec<DocumentKey> {
        let keys = self.by_id.remove(&id).unwrap_or_default();
        for key in &keys {
            if let Some(ids) = self.by_key.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        keys.into_iter().collect()
    }

    pub fn references_for_id(&self, id: TargetId) -> DocumentKeySet {
        self.by_id.get(&id).cloned().unwrap_or_default()
    }

    /// Whether any id references `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }
}
