use std::collections::BTreeMap;

use crate::core::Query;
use crate::model::{DocumentKey, DocumentKeySet, DocumentSet, MutableDocument};

/// How a document moved relative to the previous snapshot of its view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only `has_pending_writes` changed; the data is untouched.
    Metadata,
}

#[derive(Clone, Debug)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: MutableDocument,
}

/// Whether a view has caught up with the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// Accumulates per-document changes, merging repeated changes to the same key
/// into the single change a consumer should observe.
#[derive(Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(previous) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::{Added, Metadata, Modified, Removed};
        let merged = match (previous.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                document: change.document,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: previous.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            // Remaining combinations cannot arise from a consistent diff;
            // keep the newer change.
            _ => Some(change),
        };

        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    /// The merged changes in document key order.
    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// One consistent result set for a query plus the diff from the previous one.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    /// Keys with unacknowledged local mutations.
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    /// Set when metadata-only changes were intentionally dropped because the
    /// listener did not ask for them.
    pub excludes_metadata_changes: bool,
}

impl ViewSnapshot {
    /// A snapshot presenting `documents` as all newly added, for a listener's
    /// first event.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        let old_documents = documents.empty_copy();
        Self {
            query,
            documents,
            old_documents,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}
