use std::cmp::Ordering;
use std::mem;

use crate::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::core::Query;
use crate::model::{
    DocumentComparator, DocumentKey, DocumentKeySet, DocumentMap, DocumentSet, MutableDocument,
};
use crate::remote::{OnlineState, TargetChange};

/// The document state a view computed from a batch of changes, held apart
/// from the view itself so a refill query can be folded in before anything
/// is committed.
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: DocumentKeySet,
    /// The changes were computed against an incomplete document set (a limit
    /// query shrank below its limit) and must be recomputed from a full local
    /// query before they can be applied.
    pub needs_refill: bool,
}

/// A document entering or leaving limbo from this view's perspective.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// What applying a batch of changes produced: possibly a snapshot to hand to
/// listeners, plus limbo membership changes for the sync engine to act on.
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// The materialized result set of one query, diffed incrementally as local
/// writes and remote events arrive. The view owns the decision of what a
/// listener observes: which documents are in the result, whether the result
/// is from cache, and which documents have fallen into limbo.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    /// `None` until the first `apply_changes`, so the initial snapshot always
    /// reports a sync-state change.
    sync_state: Option<SyncState>,
    /// Keys the server has confirmed as part of this view's target.
    synced_documents: DocumentKeySet,
    document_set: DocumentSet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
    /// Server said the target is caught up to the last snapshot it sent.
    current: bool,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let comparator = query.comparator();
        let document_set = DocumentSet::new(comparator.clone());
        Self {
            query,
            comparator,
            sync_state: None,
            synced_documents,
            document_set,
            limbo_documents: DocumentKeySet::new(),
            mutated_keys: DocumentKeySet::new(),
            current: false,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Keys the server has told us belong to this view's target. Drives
    /// existence-filter comparisons and resume behavior.
    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    /// Diffs `doc_changes` against the current result set without mutating the
    /// view. Pass the result of a previous call as `previous` to layer a
    /// refill query's documents on top of changes already computed.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        // A change that lands past the boundary document of a full limit
        // query may pull a previously trimmed document back into the result.
        // The cache alone cannot tell us which one, so flag for a refill.
        let limit = self.query.limit();
        let last_doc_in_limit = match limit {
            Some(limit)
                if self.query.has_limit_to_first()
                    && old_document_set.len() as i32 == limit =>
            {
                old_document_set.last().cloned()
            }
            _ => None,
        };
        let first_doc_in_limit = match limit {
            Some(limit)
                if self.query.has_limit_to_last() && old_document_set.len() as i32 == limit =>
            {
                old_document_set.first().cloned()
            }
            _ => None,
        };

        for (key, entry) in doc_changes {
            let old_doc = old_document_set.get(key).cloned();
            let new_doc = if self.query.matches(entry) {
                Some(entry.clone())
            } else {
                None
            };
            let old_doc_had_pending_mutations = old_doc
                .as_ref()
                .map(|_| self.mutated_keys.contains(key))
                .unwrap_or(false);
            let new_doc_has_pending_mutations = new_doc
                .as_ref()
                .map(|doc| {
                    doc.has_local_mutations()
                        || (self.mutated_keys.contains(key) && doc.has_committed_mutations())
                })
                .unwrap_or(false);
            let mut change_applied = false;

            match (&old_doc, &new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !Self::should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new_doc.clone(),
                            });
                            change_applied = true;
                            if self.outside_limit_bounds(
                                new_doc,
                                last_doc_in_limit.as_ref(),
                                first_doc_in_limit.as_ref(),
                            ) {
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new_doc.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new_doc.clone(),
                    });
                    change_applied = true;
                    if self.outside_limit_bounds(
                        new_doc,
                        last_doc_in_limit.as_ref(),
                        first_doc_in_limit.as_ref(),
                    ) {
                        needs_refill = true;
                    }
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old_doc.clone(),
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        let has_pending = new_doc_has_pending_mutations;
                        new_document_set.add(new_doc);
                        if has_pending {
                            new_mutated_keys.insert(key.clone());
                        } else {
                            new_mutated_keys.remove(key);
                        }
                    }
                    None => {
                        new_document_set.remove(key);
                        new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            if self.query.has_limit_to_first() || self.query.has_limit_to_last() {
                while new_document_set.len() as i32 > limit {
                    let overflow = if self.query.has_limit_to_first() {
                        new_document_set.last().cloned()
                    } else {
                        new_document_set.first().cloned()
                    };
                    let Some(overflow) = overflow else { break };
                    new_document_set.remove(overflow.key());
                    new_mutated_keys.remove(overflow.key());
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: overflow,
                    });
                }
            }
        }

        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            mutated_keys: new_mutated_keys,
            needs_refill,
        }
    }

    /// A locally mutated document whose acknowledged version has come back
    /// without the watcher's confirming update would flicker to the base
    /// value and then back. Hold the view until the watcher catches up.
    fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
        old_doc.has_local_mutations()
            && new_doc.has_committed_mutations()
            && !new_doc.has_local_mutations()
    }

    fn outside_limit_bounds(
        &self,
        doc: &MutableDocument,
        last_doc_in_limit: Option<&MutableDocument>,
        first_doc_in_limit: Option<&MutableDocument>,
    ) -> bool {
        if let Some(last) = last_doc_in_limit {
            if (self.comparator)(doc, last) == Ordering::Greater {
                return true;
            }
        }
        if let Some(first) = first_doc_in_limit {
            if (self.comparator)(doc, first) == Ordering::Less {
                return true;
            }
        }
        false
    }

    /// Commits computed changes to the view and decides what, if anything, a
    /// listener should see. `target_is_pending_reset` suppresses both the
    /// synced state and limbo detection while an existence-filter mismatch is
    /// being resolved, since the server is about to resend the target.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        } = doc_changes;
        debug_assert!(!needs_refill, "cannot apply changes that still need a refill");

        let old_documents = mem::replace(&mut self.document_set, document_set);
        self.mutated_keys = mutated_keys;

        let mut changes = change_set.into_changes();
        let comparator = self.comparator.clone();
        changes.sort_by(|left, right| {
            Self::change_type_order(left.change_type)
                .cmp(&Self::change_type_order(right.change_type))
                .then_with(|| (comparator)(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            documents: self.document_set.clone(),
            old_documents,
            doc_changes: changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline drops a synced view back to from-cache so listeners
    /// waiting on server confirmation learn it is not coming.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let doc_changes = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            self.apply_changes(doc_changes, false, None, false)
        } else {
            ViewChange {
                snapshot: None,
                limbo_changes: Vec::new(),
            }
        }
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(target_change) = target_change else {
            return;
        };
        for key in &target_change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &target_change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = target_change.current;
    }

    /// Recomputes the limbo set against the current result and reports the
    /// difference. Only meaningful once the target is current; before that,
    /// absence from `synced_documents` proves nothing.
    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo_documents = mem::take(&mut self.limbo_documents);
        for document in self.document_set.iter() {
            if self.should_be_in_limbo(document.key()) {
                self.limbo_documents.insert(document.key().clone());
            }
        }
        let mut changes = Vec::new();
        for key in &old_limbo_documents {
            if !self.limbo_documents.contains(key) {
                changes.push(LimboDocumentChange::Removed(key.clone()));
            }
        }
        for key in &self.limbo_documents {
            if !old_limbo_documents.contains(key) {
                changes.push(LimboDocumentChange::Added(key.clone()));
            }
        }
        changes
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        // The server confirmed it; nothing to resolve.
        if self.synced_documents.contains(key) {
            return false;
        }
        // Only documents we are showing can be in limbo.
        if !self.document_set.contains_key(key) {
            return false;
        }
        // A locally mutated document is expected to diverge from the server.
        if self
            .document_set
            .get(key)
            .map(MutableDocument::has_local_mutations)
            .unwrap_or(false)
        {
            return false;
        }
        true
    }

    fn change_type_order(change_type: ChangeType) -> u8 {
        match change_type {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}
