use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::core::ChangeType;
use crate::local::{TargetData, TargetPurpose};
use crate::model::{
    DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, SnapshotVersion, TargetId,
};
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};
use crate::value::BytesValue;

/// What the aggregator needs to know about targets beyond the stream itself:
/// which ones are still listening, and which documents the local store
/// already attributes to them.
pub trait TargetMetadataProvider: Send + Sync {
    /// Keys the target contained as of the last raised snapshot.
    fn get_remote_keys(&self, target_id: TargetId) -> DocumentKeySet;
    /// Data for a target the client still listens to, `None` once unlistened.
    fn get_target_data(&self, target_id: TargetId) -> Option<TargetData>;
}

/// Accumulated server state for one target between snapshots.
struct TargetState {
    /// Outstanding add/remove requests the server has not yet acknowledged.
    /// While nonzero, incoming changes may belong to a previous listen and
    /// are ignored.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: BytesValue,
    current: bool,
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: BytesValue::new(Vec::new()),
            current: false,
            // The first snapshot after a (re-)listen always surfaces, even
            // when it contains no documents.
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses > 0
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
    }

    fn update_resume_token(&mut self, resume_token: &BytesValue) {
        if !resume_token.is_empty() {
            self.resume_token = resume_token.clone();
            self.has_pending_changes = true;
        }
    }

    fn mark_current(&mut self) {
        self.current = true;
        self.has_pending_changes = true;
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.document_changes.insert(key, change_type);
        self.has_pending_changes = true;
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.document_changes.remove(key);
        self.has_pending_changes = true;
    }

    fn clear_pending_changes(&mut self) {
        self.document_changes.clear();
        self.has_pending_changes = false;
        self.current = false;
    }

    fn to_target_change(&self) -> TargetChange {
        let mut added_documents = DocumentKeySet::new();
        let mut modified_documents = DocumentKeySet::new();
        let mut removed_documents = DocumentKeySet::new();
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => {
                    added_documents.insert(key.clone());
                }
                ChangeType::Modified => {
                    modified_documents.insert(key.clone());
                }
                ChangeType::Removed => {
                    removed_documents.insert(key.clone());
                }
                // Metadata transitions are computed by views, never recorded
                // from the stream.
                ChangeType::Metadata => {}
            }
        }
        TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            added_documents,
            modified_documents,
            removed_documents,
        }
    }
}

/// Folds individual watch changes into per-target state and produces a
/// [`RemoteEvent`] whenever the server reaches a consistent snapshot.
pub struct WatchChangeAggregator {
    metadata_provider: Arc<dyn TargetMetadataProvider>,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: DocumentMap,
    /// Every target a document was seen in since the last snapshot, whether
    /// added or removed. Drives limbo resolution.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(metadata_provider: Arc<dyn TargetMetadataProvider>) -> Self {
        Self {
            metadata_provider,
            target_states: BTreeMap::new(),
            pending_document_updates: DocumentMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, change: &DocumentWatchChange) {
        for &target_id in &change.updated_target_ids {
            match &change.document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(target_id, document.clone());
                }
                other => {
                    self.remove_document_from_target(target_id, &change.key, other.as_ref());
                }
            }
        }
        for &target_id in &change.removed_target_ids {
            self.remove_document_from_target(target_id, &change.key, change.document.as_ref());
        }
    }

    pub fn handle_target_change(&mut self, change: &WatchTargetChange) {
        for target_id in self.affected_target_ids(change) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(target_id) {
                        self.target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    // An unlisten was sent earlier; the server has now
                    // confirmed it.
                    let pending = {
                        let state = self.target_state(target_id);
                        state.record_target_response();
                        state.is_pending()
                    };
                    if !pending {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(target_id) {
                        let state = self.target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(target_id) {
                        self.reset_target(target_id);
                        self.target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Applies the server's document count for a target. A mismatch with the
    /// local count means updates were missed: the target's state is cleared
    /// and it is flagged for a fresh re-listen.
    pub fn handle_existence_filter(&mut self, change: &ExistenceFilterChange) {
        let target_id = change.target_id;
        let expected_count = change.count;
        let Some(target_data) = self.target_data_for_active_target(target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document no longer exists; synthesize the delete the
                // server never sends for document listens.
                let Ok(key) = DocumentKey::new(target_data.target.path.clone()) else {
                    return;
                };
                let tombstone = MutableDocument::new_no_document(key.clone(), SnapshotVersion::MIN);
                self.remove_document_from_target(target_id, &key, Some(&tombstone));
            }
            return;
        }

        let current_size = self.current_document_count(target_id);
        if current_size != expected_count {
            self.reset_target(target_id);
            self.pending_target_resets
                .insert(target_id, TargetPurpose::ExistenceFilterMismatch);
        }
    }

    /// Notes that an add-target or remove-target request went out; responses
    /// for this target are ignored until the server acknowledges it.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.target_state(target_id).record_pending_target_request();
    }

    /// Drops all accumulated state for a target that is no longer listening.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Rolls everything accumulated since the last snapshot into one
    /// [`RemoteEvent`] and starts the next accumulation window.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id) else {
                continue;
            };

            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if current && target_data.target.is_document_target() {
                // A current document target that delivered no document means
                // the document does not exist; record the delete the server
                // leaves implicit.
                if let Ok(key) = DocumentKey::new(target_data.target.path.clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(target_id, &key)
                    {
                        let tombstone =
                            MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(&tombstone));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let mut only_limbo_targets = true;
            for &target_id in targets {
                if let Some(target_data) = self.target_data_for_active_target(target_id) {
                    if target_data.purpose != TargetPurpose::LimboResolution {
                        only_limbo_targets = false;
                        break;
                    }
                }
            }
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        let target_mismatches = std::mem::take(&mut self.pending_target_resets);
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches,
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(&mut self, target_id: TargetId, document: MutableDocument) {
        if !self.is_active_target(target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<&MutableDocument>,
    ) {
        if !self.is_active_target(target_id) {
            return;
        }
        if self.target_contains_document(target_id, key) {
            self.target_state(target_id)
                .add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The document was added and removed within one snapshot window;
            // the target never observes it.
            self.target_state(target_id).remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates
                .insert(key.clone(), document.clone());
        }
    }

    /// Clears a target's accumulated state and records removals for every
    /// document the local store attributes to it, so a re-listen starts from
    /// an empty result set.
    fn reset_target(&mut self, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::default());
        for key in self.metadata_provider.get_remote_keys(target_id) {
            self.remove_document_from_target(target_id, &key, None);
        }
    }

    fn affected_target_ids(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|&target_id| self.is_active_target(target_id))
            .collect()
    }

    fn target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: TargetId) -> bool {
        self.target_data_for_active_target(target_id).is_some()
    }

    /// `None` while the target has requests in flight: changes arriving then
    /// belong to a previous incarnation of the listen.
    fn target_data_for_active_target(&self, target_id: TargetId) -> Option<TargetData> {
        let pending = self
            .target_states
            .get(&target_id)
            .is_some_and(TargetState::is_pending);
        if pending {
            None
        } else {
            self.metadata_provider.get_target_data(target_id)
        }
    }

    fn target_contains_document(&self, target_id: TargetId, key: &DocumentKey) -> bool {
        self.metadata_provider
            .get_remote_keys(target_id)
            .contains(key)
    }

    fn current_document_count(&mut self, target_id: TargetId) -> i32 {
        let change = self.target_state(target_id).to_target_change();
        let remote = self.metadata_provider.get_remote_keys(target_id).len() as i32;
        remote + change.added_documents.len() as i32 - change.removed_documents.len() as i32
    }
}
