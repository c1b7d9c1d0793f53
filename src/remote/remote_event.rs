use std::collections::BTreeMap;

use crate::local::TargetPurpose;
use crate::model::{DocumentKeySet, DocumentMap, SnapshotVersion, TargetId};
use crate::value::BytesValue;

/// One consistent watch snapshot: everything the backend told us up to a
/// single read time, aggregated per target and per document.
#[derive(Clone, Debug)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter disagreed with the local result set;
    /// each must be re-listened from scratch under the given purpose.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: DocumentMap,
    /// Documents known only through limbo-resolution targets; eviction treats
    /// them as orphaned once resolved.
    pub resolved_limbo_documents: DocumentKeySet,
}

/// Per-target portion of a [`RemoteEvent`].
#[derive(Clone, Debug)]
pub struct TargetChange {
    pub resume_token: BytesValue,
    /// The server reported the target consistent with local state at the
    /// snapshot version.
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    /// A change carrying only a current-marker flip, used when network state
    /// transitions must be reflected without any watch traffic.
    pub fn synthesized_for_current_change(current: bool, resume_token: BytesValue) -> Self {
        Self {
            resume_token,
            current,
            added_documents: DocumentKeySet::new(),
            modified_documents: DocumentKeySet::new(),
            removed_documents: DocumentKeySet::new(),
        }
    }

    pub fn has_document_changes(&self) -> bool {
        !self.added_documents.is_empty()
            || !self.modified_documents.is_empty()
            || !self.removed_documents.is_empty()
    }
}
