use crate::core::{ChangeType, ViewSnapshot};
use crate::model::{DocumentKeySet, TargetId};

/// Key-level membership changes of one view, fed back into persistence so
/// reference counts and orphan markers stay accurate.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = DocumentKeySet::new();
        let mut removed_keys = DocumentKeySet::new();
        for change in &snapshot.doc_changes {
            match change.change_type {
                ChangeType::Added => {
                    added_keys.insert(change.document.key().clone());
                }
                ChangeType::Removed => {
                    removed_keys.insert(change.document.key().clone());
                }
                _ => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}
