use crate::core::{ChangeType, Query, ViewSnapshot};
use crate::model::{DocumentKey, FieldPath, MutableDocument};
use crate::value::{FieldValue, MapValue};

/// Where a snapshot's data currently stands relative to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// The snapshot contains writes the backend has not acknowledged yet.
    pub has_pending_writes: bool,
    /// The snapshot was served from the local cache rather than a
    /// server-confirmed view.
    pub from_cache: bool,
}

/// One document as an application observes it, with its sync metadata.
#[derive(Clone, Debug)]
pub struct DocumentSnapshot {
    document: MutableDocument,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub(crate) fn new(document: MutableDocument, metadata: SnapshotMetadata) -> Self {
        Self { document, metadata }
    }

    pub fn key(&self) -> &DocumentKey {
        self.document.key()
    }

    pub fn exists(&self) -> bool {
        self.document.is_found_document()
    }

    /// The document's fields, or `None` when it does not exist.
    pub fn data(&self) -> Option<&MapValue> {
        if self.document.is_found_document() {
            Some(self.document.data())
        } else {
            None
        }
    }

    pub fn get(&self, path: &FieldPath) -> Option<&FieldValue> {
        self.data().and_then(|data| data.field(path))
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        self.metadata
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChangeKind {
    Added,
    Modified,
    Removed,
    Metadata,
}

impl DocumentChangeKind {
    fn from_change_type(change_type: ChangeType) -> Self {
        match change_type {
            ChangeType::Added => DocumentChangeKind::Added,
            ChangeType::Modified => DocumentChangeKind::Modified,
            ChangeType::Removed => DocumentChangeKind::Removed,
            ChangeType::Metadata => DocumentChangeKind::Metadata,
        }
    }
}

/// A document's movement between two consecutive snapshots of one query.
/// Indices are positions in the ordered result set; `old_index` is `None`
/// for additions and `new_index` is `None` for removals.
#[derive(Clone, Debug)]
pub struct DocumentChange {
    pub kind: DocumentChangeKind,
    pub document: DocumentSnapshot,
    pub old_index: Option<usize>,
    pub new_index: Option<usize>,
}

/// One consistent, ordered result set for a query.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    snapshot: ViewSnapshot,
}

impl QuerySnapshot {
    pub fn from_view_snapshot(snapshot: ViewSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn query(&self) -> &Query {
        &self.snapshot.query
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata {
            has_pending_writes: self.snapshot.has_pending_writes(),
            from_cache: self.snapshot.from_cache,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.documents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.snapshot.documents.len()
    }

    /// The result set in query order.
    pub fn documents(&self) -> Vec<DocumentSnapshot> {
        self.snapshot
            .documents
            .iter()
            .map(|document| self.document_snapshot(document.clone()))
            .collect()
    }

    /// The diff against the previous snapshot, ordered so replaying it onto
    /// the old result set reproduces the new one.
    pub fn document_changes(&self) -> Vec<DocumentChange> {
        if self.snapshot.old_documents.is_empty() {
            // An initial snapshot contains nothing but additions, in result
            // order.
            let mut index = 0;
            self.snapshot
                .doc_changes
                .iter()
                .map(|change| {
                    debug_assert!(
                        change.change_type == ChangeType::Added,
                        "initial snapshot can only contain additions"
                    );
                    let new_index = Some(index);
                    index += 1;
                    DocumentChange {
                        kind: DocumentChangeKind::Added,
                        document: self.document_snapshot(change.document.clone()),
                        old_index: None,
                        new_index,
                    }
                })
                .collect()
        } else {
            // Replay each change onto a copy of the old set so indices
            // account for the changes already emitted.
            let mut index_tracker = self.snapshot.old_documents.clone();
            self.snapshot
                .doc_changes
                .iter()
                .map(|change| {
                    let key = change.document.key().clone();
                    let old_index = if change.change_type == ChangeType::Added {
                        None
                    } else {
                        let old_index = index_tracker.index_of(&key);
                        index_tracker.remove(&key);
                        old_index
                    };
                    let new_index = if change.change_type == ChangeType::Removed {
                        None
                    } else {
                        index_tracker.add(change.document.clone());
                        index_tracker.index_of(&key)
                    };
                    DocumentChange {
                        kind: DocumentChangeKind::from_change_type(change.change_type),
                        document: self.document_snapshot(change.document.clone()),
                        old_index,
                        new_index,
                    }
                })
                .collect()
        }
    }

    fn document_snapshot(&self, document: MutableDocument) -> DocumentSnapshot {
        let has_pending_writes = self.snapshot.mutated_keys.contains(document.key());
        DocumentSnapshot::new(
            document,
            SnapshotMetadata {
                has_pending_writes,
                from_cache: self.snapshot.from_cache,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Direction, DocumentViewChange};
    use crate::model::{
        DocumentKeySet, DocumentSet, ResourcePath, SnapshotVersion, Timestamp,
    };
    use crate::value::MapValue;

    fn sorted_query() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
            .with_order_by(FieldPath::from_dot_separated("sort").unwrap(), Direction::Ascending)
    }

    fn doc(path: &str, sort: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.insert("sort".to_string(), FieldValue::from_integer(sort));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn document_set(query: &Query, documents: &[MutableDocument]) -> DocumentSet {
        let mut set = DocumentSet::new(query.comparator());
        for document in documents {
            set.add(document.clone());
        }
        set
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn initial_snapshot_numbers_additions_in_order() {
        let query = sorted_query();
        let documents = [doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3)];
        let snapshot = QuerySnapshot::from_view_snapshot(ViewSnapshot::from_initial_documents(
            query.clone(),
            document_set(&query, &documents),
            DocumentKeySet::new(),
            true,
        ));

        let changes = snapshot.document_changes();
        assert_eq!(changes.len(), 3);
        for (index, change) in changes.iter().enumerate() {
            assert_eq!(change.kind, DocumentChangeKind::Added);
            assert_eq!(change.old_index, None);
            assert_eq!(change.new_index, Some(index));
        }
    }

    #[test]
    fn a_moved_document_reports_both_indices() {
        let query = sorted_query();
        let old_documents =
            document_set(&query, &[doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3)]);
        let moved = doc("rooms/a", 4);
        let documents =
            document_set(&query, &[doc("rooms/b", 2), doc("rooms/c", 3), moved.clone()]);
        let snapshot = QuerySnapshot::from_view_snapshot(ViewSnapshot {
            query,
            documents,
            old_documents,
            doc_changes: vec![DocumentViewChange {
                change_type: ChangeType::Modified,
                document: moved,
            }],
            mutated_keys: DocumentKeySet::new(),
            from_cache: false,
            sync_state_changed: false,
            excludes_metadata_changes: false,
        });

        let changes = snapshot.document_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, DocumentChangeKind::Modified);
        assert_eq!(changes[0].old_index, Some(0));
        assert_eq!(changes[0].new_index, Some(2));
    }

    #[test]
    fn a_removed_document_has_no_new_index() {
        let query = sorted_query();
        let removed = doc("rooms/b", 2);
        let old_documents = document_set(&query, &[doc("rooms/a", 1), removed.clone()]);
        let documents = document_set(&query, &[doc("rooms/a", 1)]);
        let snapshot = QuerySnapshot::from_view_snapshot(ViewSnapshot {
            query,
            documents,
            old_documents,
            doc_changes: vec![DocumentViewChange {
                change_type: ChangeType::Removed,
                document: removed,
            }],
            mutated_keys: DocumentKeySet::new(),
            from_cache: false,
            sync_state_changed: false,
            excludes_metadata_changes: false,
        });

        let changes = snapshot.document_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, DocumentChangeKind::Removed);
        assert_eq!(changes[0].old_index, Some(1));
        assert_eq!(changes[0].new_index, None);
    }

    #[test]
    fn per_document_metadata_tracks_pending_writes() {
        let query = sorted_query();
        let documents = [doc("rooms/a", 1), doc("rooms/b", 2)];
        let mut mutated_keys = DocumentKeySet::new();
        mutated_keys.insert(key("rooms/a"));
        let snapshot = QuerySnapshot::from_view_snapshot(ViewSnapshot::from_initial_documents(
            query.clone(),
            document_set(&query, &documents),
            mutated_keys,
            true,
        ));

        assert!(snapshot.metadata().has_pending_writes);
        assert!(snapshot.metadata().from_cache);
        let documents = snapshot.documents();
        assert!(documents[0].metadata().has_pending_writes);
        assert!(!documents[1].metadata().has_pending_writes);
    }
}
