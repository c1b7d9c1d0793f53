use std::collections::BTreeMap;

use crate::model::{
    BatchId, DocumentKey, DocumentKeySet, FieldMask, MutableDocument, SnapshotVersion, Timestamp,
};
use crate::mutation::{calculate_overlay_mutation, Mutation, MutationResult};
use crate::value::BytesValue;

/// Batch id used before a real id is known.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// A document when local mutations have been laid over its cached remote
/// state, together with the set of fields those mutations touched (`None`
/// meaning all of them).
#[derive(Clone, Debug)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

/// All mutations from a single user write call, committed atomically.
///
/// Base mutations pin the pre-write values that non-idempotent transforms
/// started from, so replaying the batch over any document state reproduces
/// the same local view.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the backend's results for this batch to `document`. Only
    /// mutations addressing the document's key participate.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) {
        for (mutation, result) in self.mutations.iter().zip(&batch_result.mutation_results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, result);
            }
        }
    }

    /// Replays the whole batch over the document's current state: base
    /// mutations first, then the user's mutations.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in &self.base_mutations {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        for mutation in &self.mutations {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every affected document in `documents` and
    /// computes the overlay mutation per document. Documents the backend has
    /// never seen get whole-document overlays so the overlay alone can
    /// reconstruct them.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &DocumentKeySet,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for mutation in &self.mutations {
            let Some(entry) = documents.get_mut(mutation.key()) else {
                continue;
            };
            let mutated_fields =
                self.apply_to_local_view(&mut entry.document, entry.mutated_fields.clone());
            let mask_for_overlay = if documents_without_remote_version.contains(mutation.key()) {
                None
            } else {
                mutated_fields
            };
            if let Some(overlay) =
                calculate_overlay_mutation(&entry.document, mask_for_overlay.as_ref())
            {
                overlays.insert(mutation.key().clone(), overlay);
            }
            if !entry.document.is_valid_document() {
                entry
                    .document
                    .convert_to_no_document(SnapshotVersion::MIN);
            }
        }
        overlays
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// The backend's response to a committed batch.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Option<BytesValue>,
    /// Version each document landed at, keyed for cache updates.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Option<BytesValue>,
    ) -> Self {
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldPath;
    use crate::mutation::{FieldTransform, TransformOperation};
    use crate::value::{FieldValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn batch_applies_base_mutations_first() {
        // The increment started from 5; the base mutation restores that start
        // before the increment replays, so reapplication converges.
        let mut doc = MutableDocument::new_found_document(
            key("rooms/a"),
            version(1),
            version(1),
            {
                let mut data = MapValue::empty();
                data.set_field(&field("count"), FieldValue::from_integer(99));
                data
            },
        );
        let base = Mutation::patch(
            key("rooms/a"),
            {
                let mut data = MapValue::empty();
                data.set_field(&field("count"), FieldValue::from_integer(5));
                data
            },
            FieldMask::new(vec![field("count")]),
        )
        .with_precondition(crate::mutation::Precondition::none());
        let mutation = Mutation::patch(key("rooms/a"), MapValue::empty(), FieldMask::empty())
            .with_precondition(crate::mutation::Precondition::none())
            .with_field_transforms(vec![FieldTransform::new(
                field("count"),
                TransformOperation::NumericIncrement(FieldValue::from_integer(1)),
            )]);
        let batch = MutationBatch::new(1, Timestamp::new(2, 0), vec![base], vec![mutation]);

        for _ in 0..2 {
            batch.apply_to_local_view(&mut doc, Some(FieldMask::empty()));
            assert_eq!(
                doc.data().field(&field("count")),
                Some(&FieldValue::from_integer(6))
            );
        }
    }

    #[test]
    fn batch_result_records_per_document_versions() {
        let batch = MutationBatch::new(
            7,
            Timestamp::new(1, 0),
            vec![],
            vec![
                Mutation::set(key("rooms/a"), MapValue::empty()),
                Mutation::set(key("rooms/b"), MapValue::empty()),
            ],
        );
        let result = MutationBatchResult::from(
            batch,
            version(10),
            vec![
                MutationResult::new(version(8), vec![]),
                MutationResult::new(version(9), vec![]),
            ],
            None,
        );
        assert_eq!(result.doc_versions[&key("rooms/a")], version(8));
        assert_eq!(result.doc_versions[&key("rooms/b")], version(9));
    }

    #[test]
    fn local_document_set_gets_whole_document_overlays_when_never_synced() {
        let doc_key = key("rooms/new");
        let mut documents = BTreeMap::new();
        documents.insert(
            doc_key.clone(),
            OverlayedDocument {
                document: MutableDocument::new_invalid(doc_key.clone()),
                mutated_fields: Some(FieldMask::empty()),
            },
        );
        let without_remote: DocumentKeySet = [doc_key.clone()].into_iter().collect();

        let batch = MutationBatch::new(
            1,
            Timestamp::new(1, 0),
            vec![],
            vec![Mutation::patch(
                key("rooms/new"),
                {
                    let mut data = MapValue::empty();
                    data.set_field(&field("a"), FieldValue::from_integer(1));
                    data
                },
                FieldMask::new(vec![field("a")]),
            )
            .with_precondition(crate::mutation::Precondition::none())],
        );
        let overlays = batch.apply_to_local_document_set(&mut documents, &without_remote);

        assert!(matches!(overlays[&doc_key], Mutation::Set(_)));
    }
}
