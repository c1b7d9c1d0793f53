//! Read-side fusion of the remote document cache, the mutation queue, and the
//! overlay cache: every lookup returns documents as the local user sees them,
//! with pending writes applied.
//!
//! All functions run inside an open persistence transaction.

use std::collections::BTreeMap;

use crate::core::Query;
use crate::local::document_overlay_cache::OverlayMap;
use crate::local::persistence::PersistenceTransaction;
use crate::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, FieldMask, MutableDocument, SnapshotVersion,
    Timestamp,
};
use crate::mutation::{calculate_overlay_mutation, Mutation, OverlayedDocument};

/// The local view of the document identified by `key`.
pub(crate) fn get_document(
    txn: &mut PersistenceTransaction<'_>,
    key: &DocumentKey,
) -> MutableDocument {
    let overlay = txn.overlays.get_overlay(key);
    let mut document = txn.remote_documents.get_entry(key);
    if let Some(overlay) = overlay {
        overlay
            .mutation
            .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
    }
    document
}

/// Local views of all of `keys`, including invalid entries for documents the
/// cache knows nothing about.
pub(crate) fn get_documents(
    txn: &mut PersistenceTransaction<'_>,
    keys: &DocumentKeySet,
) -> DocumentMap {
    let docs = txn.remote_documents.get_entries(keys);
    get_local_view_of_documents(txn, docs, &DocumentKeySet::new())
}

/// Applies overlays to `docs` in place. `existence_changed` names documents
/// whose found/missing state was just flipped by a remote event; their
/// overlays are recalculated because patch preconditions may now resolve
/// differently.
pub(crate) fn get_local_view_of_documents(
    txn: &mut PersistenceTransaction<'_>,
    docs: DocumentMap,
    existence_changed: &DocumentKeySet,
) -> DocumentMap {
    let overlays = txn.overlays.get_overlays(&docs.keys().cloned().collect());
    compute_views(txn, docs, overlays, existence_changed)
        .into_iter()
        .map(|(key, overlayed)| (key, overlayed.document))
        .collect()
}

/// Like [`get_local_view_of_documents`], but keeps the per-document mutated
/// field masks the write path needs to build overlays.
pub(crate) fn get_overlayed_documents(
    txn: &mut PersistenceTransaction<'_>,
    docs: DocumentMap,
) -> BTreeMap<DocumentKey, OverlayedDocument> {
    let overlays = txn.overlays.get_overlays(&docs.keys().cloned().collect());
    compute_views(txn, docs, overlays, &DocumentKeySet::new())
}

fn compute_views(
    txn: &mut PersistenceTransaction<'_>,
    mut docs: DocumentMap,
    overlays: OverlayMap,
    existence_changed: &DocumentKeySet,
) -> BTreeMap<DocumentKey, OverlayedDocument> {
    let mut recalculate = DocumentMap::new();
    let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();

    for (key, document) in &mut docs {
        let overlay = overlays.get(key);
        let overlay_is_patch = matches!(
            overlay.map(|o| &o.mutation),
            Some(Mutation::Patch(_))
        );
        if existence_changed.contains(key) && (overlay.is_none() || overlay_is_patch) {
            // Patch preconditions depend on document existence, so the
            // condensed overlay may no longer be valid.
            recalculate.insert(key.clone(), document.clone());
        } else if let Some(overlay) = overlay {
            mutated_fields.insert(key.clone(), overlay.mutation.field_mask().cloned());
            overlay.mutation.apply_to_local_view(
                document,
                overlay.mutation.field_mask().cloned(),
                Timestamp::now(),
            );
        } else {
            mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
        }
    }

    let recalculated = recalculate_and_save_overlays(txn, &mut recalculate);
    for (key, mask) in recalculated {
        mutated_fields.insert(key, mask);
    }
    for (key, document) in recalculate {
        docs.insert(key, document);
    }

    docs.into_iter()
        .map(|(key, document)| {
            let mask = mutated_fields.get(&key).cloned().flatten();
            (
                key,
                OverlayedDocument {
                    document,
                    mutated_fields: mask,
                },
            )
        })
        .collect()
}

/// Replays every queued batch over `docs`, saving the condensed result per
/// batch as the new overlays. Returns the accumulated mutated-field mask per
/// document (`None` once a set or delete makes the whole document local).
pub(crate) fn recalculate_and_save_overlays(
    txn: &mut PersistenceTransaction<'_>,
    docs: &mut DocumentMap,
) -> BTreeMap<DocumentKey, Option<FieldMask>> {
    let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
    let keys: DocumentKeySet = docs.keys().cloned().collect();
    let batches = txn.mutation_queue.all_mutation_batches_affecting_document_keys(&keys);

    // Replay in batch order, remembering which batch last touched each key.
    let mut documents_by_batch_id: BTreeMap<BatchId, DocumentKeySet> = BTreeMap::new();
    for batch in &batches {
        for key in batch.keys() {
            let Some(base_doc) = docs.get_mut(&key) else {
                continue;
            };
            let mask = masks
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Some(FieldMask::empty()));
            let mask = batch.apply_to_local_view(base_doc, mask);
            masks.insert(key.clone(), mask);
            documents_by_batch_id
                .entry(batch.batch_id)
                .or_default()
                .insert(key);
        }
    }

    // Walk batch ids newest-first so each overlay is attributed to the newest
    // batch touching its document.
    let mut processed = DocumentKeySet::new();
    for (batch_id, keys) in documents_by_batch_id.iter().rev() {
        let mut overlays: BTreeMap<DocumentKey, Mutation> = BTreeMap::new();
        for key in keys {
            if processed.contains(key) {
                continue;
            }
            processed.insert(key.clone());
            let (Some(document), Some(mask)) = (docs.get(key), masks.get(key)) else {
                continue;
            };
            if let Some(overlay_mutation) = calculate_overlay_mutation(document, mask.as_ref()) {
                overlays.insert(key.clone(), overlay_mutation);
            }
        }
        txn.overlays.save_overlays(*batch_id, overlays);
    }
    masks
}

/// Recomputes overlays for `keys` from their cached remote documents plus the
/// remaining queue, after a batch was acknowledged or rejected.
pub(crate) fn recalculate_and_save_overlays_for_document_keys(
    txn: &mut PersistenceTransaction<'_>,
    keys: &DocumentKeySet,
) {
    let mut docs = txn.remote_documents.get_entries(keys);
    recalculate_and_save_overlays(txn, &mut docs);
}

/// All documents matching `query`, with overlays applied.
///
/// `since_read_time` skips remote documents no newer than the given version;
/// pass [`SnapshotVersion::MIN`] for a full scan.
pub(crate) fn get_documents_matching_query(
    txn: &mut PersistenceTransaction<'_>,
    query: &Query,
    since_read_time: SnapshotVersion,
) -> DocumentMap {
    if query.is_document_query() {
        get_documents_matching_document_query(txn, query)
    } else if query.is_collection_group_query() {
        get_documents_matching_collection_group_query(txn, query, since_read_time)
    } else {
        get_documents_matching_collection_query(txn, query, since_read_time)
    }
}

fn get_documents_matching_document_query(
    txn: &mut PersistenceTransaction<'_>,
    query: &Query,
) -> DocumentMap {
    let mut results = DocumentMap::new();
    let Ok(key) = DocumentKey::new(query.path().clone()) else {
        return results;
    };
    let document = get_document(txn, &key);
    if document.is_found_document() {
        results.insert(key, document);
    }
    results
}

fn get_documents_matching_collection_group_query(
    txn: &mut PersistenceTransaction<'_>,
    query: &Query,
    since_read_time: SnapshotVersion,
) -> DocumentMap {
    let Some(collection_id) = query.collection_group_id() else {
        return DocumentMap::new();
    };
    let collection_id = collection_id.to_string();
    let parents = txn.index_manager.get_collection_parents(&collection_id);

    let mut results = DocumentMap::new();
    for parent in parents {
        let collection_query =
            query.as_collection_query_at_path(parent.child([collection_id.as_str()]));
        results.extend(get_documents_matching_collection_query(
            txn,
            &collection_query,
            since_read_time,
        ));
    }
    results
}

fn get_documents_matching_collection_query(
    txn: &mut PersistenceTransaction<'_>,
    query: &Query,
    since_read_time: SnapshotVersion,
) -> DocumentMap {
    let mut remote_documents = txn
        .remote_documents
        .get_all_from_collection(query.path(), since_read_time);
    let overlays = txn
        .overlays
        .get_overlays_for_collection(query.path(), crate::mutation::BATCH_ID_UNKNOWN);

    // A document can match purely because of its overlay, so overlay-only
    // keys join the candidate set as invalid documents.
    for key in overlays.keys() {
        remote_documents
            .entry(key.clone())
            .or_insert_with(|| MutableDocument::new_invalid(key.clone()));
    }

    let mut results = DocumentMap::new();
    for (key, mut document) in remote_documents {
        if let Some(overlay) = overlays.get(&key) {
            overlay.mutation.apply_to_local_view(
                &mut document,
                Some(FieldMask::empty()),
                Timestamp::now(),
            );
        }
        if query.matches(&document) {
            results.insert(key, document);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::credentials::User;
    use crate::local::persistence::{Persistence, TransactionMode};
    use crate::model::ResourcePath;
    use crate::value::{FieldValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn found_doc(path: &str, seconds: i64, field: &str, value: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.insert(field.to_string(), FieldValue::from_integer(value));
        let mut document = MutableDocument::new_found_document(
            key(path),
            version(seconds),
            SnapshotVersion::MIN,
            data,
        );
        document.set_read_time(version(seconds));
        document
    }

    async fn with_txn<T, F>(persistence: &Persistence, op: F) -> T
    where
        F: FnOnce(&mut PersistenceTransaction<'_>) -> T + Send,
        T: Send,
    {
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, &User::unauthenticated(), |txn| {
                Ok(op(txn))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn overlay_shadows_remote_document() {
        let persistence = Persistence::in_memory();
        persistence.start();

        with_txn(&persistence, |txn| {
            txn.remote_documents.add_entry(found_doc("rooms/a", 1, "visits", 1));
            let mut patch_data = MapValue::empty();
            patch_data.insert("visits".to_string(), FieldValue::from_integer(5));
            let mutation = Mutation::patch(
                key("rooms/a"),
                patch_data,
                FieldMask::new(vec![crate::model::FieldPath::from_dot_separated("visits").unwrap()]),
            );
            let mut overlays = BTreeMap::new();
            overlays.insert(key("rooms/a"), mutation);
            txn.overlays.save_overlays(1, overlays);

            let document = get_document(txn, &key("rooms/a"));
            assert_eq!(
                document.data().get("visits").and_then(FieldValue::as_integer),
                Some(5)
            );
            assert!(document.has_local_mutations());
        })
        .await;
    }

    #[tokio::test]
    async fn collection_queries_surface_overlay_only_documents() {
        let persistence = Persistence::in_memory();
        persistence.start();

        with_txn(&persistence, |txn| {
            txn.remote_documents.add_entry(found_doc("rooms/a", 1, "visits", 1));
            let mut data = MapValue::empty();
            data.insert("visits".to_string(), FieldValue::from_integer(9));
            let mut overlays = BTreeMap::new();
            overlays.insert(key("rooms/new"), Mutation::set(key("rooms/new"), data));
            txn.overlays.save_overlays(1, overlays);

            let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
            let results = get_documents_matching_query(txn, &query, SnapshotVersion::MIN);
            assert_eq!(results.len(), 2);
            assert!(results.contains_key(&key("rooms/new")));
        })
        .await;
    }

    #[tokio::test]
    async fn recalculation_folds_remaining_batches() {
        let persistence = Persistence::in_memory();
        persistence.start();

        with_txn(&persistence, |txn| {
            txn.remote_documents.add_entry(found_doc("rooms/a", 1, "visits", 1));

            let mut patch_data = MapValue::empty();
            patch_data.insert("tag".to_string(), FieldValue::from_string("kept"));
            txn.mutation_queue.add_mutation_batch(
                Timestamp::new(2, 0),
                Vec::new(),
                vec![Mutation::patch(
                    key("rooms/a"),
                    patch_data,
                    FieldMask::new(vec![crate::model::FieldPath::from_dot_separated("tag").unwrap()]),
                )],
            );

            recalculate_and_save_overlays_for_document_keys(
                txn,
                &[key("rooms/a")].into_iter().collect(),
            );

            let overlay = txn.overlays.get_overlay(&key("rooms/a")).unwrap();
            assert_eq!(overlay.largest_batch_id, 1);
            let document = get_document(txn, &key("rooms/a"));
            assert_eq!(
                document.data().get("tag").and_then(FieldValue::as_string),
                Some("kept")
            );
            assert_eq!(
                document.data().get("visits").and_then(FieldValue::as_integer),
                Some(1)
            );
        })
        .await;
    }

    #[tokio::test]
    async fn collection_group_queries_fan_out_over_parents() {
        let persistence = Persistence::in_memory();
        persistence.start();

        with_txn(&persistence, |txn| {
            txn.index_manager
                .add_to_collection_parent_index(&ResourcePath::from_string("rooms/a/messages").unwrap());
            txn.index_manager
                .add_to_collection_parent_index(&ResourcePath::from_string("rooms/b/messages").unwrap());
            txn.remote_documents
                .add_entry(found_doc("rooms/a/messages/m1", 1, "n", 1));
            txn.remote_documents
                .add_entry(found_doc("rooms/b/messages/m2", 1, "n", 2));

            let query = Query::collection_group("messages");
            let results = get_documents_matching_query(txn, &query, SnapshotVersion::MIN);
            assert_eq!(results.len(), 2);
        })
        .await;
    }
}
