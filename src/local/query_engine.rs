//! Query execution strategies, cheapest first: serve from a field index,
//! re-use the last consistent result set, or fall back to a full collection
//! scan.

use crate::core::{LimitType, Query};
use crate::local::index_manager::IndexType;
use crate::local::local_documents_view;
use crate::local::persistence::PersistenceTransaction;
use crate::model::{DocumentKeySet, DocumentMap, DocumentSet, SnapshotVersion};

/// Runs `query` against local state.
///
/// `remote_keys` holds the documents the backend reported as matching when
/// the query's target last synced, and `last_limbo_free_snapshot_version`
/// the version of the last snapshot known to contain no limbo documents.
/// Both come from the target cache; pass an empty set and
/// [`SnapshotVersion::MIN`] for a never-synced query.
///
/// Results are unordered and not limited; views apply ordering and limits.
pub(crate) fn execute_query(
    txn: &mut PersistenceTransaction<'_>,
    query: &Query,
    last_limbo_free_snapshot_version: SnapshotVersion,
    remote_keys: &DocumentKeySet,
) -> DocumentMap {
    if let Some(results) = query_using_index(txn, query) {
        return results;
    }
    if let Some(results) =
        query_using_previous_results(txn, query, last_limbo_free_snapshot_version, remote_keys)
    {
        return results;
    }
    log::debug!(
        "query engine: full collection scan for {}",
        query.canonical_id()
    );
    local_documents_view::get_documents_matching_query(txn, query, SnapshotVersion::MIN)
}

fn query_using_index(
    txn: &mut PersistenceTransaction<'_>,
    query: &Query,
) -> Option<DocumentMap> {
    if query.matches_all_documents() {
        // Scanning the collection outright beats key-by-key index lookups.
        return None;
    }
    let mut query = query.clone();
    let mut target = query.to_target();
    let index_type = txn.index_manager.index_type(&target);
    if index_type == IndexType::None {
        return None;
    }
    if query.limit().is_some() && index_type == IndexType::Partial {
        // A partial index cannot enforce the limit; run unbounded and let
        // the view trim.
        query = query.without_limit();
        target = query.to_target();
    }

    let keys = txn.index_manager.documents_matching_target(&target)?;
    let indexed_results = apply_query(txn, &query, &keys);
    log::debug!(
        "query engine: serving {} from a {:?} index",
        query.canonical_id(),
        index_type
    );
    if index_type == IndexType::Full {
        return Some(to_document_map(&indexed_results));
    }
    let offset = txn.index_manager.offset_read_time(&target);
    Some(append_remaining_results(txn, &indexed_results, &query, offset))
}

fn query_using_previous_results(
    txn: &mut PersistenceTransaction<'_>,
    query: &Query,
    last_limbo_free_snapshot_version: SnapshotVersion,
    remote_keys: &DocumentKeySet,
) -> Option<DocumentMap> {
    if query.matches_all_documents() {
        return None;
    }
    // A query that has never produced a limbo-free snapshot has no result
    // set worth re-using.
    if last_limbo_free_snapshot_version == SnapshotVersion::MIN {
        return None;
    }

    let previous_results = apply_query(txn, query, remote_keys);
    if needs_refill(
        query,
        &previous_results,
        remote_keys,
        last_limbo_free_snapshot_version,
    ) {
        return None;
    }

    log::debug!(
        "query engine: re-using previous results from {:?} to execute {}",
        last_limbo_free_snapshot_version,
        query.canonical_id()
    );
    Some(append_remaining_results(
        txn,
        &previous_results,
        query,
        last_limbo_free_snapshot_version,
    ))
}

/// Loads `keys` and keeps the documents that still match `query`, sorted by
/// the query's ordering.
fn apply_query(
    txn: &mut PersistenceTransaction<'_>,
    query: &Query,
    keys: &DocumentKeySet,
) -> DocumentSet {
    let documents = local_documents_view::get_documents(txn, keys);
    let mut applied = DocumentSet::new(query.comparator());
    for (_, document) in documents {
        if query.matches(&document) {
            applied.add(document);
        }
    }
    applied
}

/// Whether a cached result set for a limit query may be missing documents
/// and must be rebuilt by scanning.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &DocumentSet,
    remote_keys: &DocumentKeySet,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if query.limit().is_none() {
        return false;
    }
    // A previously matching document no longer matches.
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    // A local edit or a late remote update may have moved a document out of
    // the limit, letting a document the cache never saw take its place.
    let document_at_limit_edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    let Some(document_at_limit_edge) = document_at_limit_edge else {
        return false;
    };
    document_at_limit_edge.has_pending_writes()
        || document_at_limit_edge.version() > limbo_free_snapshot_version
}

/// Combines `previous_results` with every document changed since
/// `since_read_time`, the newer view winning per key.
fn append_remaining_results(
    txn: &mut PersistenceTransaction<'_>,
    previous_results: &DocumentSet,
    query: &Query,
    since_read_time: SnapshotVersion,
) -> DocumentMap {
    let mut results =
        local_documents_view::get_documents_matching_query(txn, query, since_read_time);
    for document in previous_results.iter() {
        results.insert(document.key().clone(), document.clone());
    }
    results
}

fn to_document_map(documents: &DocumentSet) -> DocumentMap {
    documents
        .iter()
        .map(|document| (document.key().clone(), document.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::credentials::User;
    use crate::local::persistence::{Persistence, TransactionMode};
    use crate::model::{DocumentKey, MutableDocument, ResourcePath, Timestamp};
    use crate::value::{FieldValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, doc_version: i64, read_time: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.insert("matches".to_string(), FieldValue::from_bool(true));
        let mut document = MutableDocument::new_found_document(
            key(path),
            version(doc_version),
            SnapshotVersion::MIN,
            data,
        );
        document.set_read_time(version(read_time));
        document
    }

    async fn run_query(
        persistence: &Persistence,
        seed: Vec<MutableDocument>,
        query: Query,
        limbo_free: SnapshotVersion,
        remote_keys: DocumentKeySet,
    ) -> DocumentMap {
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, &User::unauthenticated(), |txn| {
                for document in seed {
                    txn.remote_documents.add_entry(document);
                }
                Ok(execute_query(txn, &query, limbo_free, &remote_keys))
            })
            .await
            .unwrap()
    }

    fn limit_query() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap()).with_limit_to_first(2)
    }

    #[tokio::test]
    async fn unfiltered_queries_scan_the_whole_collection() {
        let persistence = Persistence::in_memory();
        persistence.start();

        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let results = run_query(
            &persistence,
            vec![doc("rooms/a", 1, 1), doc("rooms/b", 1, 1), doc("rooms/c", 1, 1)],
            query,
            version(2),
            [key("rooms/a"), key("rooms/b")].into_iter().collect(),
        )
        .await;

        // rooms/c is outside the remote keys and older than the limbo-free
        // version; only a full scan finds it.
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn limit_queries_reuse_previous_results_when_stable() {
        let persistence = Persistence::in_memory();
        persistence.start();

        let results = run_query(
            &persistence,
            vec![doc("rooms/a", 1, 1), doc("rooms/b", 1, 1), doc("rooms/c", 1, 1)],
            limit_query(),
            version(2),
            [key("rooms/a"), key("rooms/b")].into_iter().collect(),
        )
        .await;

        assert_eq!(results.len(), 2);
        assert!(!results.contains_key(&key("rooms/c")));
    }

    #[tokio::test]
    async fn limit_queries_rescan_when_the_edge_document_moved() {
        let persistence = Persistence::in_memory();
        persistence.start();

        // rooms/b sits at the limit edge and was updated past the limbo-free
        // version, so a hidden document may have slipped into the limit.
        let results = run_query(
            &persistence,
            vec![doc("rooms/a", 1, 1), doc("rooms/b", 3, 1), doc("rooms/c", 1, 1)],
            limit_query(),
            version(2),
            [key("rooms/a"), key("rooms/b")].into_iter().collect(),
        )
        .await;

        assert!(results.contains_key(&key("rooms/c")));
    }

    #[tokio::test]
    async fn limit_queries_rescan_when_a_previous_result_stopped_matching() {
        let persistence = Persistence::in_memory();
        persistence.start();

        let results = run_query(
            &persistence,
            vec![doc("rooms/a", 1, 1), doc("rooms/c", 1, 1)],
            limit_query(),
            version(2),
            // rooms/b was deleted locally; size mismatch forces a refill.
            [key("rooms/a"), key("rooms/b")].into_iter().collect(),
        )
        .await;

        assert!(results.contains_key(&key("rooms/c")));
    }
}
