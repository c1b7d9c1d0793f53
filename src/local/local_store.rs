//! Coordinator for everything the client persists.
//!
//! The local store owns the interplay between the mutation queue, the remote
//! document cache, the target cache and the overlay cache. Callers never touch
//! those caches directly; they describe an event (a user write, a watch
//! snapshot, a batch acknowledgement) and the store folds it into persistence
//! inside a single transaction, returning the changed document views.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use log::debug;

use crate::api::credentials::User;
use crate::core::{Query, Target};
use crate::error::{internal_error, SyncResult};
use crate::local::bundle_cache::{BundleMetadata, NamedQuery};
use crate::local::local_documents_view;
use crate::local::local_view_changes::LocalViewChanges;
use crate::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::local::query_engine;
use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::{
    BatchId, DocumentKeySet, DocumentMap, MutableDocument, SnapshotVersion, TargetId, Timestamp,
};
use crate::model::DocumentKey;
use crate::mutation::{Mutation, MutationBatch, MutationBatchResult};
use crate::remote::{RemoteEvent, TargetChange};
use crate::value::BytesValue;

/// Longest a resume token update may sit in memory before it is persisted even
/// though no documents changed. A crash forfeits anything newer.
const RESUME_TOKEN_MAX_AGE_SECONDS: i64 = 5 * 60;

/// Outcome of [`LocalStore::write_locally`]: the assigned batch id plus the
/// post-mutation view of every document the batch touches.
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

/// Outcome of swapping users: which pending batches disappeared, which
/// appeared, and the fresh views of every document either set touched.
pub struct UserChangeResult {
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
    pub affected_documents: DocumentMap,
}

/// Documents produced by [`LocalStore::execute_query`] along with the keys the
/// server matched to the target last time it was current.
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: DocumentKeySet,
}

struct LocalStoreState {
    user: User,
    /// Data for each target the sync engine currently holds allocated. Updates
    /// land here after the corresponding transaction commits.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical: HashMap<String, TargetId>,
}

pub struct LocalStore {
    persistence: Persistence,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Persistence, initial_user: User) -> Self {
        Self {
            persistence,
            state: Mutex::new(LocalStoreState {
                user: initial_user,
                target_data_by_target: BTreeMap::new(),
                target_id_by_canonical: HashMap::new(),
            }),
        }
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    fn current_user(&self) -> User {
        self.state.lock().unwrap().user.clone()
    }

    /// Swaps the active user and reports how the set of pending batches
    /// changed. Both users' batches are re-read so the caller can recompute
    /// views for every document either queue touches.
    pub async fn handle_user_change(&self, user: User) -> SyncResult<UserChangeResult> {
        let old_user = {
            let mut state = self.state.lock().unwrap();
            std::mem::replace(&mut state.user, user.clone())
        };

        let old_batches = self
            .persistence
            .run_transaction(
                "old user batches",
                TransactionMode::ReadOnly,
                &old_user,
                |txn| Ok(txn.mutation_queue.all_mutation_batches()),
            )
            .await?;

        self.persistence
            .run_transaction(
                "handle user change",
                TransactionMode::ReadWrite,
                &user,
                move |txn| {
                    let new_batches = txn.mutation_queue.all_mutation_batches();

                    let old_ids: BTreeSet<BatchId> =
                        old_batches.iter().map(|batch| batch.batch_id).collect();
                    let new_ids: BTreeSet<BatchId> =
                        new_batches.iter().map(|batch| batch.batch_id).collect();

                    let mut changed_keys = DocumentKeySet::new();
                    for batch in old_batches.iter().chain(new_batches.iter()) {
                        changed_keys.extend(batch.keys());
                    }

                    Ok(UserChangeResult {
                        removed_batch_ids: old_ids.difference(&new_ids).copied().collect(),
                        added_batch_ids: new_ids.difference(&old_ids).copied().collect(),
                        affected_documents: local_documents_view::get_documents(
                            txn,
                            &changed_keys,
                        ),
                    })
                },
            )
            .await
    }

    /// Appends `mutations` to the active user's queue as one batch and
    /// returns the updated local views.
    ///
    /// Documents carrying non-idempotent transforms get a base mutation
    /// recorded alongside the batch, pinning the pre-mutation value so that
    /// re-applying the batch after a restart yields the same local result.
    pub async fn write_locally(&self, mutations: Vec<Mutation>) -> SyncResult<LocalWriteResult> {
        let user = self.current_user();
        let local_write_time = Timestamp::now();
        let keys: DocumentKeySet = mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect();

        self.persistence
            .run_transaction(
                "locally write mutations",
                TransactionMode::ReadWrite,
                &user,
                move |txn| {
                    let remote_docs = txn.remote_documents.get_entries(&keys);
                    let mut docs_without_remote_version = DocumentKeySet::new();
                    for (key, document) in &remote_docs {
                        if !document.is_valid_document() {
                            docs_without_remote_version.insert(key.clone());
                        }
                    }
                    let mut overlayed =
                        local_documents_view::get_overlayed_documents(txn, remote_docs);

                    let mut base_mutations = Vec::new();
                    for mutation in &mutations {
                        let Some(entry) = overlayed.get(mutation.key()) else {
                            continue;
                        };
                        if let Some(base_value) = mutation.extract_base_value(&entry.document) {
                            let mask = base_value.field_mask();
                            base_mutations.push(Mutation::patch(
                                mutation.key().clone(),
                                base_value,
                                mask,
                            ));
                        }
                    }

                    let batch = txn.mutation_queue.add_mutation_batch(
                        local_write_time,
                        base_mutations,
                        mutations,
                    );
                    let overlays = batch
                        .apply_to_local_document_set(&mut overlayed, &docs_without_remote_version);
                    txn.overlays.save_overlays(batch.batch_id, overlays);

                    Ok(LocalWriteResult {
                        batch_id: batch.batch_id,
                        changes: overlayed
                            .into_iter()
                            .map(|(key, entry)| (key, entry.document))
                            .collect(),
                    })
                },
            )
            .await
    }

    /// Folds a server acknowledgement into the remote document cache, retires
    /// the batch and its overlays, and returns the affected documents' views.
    pub async fn acknowledge_batch(
        &self,
        batch_result: MutationBatchResult,
    ) -> SyncResult<DocumentMap> {
        let user = self.current_user();
        self.persistence
            .run_transaction(
                "acknowledge batch",
                TransactionMode::ReadWritePrimary,
                &user,
                move |txn| {
                    let affected = batch_result.batch.keys();
                    apply_write_to_remote_documents(txn, &batch_result);
                    txn.mutation_queue
                        .remove_mutation_batch(batch_result.batch.batch_id)?;
                    txn.overlays
                        .remove_overlays_for_batch_id(&affected, batch_result.batch.batch_id);
                    // Transform results baked server values into the cache;
                    // the overlays for those documents must be derived again
                    // from whatever batches remain.
                    local_documents_view::recalculate_and_save_overlays_for_document_keys(
                        txn,
                        &keys_with_transform_results(&batch_result),
                    );
                    Ok(local_documents_view::get_documents(txn, &affected))
                },
            )
            .await
    }

    /// Drops a batch the server rejected and rebuilds the overlays for every
    /// document it touched, as if the batch had never been written.
    pub async fn reject_batch(&self, batch_id: BatchId) -> SyncResult<DocumentMap> {
        let user = self.current_user();
        self.persistence
            .run_transaction(
                "reject batch",
                TransactionMode::ReadWritePrimary,
                &user,
                move |txn| {
                    let Some(batch) = txn.mutation_queue.lookup_mutation_batch(batch_id) else {
                        return Err(internal_error(format!(
                            "attempted to reject nonexistent batch {batch_id}"
                        )));
                    };
                    let affected = batch.keys();
                    txn.mutation_queue.remove_mutation_batch(batch_id)?;
                    txn.overlays.remove_overlays_for_batch_id(&affected, batch_id);
                    local_documents_view::recalculate_and_save_overlays_for_document_keys(
                        txn, &affected,
                    );
                    Ok(local_documents_view::get_documents(txn, &affected))
                },
            )
            .await
    }

    /// Highest batch id the active user has enqueued, or
    /// [`crate::mutation::BATCH_ID_UNKNOWN`] when the queue is empty.
    pub async fn get_highest_unacknowledged_batch_id(&self) -> SyncResult<BatchId> {
        let user = self.current_user();
        self.persistence
            .run_transaction(
                "highest unacknowledged batch id",
                TransactionMode::ReadOnly,
                &user,
                |txn| Ok(txn.mutation_queue.highest_unacknowledged_batch_id()),
            )
            .await
    }

    pub async fn get_last_remote_snapshot_version(&self) -> SyncResult<SnapshotVersion> {
        let user = self.current_user();
        self.persistence
            .run_transaction(
                "last remote snapshot version",
                TransactionMode::ReadOnly,
                &user,
                |txn| Ok(txn.target_cache.get_last_remote_snapshot_version()),
            )
            .await
    }

    /// The first batch after `after_batch_id` still awaiting acknowledgement,
    /// used to feed the write pipeline in order.
    pub async fn next_mutation_batch(
        &self,
        after_batch_id: BatchId,
    ) -> SyncResult<Option<MutationBatch>> {
        let user = self.current_user();
        self.persistence
            .run_transaction(
                "next mutation batch",
                TransactionMode::ReadOnly,
                &user,
                move |txn| {
                    Ok(txn
                        .mutation_queue
                        .next_mutation_batch_after_batch_id(after_batch_id))
                },
            )
            .await
    }

    /// Applies one watch snapshot: updates target membership and resume
    /// tokens, upserts changed documents subject to version rules, and
    /// returns the changed local views.
    pub async fn apply_remote_event(&self, remote_event: RemoteEvent) -> SyncResult<DocumentMap> {
        let user = self.current_user();
        let remote_version = remote_event.snapshot_version;
        let target_data_snapshot = self.state.lock().unwrap().target_data_by_target.clone();

        let (changes, updated_targets) = self
            .persistence
            .run_transaction(
                "apply remote event",
                TransactionMode::ReadWritePrimary,
                &user,
                move |txn| {
                    let sequence_number = txn.sequence_number();
                    let mut updated_targets: BTreeMap<TargetId, TargetData> = BTreeMap::new();

                    for (target_id, change) in &remote_event.target_changes {
                        // Only targets still allocated matter; a release can
                        // race an in-flight snapshot.
                        let Some(old_target_data) = target_data_snapshot.get(target_id) else {
                            continue;
                        };

                        txn.target_cache
                            .remove_matching_keys(&change.removed_documents, *target_id);
                        txn.target_cache
                            .add_matching_keys(&change.added_documents, *target_id);

                        let mut new_target_data =
                            old_target_data.clone().with_sequence_number(sequence_number);
                        if remote_event.target_mismatches.contains_key(target_id) {
                            // An existence filter mismatch invalidates every
                            // assumption about this target; force a fresh
                            // listen from scratch.
                            new_target_data = new_target_data
                                .with_resume_token(
                                    BytesValue::new(Vec::new()),
                                    SnapshotVersion::MIN,
                                )
                                .with_last_limbo_free_snapshot_version(SnapshotVersion::MIN);
                        } else if !change.resume_token.is_empty() {
                            new_target_data = new_target_data
                                .with_resume_token(change.resume_token.clone(), remote_version);
                        }

                        if should_persist_target_data(old_target_data, &new_target_data, change) {
                            txn.target_cache.update_target_data(new_target_data.clone());
                        }
                        updated_targets.insert(*target_id, new_target_data);
                    }

                    let updated_keys: DocumentKeySet =
                        remote_event.document_updates.keys().cloned().collect();
                    let existing_docs = txn.remote_documents.get_entries(&updated_keys);

                    let mut changed_docs = DocumentMap::new();
                    let mut existence_changed_keys = DocumentKeySet::new();
                    for (key, document) in &remote_event.document_updates {
                        let Some(existing) = existing_docs.get(key) else {
                            continue;
                        };
                        if document.is_found_document() != existing.is_found_document() {
                            existence_changed_keys.insert(key.clone());
                        }

                        if document.is_no_document() && document.version() == SnapshotVersion::MIN
                        {
                            // Deletes synthesized for failed limbo lookups
                            // carry no version; drop the cache entry outright
                            // so any later revival is accepted.
                            txn.remote_documents.remove_entry(key);
                            changed_docs.insert(key.clone(), document.clone());
                        } else if !existing.is_valid_document()
                            || document.version() > existing.version()
                            || (document.version() == existing.version()
                                && existing.has_pending_writes())
                        {
                            txn.remote_documents.add_entry(document.clone());
                            changed_docs.insert(key.clone(), document.clone());
                        } else {
                            debug!(
                                "ignoring outdated watch update for {key}; current version {:?}, watch version {:?}",
                                existing.version(),
                                document.version()
                            );
                        }
                    }

                    for key in &remote_event.resolved_limbo_documents {
                        txn.mark_potentially_orphaned(key.clone());
                    }

                    // A snapshot version moves the whole cache forward; resume
                    // from it instead of replaying older targets.
                    if remote_version != SnapshotVersion::MIN {
                        txn.target_cache
                            .set_targets_metadata(sequence_number, remote_version);
                    }

                    Ok((
                        local_documents_view::get_local_view_of_documents(
                            txn,
                            changed_docs,
                            &existence_changed_keys,
                        ),
                        updated_targets,
                    ))
                },
            )
            .await?;

        let mut state = self.state.lock().unwrap();
        for (target_id, target_data) in updated_targets {
            state.target_data_by_target.insert(target_id, target_data);
        }
        Ok(changes)
    }

    /// Records view transitions observed by the query views. Keys removed
    /// from a view lose that pin on their cache entry; targets whose view is
    /// fully synced advance their limbo-free snapshot version so the query
    /// engine can keep trusting cached results.
    pub async fn notify_local_view_changes(
        &self,
        view_changes: Vec<LocalViewChanges>,
    ) -> SyncResult<()> {
        let user = self.current_user();
        self.persistence
            .run_transaction(
                "notify local view changes",
                TransactionMode::ReadWrite,
                &user,
                |txn| {
                    for view_change in &view_changes {
                        for key in &view_change.removed_keys {
                            txn.mark_potentially_orphaned(key.clone());
                        }
                    }
                    Ok(())
                },
            )
            .await?;

        let mut state = self.state.lock().unwrap();
        for view_change in view_changes {
            if view_change.from_cache {
                continue;
            }
            if let Some(target_data) = state.target_data_by_target.get(&view_change.target_id) {
                let snapshot_version = target_data.snapshot_version;
                let updated = target_data
                    .clone()
                    .with_last_limbo_free_snapshot_version(snapshot_version);
                // In-memory only; it is re-derived after a restart.
                state
                    .target_data_by_target
                    .insert(view_change.target_id, updated);
            }
        }
        Ok(())
    }

    /// Returns target data for `target`, assigning a new target id and
    /// persisting the entry if this target was never listened to before.
    /// Allocations nest: repeated calls return the same entry until a
    /// matching [`LocalStore::release_target`].
    pub async fn allocate_target(&self, target: Target) -> SyncResult<TargetData> {
        let user = self.current_user();
        let target_data = self
            .persistence
            .run_transaction(
                "allocate target",
                TransactionMode::ReadWrite,
                &user,
                move |txn| {
                    if let Some(cached) = txn.target_cache.get_target_data(&target) {
                        // Seen before; the stored resume token lets the
                        // stream pick up where the last listen stopped.
                        return Ok(cached);
                    }
                    let sequence_number = txn.sequence_number();
                    let target_id = txn.target_cache.allocate_target_id();
                    let target_data =
                        TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number);
                    txn.target_cache.add_target_data(target_data.clone());
                    Ok(target_data)
                },
            )
            .await?;

        let mut state = self.state.lock().unwrap();
        let newer_than_cached = match state.target_data_by_target.get(&target_data.target_id) {
            None => true,
            Some(existing) => target_data.snapshot_version > existing.snapshot_version,
        };
        if newer_than_cached {
            state
                .target_data_by_target
                .insert(target_data.target_id, target_data.clone());
            state
                .target_id_by_canonical
                .insert(target_data.target.canonical_id(), target_data.target_id);
        }
        Ok(target_data)
    }

    /// Releases a previously allocated target. Unless the caller asks to keep
    /// it, the persisted entry has its sequence number bumped so the garbage
    /// collector can age it out; the entry itself stays until collection.
    pub async fn release_target(
        &self,
        target_id: TargetId,
        keep_persisted_target_data: bool,
    ) -> SyncResult<()> {
        let target_data = {
            let state = self.state.lock().unwrap();
            state.target_data_by_target.get(&target_id).cloned()
        };
        let Some(target_data) = target_data else {
            return Err(internal_error(format!(
                "attempted to release nonexistent target {target_id}"
            )));
        };

        if !keep_persisted_target_data {
            let user = self.current_user();
            let released = target_data.clone();
            self.persistence
                .run_transaction(
                    "release target",
                    TransactionMode::ReadWritePrimary,
                    &user,
                    move |txn| {
                        let sequence_number = txn.sequence_number();
                        txn.target_cache
                            .update_target_data(released.with_sequence_number(sequence_number));
                        Ok(())
                    },
                )
                .await?;
        }

        let mut state = self.state.lock().unwrap();
        state.target_data_by_target.remove(&target_id);
        state
            .target_id_by_canonical
            .remove(&target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against persistence. With `use_previous_results` the
    /// query engine may serve from the target's previously matched keys
    /// instead of scanning, when the view has been free of limbo documents
    /// recently enough.
    pub async fn execute_query(
        &self,
        query: Query,
        use_previous_results: bool,
    ) -> SyncResult<QueryResult> {
        let user = self.current_user();
        let target = query.to_target();
        let cached_target_data = {
            let state = self.state.lock().unwrap();
            state
                .target_id_by_canonical
                .get(&target.canonical_id())
                .and_then(|id| state.target_data_by_target.get(id))
                .cloned()
        };

        self.persistence
            .run_transaction(
                "execute query",
                TransactionMode::ReadWrite,
                &user,
                move |txn| {
                    let target_data =
                        cached_target_data.or_else(|| txn.target_cache.get_target_data(&target));
                    let (last_limbo_free_snapshot_version, remote_keys) = match &target_data {
                        Some(data) => (
                            data.last_limbo_free_snapshot_version,
                            txn.target_cache
                                .get_matching_keys_for_target_id(data.target_id),
                        ),
                        None => (SnapshotVersion::MIN, DocumentKeySet::new()),
                    };

                    let empty_keys = DocumentKeySet::new();
                    let documents = query_engine::execute_query(
                        txn,
                        &query,
                        if use_previous_results {
                            last_limbo_free_snapshot_version
                        } else {
                            SnapshotVersion::MIN
                        },
                        if use_previous_results {
                            &remote_keys
                        } else {
                            &empty_keys
                        },
                    );
                    Ok(QueryResult {
                        documents,
                        remote_keys,
                    })
                },
            )
            .await
    }

    /// The local view of a single document, overlays applied.
    pub async fn read_document(&self, key: DocumentKey) -> SyncResult<MutableDocument> {
        let user = self.current_user();
        self.persistence
            .run_transaction(
                "read document",
                TransactionMode::ReadOnly,
                &user,
                move |txn| Ok(local_documents_view::get_document(txn, &key)),
            )
            .await
    }

    /// Keys the server last reported as matching `target_id`.
    pub async fn remote_document_keys(&self, target_id: TargetId) -> SyncResult<DocumentKeySet> {
        let user = self.current_user();
        self.persistence
            .run_transaction(
                "remote document keys",
                TransactionMode::ReadOnly,
                &user,
                move |txn| Ok(txn.target_cache.get_matching_keys_for_target_id(target_id)),
            )
            .await
    }

    /// The target backing an allocated target id, if still allocated. Used to
    /// re-issue a listen after an existence filter mismatch.
    pub fn get_cached_target(&self, target_id: TargetId) -> Option<Target> {
        let state = self.state.lock().unwrap();
        state
            .target_data_by_target
            .get(&target_id)
            .map(|data| data.target.clone())
    }

    /// True when a bundle with the same id and an equal or newer create time
    /// has already been applied, making `metadata` redundant.
    pub async fn has_newer_bundle(&self, metadata: &BundleMetadata) -> SyncResult<bool> {
        let user = self.current_user();
        let bundle_id = metadata.bundle_id.clone();
        let create_time = metadata.create_time;
        self.persistence
            .run_transaction(
                "has newer bundle",
                TransactionMode::ReadOnly,
                &user,
                move |txn| {
                    Ok(txn
                        .bundle_cache
                        .get_bundle_metadata(&bundle_id)
                        .is_some_and(|cached| cached.create_time >= create_time))
                },
            )
            .await
    }

    pub async fn save_bundle_metadata(&self, metadata: BundleMetadata) -> SyncResult<()> {
        let user = self.current_user();
        self.persistence
            .run_transaction(
                "save bundle metadata",
                TransactionMode::ReadWrite,
                &user,
                move |txn| {
                    txn.bundle_cache.save_bundle_metadata(metadata);
                    Ok(())
                },
            )
            .await
    }

    pub async fn get_named_query(&self, name: &str) -> SyncResult<Option<NamedQuery>> {
        let user = self.current_user();
        let name = name.to_string();
        self.persistence
            .run_transaction(
                "get named query",
                TransactionMode::ReadOnly,
                &user,
                move |txn| Ok(txn.bundle_cache.get_named_query(&name)),
            )
            .await
    }

    /// Saves a named query and allocates a target for it. When the bundled
    /// read time is newer than the allocated target's snapshot, the target is
    /// fast-forwarded so a later listen resumes from the bundle instead of
    /// replaying history.
    pub async fn save_named_query(&self, named_query: NamedQuery) -> SyncResult<()> {
        let allocated = self
            .allocate_target(named_query.query.to_target())
            .await?;
        let target_id = allocated.target_id;

        let updated = if allocated.snapshot_version < named_query.read_time {
            Some(
                allocated
                    .with_resume_token(BytesValue::new(Vec::new()), named_query.read_time),
            )
        } else {
            None
        };

        let user = self.current_user();
        let persisted = updated.clone();
        self.persistence
            .run_transaction(
                "save named query",
                TransactionMode::ReadWrite,
                &user,
                move |txn| {
                    if let Some(new_target_data) = persisted {
                        txn.target_cache.update_target_data(new_target_data);
                        // Stale memberships would be served as matches for
                        // the fast-forwarded target.
                        txn.target_cache.remove_matching_keys_for_target(target_id);
                    }
                    txn.bundle_cache.save_named_query(named_query);
                    Ok(())
                },
            )
            .await?;

        if let Some(new_target_data) = updated {
            let mut state = self.state.lock().unwrap();
            state
                .target_data_by_target
                .insert(target_id, new_target_data);
        }
        Ok(())
    }

    /// Runs one garbage collection pass, treating every currently allocated
    /// target as active.
    pub async fn collect_garbage(&self, garbage_collector: &LruGarbageCollector) -> LruResults {
        let active_targets: HashMap<TargetId, TargetData> = {
            let state = self.state.lock().unwrap();
            state
                .target_data_by_target
                .iter()
                .map(|(id, data)| (*id, data.clone()))
                .collect()
        };
        self.persistence
            .collect_garbage(garbage_collector, &active_targets)
            .await
    }
}

fn apply_write_to_remote_documents(
    txn: &mut PersistenceTransaction<'_>,
    batch_result: &MutationBatchResult,
) {
    let batch = &batch_result.batch;
    for key in batch.keys() {
        let Some(ack_version) = batch_result.doc_versions.get(&key) else {
            continue;
        };
        let mut document = txn.remote_documents.get_entry(&key);
        // A cache entry at or past the acknowledged version already reflects
        // this write through a watch snapshot.
        if document.version() < *ack_version {
            batch.apply_to_remote_document(&mut document, batch_result);
            if document.is_valid_document() {
                document.set_read_time(batch_result.commit_version);
                txn.remote_documents.add_entry(document);
            }
        }
    }
}

fn keys_with_transform_results(batch_result: &MutationBatchResult) -> DocumentKeySet {
    let mut keys = DocumentKeySet::new();
    for (mutation, result) in batch_result
        .batch
        .mutations
        .iter()
        .zip(&batch_result.mutation_results)
    {
        if !result.transform_results.is_empty() {
            keys.insert(mutation.key().clone());
        }
    }
    keys
}

/// Resume token updates are buffered in memory unless the target has no
/// persisted token yet, the buffered token grew older than
/// [`RESUME_TOKEN_MAX_AGE_SECONDS`], or the snapshot changed documents.
fn should_persist_target_data(
    old_target_data: &TargetData,
    new_target_data: &TargetData,
    change: &TargetChange,
) -> bool {
    if old_target_data.resume_token.is_empty() {
        return true;
    }
    let time_delta = new_target_data.snapshot_version.timestamp().seconds
        - old_target_data.snapshot_version.timestamp().seconds;
    if time_delta >= RESUME_TOKEN_MAX_AGE_SECONDS {
        return true;
    }
    change.has_document_changes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldMask, FieldPath, ResourcePath};
    use crate::mutation::MutationResult;
    use crate::value::{FieldValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn map(field: &str, value: i64) -> MapValue {
        let mut data = MapValue::empty();
        data.insert(field.to_string(), FieldValue::from_integer(value));
        data
    }

    fn found_doc(path: &str, seconds: i64, field: &str, value: i64) -> MutableDocument {
        let mut document = MutableDocument::new_found_document(
            key(path),
            version(seconds),
            SnapshotVersion::MIN,
            map(field, value),
        );
        document.set_read_time(version(seconds));
        document
    }

    fn store() -> LocalStore {
        let persistence = Persistence::in_memory();
        persistence.start();
        LocalStore::new(persistence, User::unauthenticated())
    }

    fn listen_event(
        target_id: TargetId,
        seconds: i64,
        resume_token: &[u8],
        documents: Vec<MutableDocument>,
    ) -> RemoteEvent {
        let mut change = TargetChange::synthesized_for_current_change(
            true,
            BytesValue::new(resume_token.to_vec()),
        );
        let mut document_updates = DocumentMap::new();
        for document in documents {
            change.added_documents.insert(document.key().clone());
            document_updates.insert(document.key().clone(), document);
        }
        let mut target_changes = BTreeMap::new();
        target_changes.insert(target_id, change);
        RemoteEvent {
            snapshot_version: version(seconds),
            target_changes,
            target_mismatches: BTreeMap::new(),
            document_updates,
            resolved_limbo_documents: DocumentKeySet::new(),
        }
    }

    #[tokio::test]
    async fn local_writes_are_visible_until_acknowledged() {
        let store = store();

        let write = store
            .write_locally(vec![Mutation::set(key("rooms/eros"), map("visits", 1))])
            .await
            .unwrap();

        let document = store.read_document(key("rooms/eros")).await.unwrap();
        assert!(document.is_found_document());
        assert!(document.has_local_mutations());
        assert_eq!(
            document.data().get("visits").and_then(FieldValue::as_integer),
            Some(1)
        );

        let batch = store
            .next_mutation_batch(crate::mutation::BATCH_ID_UNKNOWN)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.batch_id, write.batch_id);

        let commit = version(5);
        let mut doc_versions = BTreeMap::new();
        doc_versions.insert(key("rooms/eros"), commit);
        let result = MutationBatchResult {
            batch,
            commit_version: commit,
            mutation_results: vec![MutationResult {
                version: commit,
                transform_results: Vec::new(),
            }],
            stream_token: None,
            doc_versions,
        };
        store.acknowledge_batch(result).await.unwrap();

        let document = store.read_document(key("rooms/eros")).await.unwrap();
        assert!(!document.has_local_mutations());
        // Committed but not yet confirmed by watch.
        assert!(document.has_committed_mutations());
        assert_eq!(
            store.get_highest_unacknowledged_batch_id().await.unwrap(),
            crate::mutation::BATCH_ID_UNKNOWN
        );
    }

    #[tokio::test]
    async fn acknowledging_one_batch_keeps_later_overlays_applied() {
        let store = store();
        let first = store
            .write_locally(vec![Mutation::set(key("rooms/eros"), map("visits", 1))])
            .await
            .unwrap();
        let _second = store
            .write_locally(vec![Mutation::patch(
                key("rooms/eros"),
                map("stars", 5),
                FieldMask::new(vec![FieldPath::from_dot_separated("stars").unwrap()]),
            )])
            .await
            .unwrap();

        let batch = store
            .next_mutation_batch(crate::mutation::BATCH_ID_UNKNOWN)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.batch_id, first.batch_id);
        let commit = version(5);
        let mut doc_versions = BTreeMap::new();
        doc_versions.insert(key("rooms/eros"), commit);
        let result = MutationBatchResult {
            batch,
            commit_version: commit,
            mutation_results: vec![MutationResult {
                version: commit,
                transform_results: Vec::new(),
            }],
            stream_token: None,
            doc_versions,
        };
        store.acknowledge_batch(result).await.unwrap();

        // The recomputed overlay folds the still-queued second batch over the
        // acknowledged document.
        let document = store.read_document(key("rooms/eros")).await.unwrap();
        assert!(document.has_local_mutations());
        assert_eq!(
            document.data().get("visits").and_then(FieldValue::as_integer),
            Some(1)
        );
        assert_eq!(
            document.data().get("stars").and_then(FieldValue::as_integer),
            Some(5)
        );
    }

    #[tokio::test]
    async fn rejected_batches_roll_back_to_the_remote_view() {
        let store = store();
        let target = Query::at_path(ResourcePath::from_string("rooms").unwrap()).to_target();
        let target_data = store.allocate_target(target).await.unwrap();
        store
            .apply_remote_event(listen_event(
                target_data.target_id,
                1,
                b"token-1",
                vec![found_doc("rooms/eros", 1, "visits", 1)],
            ))
            .await
            .unwrap();

        let write = store
            .write_locally(vec![Mutation::patch(
                key("rooms/eros"),
                map("visits", 2),
                FieldMask::new(vec![FieldPath::from_dot_separated("visits").unwrap()]),
            )])
            .await
            .unwrap();
        let document = store.read_document(key("rooms/eros")).await.unwrap();
        assert_eq!(
            document.data().get("visits").and_then(FieldValue::as_integer),
            Some(2)
        );

        store.reject_batch(write.batch_id).await.unwrap();
        let document = store.read_document(key("rooms/eros")).await.unwrap();
        assert!(!document.has_pending_writes());
        assert_eq!(
            document.data().get("visits").and_then(FieldValue::as_integer),
            Some(1)
        );
    }

    #[tokio::test]
    async fn outdated_watch_updates_are_ignored() {
        let store = store();
        let target = Query::at_path(ResourcePath::from_string("rooms").unwrap()).to_target();
        let target_data = store.allocate_target(target).await.unwrap();

        store
            .apply_remote_event(listen_event(
                target_data.target_id,
                3,
                b"token-3",
                vec![found_doc("rooms/eros", 3, "visits", 3)],
            ))
            .await
            .unwrap();
        let changes = store
            .apply_remote_event(listen_event(
                target_data.target_id,
                4,
                b"token-4",
                vec![found_doc("rooms/eros", 2, "visits", 2)],
            ))
            .await
            .unwrap();

        assert!(changes.is_empty());
        let document = store.read_document(key("rooms/eros")).await.unwrap();
        assert_eq!(
            document.data().get("visits").and_then(FieldValue::as_integer),
            Some(3)
        );
    }

    #[tokio::test]
    async fn resume_tokens_buffer_until_documents_change() {
        let store = store();
        let target = Query::at_path(ResourcePath::from_string("rooms").unwrap()).to_target();
        let target_data = store.allocate_target(target.clone()).await.unwrap();
        let target_id = target_data.target_id;

        store
            .apply_remote_event(listen_event(
                target_id,
                1,
                b"token-1",
                vec![found_doc("rooms/eros", 1, "visits", 1)],
            ))
            .await
            .unwrap();

        // No document changes: the new token stays in memory.
        store
            .apply_remote_event(listen_event(target_id, 2, b"token-2", Vec::new()))
            .await
            .unwrap();

        let persisted = store
            .persistence
            .run_transaction(
                "read target",
                TransactionMode::ReadOnly,
                &User::unauthenticated(),
                |txn| Ok(txn.target_cache.get_target_data(&target).unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(persisted.resume_token.as_slice(), b"token-1");

        // The in-memory copy still advances, so a restart of the listen uses
        // the buffered token.
        let cached = store
            .state
            .lock()
            .unwrap()
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .unwrap();
        assert_eq!(cached.resume_token.as_slice(), b"token-2");
    }

    #[tokio::test]
    async fn allocating_a_released_target_restores_its_resume_token() {
        let store = store();
        let target = Query::at_path(ResourcePath::from_string("rooms").unwrap()).to_target();
        let first = store.allocate_target(target.clone()).await.unwrap();
        store
            .apply_remote_event(listen_event(
                first.target_id,
                1,
                b"token-1",
                vec![found_doc("rooms/eros", 1, "visits", 1)],
            ))
            .await
            .unwrap();

        store.release_target(first.target_id, false).await.unwrap();

        let second = store.allocate_target(target).await.unwrap();
        assert_eq!(second.target_id, first.target_id);
        assert_eq!(second.resume_token.as_slice(), b"token-1");
    }

    #[tokio::test]
    async fn user_change_reports_batch_and_document_deltas() {
        let store = store();
        store
            .write_locally(vec![Mutation::set(key("rooms/eros"), map("visits", 1))])
            .await
            .unwrap();

        let result = store.handle_user_change(User::new("alice")).await.unwrap();
        assert_eq!(result.removed_batch_ids.len(), 1);
        assert!(result.added_batch_ids.is_empty());
        // The unauthenticated user's pending write no longer applies.
        let document = result.affected_documents.get(&key("rooms/eros")).unwrap();
        assert!(!document.is_found_document());

        let back = store
            .handle_user_change(User::unauthenticated())
            .await
            .unwrap();
        assert_eq!(back.added_batch_ids.len(), 1);
        let document = back.affected_documents.get(&key("rooms/eros")).unwrap();
        assert!(document.is_found_document());
        assert!(document.has_local_mutations());
    }

    #[tokio::test]
    async fn query_results_include_remote_keys_for_the_target() {
        let store = store();
        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let target_data = store.allocate_target(query.to_target()).await.unwrap();
        store
            .apply_remote_event(listen_event(
                target_data.target_id,
                1,
                b"token-1",
                vec![
                    found_doc("rooms/eros", 1, "visits", 1),
                    found_doc("rooms/other", 1, "visits", 2),
                ],
            ))
            .await
            .unwrap();

        let result = store.execute_query(query, true).await.unwrap();
        assert_eq!(result.documents.len(), 2);
        assert_eq!(result.remote_keys.len(), 2);
        assert!(result.remote_keys.contains(&key("rooms/eros")));
    }
}
