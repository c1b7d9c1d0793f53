use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use futures::channel::oneshot;

use crate::api::{CredentialsProviderArc, User};
use crate::core::view::{LimboDocumentChange, View};
use crate::core::view_snapshot::ViewSnapshot;
use crate::core::{Query, TargetIdGenerator};
use crate::error::{cancelled, internal_error, SyncError, SyncResult};
use crate::local::{LocalStore, LocalViewChanges, ReferenceSet, TargetData, TargetPurpose};
use crate::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, SnapshotVersion, TargetId,
};
use crate::mutation::{Mutation, MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
use crate::remote::{
    DatastoreArc, OnlineState, OnlineStateHandler, RemoteEvent, RemoteStore, RemoteSyncer,
    TargetChange,
};
use crate::util::AsyncQueue;
use crate::value::BytesValue;

/// Upper bound on concurrently active limbo lookups. Keys past the bound wait
/// in arrival order until an active resolution finishes.
const MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// A write future resolved when the backend acknowledges or rejects the batch.
pub type WriteAck = oneshot::Receiver<SyncResult<()>>;

/// Receives what the engine produces: view snapshots, per-query failures, and
/// online-state transitions. The event manager implements this; it registers
/// itself after construction since each side needs a handle to the other.
pub trait SyncEngineEvents: Send + Sync + 'static {
    fn on_view_snapshots(&self, snapshots: Vec<ViewSnapshot>);
    fn on_watch_error(&self, query: &Query, error: SyncError);
    fn on_online_state_change(&self, online_state: OnlineState);
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// An active point lookup for a document whose view membership is in doubt.
struct LimboResolution {
    key: DocumentKey,
    /// Whether the lookup has seen the document. Distinguishes "the target is
    /// current and the document exists" from "the target is current because
    /// the document was deleted".
    received_document: bool,
}

struct SyncEngineState {
    views_by_query: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    mutation_callbacks: BTreeMap<BatchId, oneshot::Sender<SyncResult<()>>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<oneshot::Sender<SyncResult<()>>>>,
    online_state: OnlineState,
    current_user: User,
}

impl SyncEngineState {
    fn new(initial_user: User) -> Self {
        Self {
            views_by_query: BTreeMap::new(),
            queries_by_target: BTreeMap::new(),
            limbo_targets_by_key: BTreeMap::new(),
            limbo_resolutions_by_target: BTreeMap::new(),
            enqueued_limbo_resolutions: VecDeque::new(),
            limbo_document_refs: ReferenceSet::new(),
            limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
            mutation_callbacks: BTreeMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            online_state: OnlineState::Unknown,
            current_user: initial_user,
        }
    }
}

/// Glue between the local store, the remote store, and listeners. Tracks one
/// [`View`] per listened query, routes remote snapshots and write outcomes
/// into those views, and chases unresolved documents through limbo lookups.
///
/// Every method must be called from the worker queue.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

impl SyncEngine {
    pub fn new(
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        datastore: DatastoreArc,
        credentials: CredentialsProviderArc,
        initial_user: User,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SyncEngineInner>| {
            let syncer: Arc<dyn RemoteSyncer> = Arc::new(EngineSyncer {
                engine: weak.clone(),
            });
            let handler_engine = weak.clone();
            let online_state_handler: OnlineStateHandler = Arc::new(move |online_state| {
                let engine = handler_engine.clone();
                Box::pin(async move {
                    if let Some(engine) = engine.upgrade() {
                        engine.apply_online_state_change(online_state);
                    }
                })
            });
            let remote_store = RemoteStore::new(
                queue.clone(),
                datastore,
                credentials,
                syncer,
                online_state_handler,
            );
            SyncEngineInner {
                local_store,
                remote_store,
                state: StdMutex::new(SyncEngineState::new(initial_user)),
                events: StdMutex::new(None),
            }
        });
        Self { inner }
    }

    /// Registers the consumer of snapshots and errors. Held weakly so dropping
    /// the event manager does not leak the engine.
    pub fn set_event_sink(&self, events: Weak<dyn SyncEngineEvents>) {
        *self.inner.events.lock().unwrap() = Some(events);
    }

    /// Starts tracking a query and returns its initial, cache-sourced
    /// snapshot. Subsequent snapshots flow through the event sink.
    pub async fn listen(&self, query: Query) -> SyncResult<ViewSnapshot> {
        self.inner.listen(query).await
    }

    /// Stops tracking a query, releasing its target once no query uses it.
    pub async fn unlisten(&self, query: &Query) -> SyncResult<()> {
        self.inner.unlisten(query).await
    }

    /// Commits mutations locally and schedules them for the backend. The
    /// returned future resolves when the backend acknowledges the batch.
    pub async fn write(&self, mutations: Vec<Mutation>) -> SyncResult<WriteAck> {
        self.inner.write(mutations).await
    }

    /// Resolves once every write pending at the time of the call has been
    /// acknowledged or rejected.
    pub async fn register_pending_writes_callback(&self) -> SyncResult<WriteAck> {
        self.inner.register_pending_writes_callback().await
    }

    pub async fn enable_network(&self) -> SyncResult<()> {
        self.inner.remote_store.enable_network().await
    }

    pub async fn disable_network(&self) -> SyncResult<()> {
        self.inner.remote_store.disable_network().await
    }

    /// Rebinds local state to `user` and restarts the streams with the new
    /// credentials.
    pub async fn handle_credential_change(&self, user: User) -> SyncResult<()> {
        self.inner.remote_store.handle_credential_change(user).await
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.inner.remote_store.shutdown().await
    }

    pub fn current_user(&self) -> User {
        self.inner.state.lock().unwrap().current_user.clone()
    }
}

struct SyncEngineInner {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    state: StdMutex<SyncEngineState>,
    events: StdMutex<Option<Weak<dyn SyncEngineEvents>>>,
}

impl SyncEngineInner {
    fn events(&self) -> Option<Arc<dyn SyncEngineEvents>> {
        let events = self.events.lock().unwrap();
        events.as_ref().and_then(Weak::upgrade)
    }

    /// Hands snapshots to the event sink. Called with no state lock held;
    /// the sink runs arbitrary listener callbacks.
    fn emit_snapshots(&self, snapshots: Vec<ViewSnapshot>) {
        if snapshots.is_empty() {
            return;
        }
        if let Some(events) = self.events() {
            events.on_view_snapshots(snapshots);
        }
    }

    async fn listen(&self, query: Query) -> SyncResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        if self
            .state
            .lock()
            .unwrap()
            .views_by_query
            .contains_key(&canonical_id)
        {
            return Err(internal_error("Query is already being listened to"));
        }
        let target_data = self.local_store.allocate_target(query.to_target()).await?;
        let first_query_for_target = self
            .state
            .lock()
            .unwrap()
            .queries_by_target
            .get(&target_data.target_id)
            .map_or(true, |queries| queries.is_empty());
        let snapshot = self
            .initialize_view_and_compute_snapshot(
                query,
                target_data.target_id,
                &target_data.resume_token,
            )
            .await?;
        if first_query_for_target {
            self.remote_store.listen(target_data).await?;
        }
        Ok(snapshot)
    }

    async fn initialize_view_and_compute_snapshot(
        &self,
        query: Query,
        target_id: TargetId,
        resume_token: &BytesValue,
    ) -> SyncResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(query.clone(), true).await?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let view_doc_changes = view.compute_doc_changes(&query_result.documents, None);
        // A fresh listen starts from cache even when a resume token exists;
        // the synthesized change only seeds the view's resume state.
        let synthesized =
            TargetChange::synthesized_for_current_change(false, resume_token.clone());
        let view_change = view.apply_changes(view_doc_changes, true, Some(&synthesized), false);
        self.update_tracked_limbos(target_id, &view_change.limbo_changes)
            .await?;
        let snapshot = view_change
            .snapshot
            .ok_or_else(|| internal_error("A new view must produce an initial snapshot"))?;
        let mut state = self.state.lock().unwrap();
        state.views_by_query.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        state
            .queries_by_target
            .entry(target_id)
            .or_default()
            .push(query);
        Ok(snapshot)
    }

    async fn unlisten(&self, query: &Query) -> SyncResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = {
            let mut state = self.state.lock().unwrap();
            let Some(query_view) = state.views_by_query.get(&canonical_id) else {
                return Err(internal_error("Unlisten for a query that is not active"));
            };
            let target_id = query_view.target_id;
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                // Another query still feeds off this target.
                queries.retain(|candidate| candidate.canonical_id() != canonical_id);
                state.views_by_query.remove(&canonical_id);
                return Ok(());
            }
            target_id
        };
        self.local_store.release_target(target_id, false).await?;
        self.remote_store.unlisten(target_id).await?;
        self.remove_and_cleanup_target(target_id, None).await
    }

    /// Drops all bookkeeping for a target. With an error, every query mapped
    /// to it is failed through the event sink.
    async fn remove_and_cleanup_target(
        &self,
        target_id: TargetId,
        error: Option<SyncError>,
    ) -> SyncResult<()> {
        let (queries, orphaned_limbo_keys) = {
            let mut state = self.state.lock().unwrap();
            let queries = state.queries_by_target.remove(&target_id).unwrap_or_default();
            for query in &queries {
                state.views_by_query.remove(&query.canonical_id());
            }
            let released = state.limbo_document_refs.remove_references_for_id(target_id);
            let orphaned: Vec<DocumentKey> = released
                .into_iter()
                .filter(|key| !state.limbo_document_refs.contains_key(key))
                .collect();
            (queries, orphaned)
        };
        if let Some(error) = error {
            if let Some(events) = self.events() {
                for query in &queries {
                    events.on_watch_error(query, error.clone());
                }
            }
        }
        for key in orphaned_limbo_keys {
            self.remove_limbo_target(&key).await?;
        }
        Ok(())
    }

    async fn remove_limbo_target(&self, key: &DocumentKey) -> SyncResult<()> {
        let limbo_target_id = {
            let mut state = self.state.lock().unwrap();
            state.enqueued_limbo_resolutions.retain(|pending| pending != key);
            let Some(limbo_target_id) = state.limbo_targets_by_key.remove(key) else {
                // Never activated; removing it from the wait list was enough.
                return Ok(());
            };
            state.limbo_resolutions_by_target.remove(&limbo_target_id);
            limbo_target_id
        };
        self.remote_store.unlisten(limbo_target_id).await?;
        self.pump_enqueued_limbo_resolutions().await
    }

    async fn update_tracked_limbos(
        &self,
        target_id: TargetId,
        limbo_changes: &[LimboDocumentChange],
    ) -> SyncResult<()> {
        for limbo_change in limbo_changes {
            match limbo_change {
                LimboDocumentChange::Added(key) => {
                    let newly_enqueued = {
                        let mut state = self.state.lock().unwrap();
                        state.limbo_document_refs.add_reference(key.clone(), target_id);
                        if !state.limbo_targets_by_key.contains_key(key)
                            && !state.enqueued_limbo_resolutions.contains(key)
                        {
                            state.enqueued_limbo_resolutions.push_back(key.clone());
                            true
                        } else {
                            false
                        }
                    };
                    if newly_enqueued {
                        log::debug!("New document in limbo: {key}");
                        self.pump_enqueued_limbo_resolutions().await?;
                    }
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("Document no longer in limbo: {key}");
                    let still_referenced = {
                        let mut state = self.state.lock().unwrap();
                        state.limbo_document_refs.remove_reference(key, target_id);
                        state.limbo_document_refs.contains_key(key)
                    };
                    if !still_referenced {
                        self.remove_limbo_target(key).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Activates waiting limbo lookups until the concurrency bound is full.
    async fn pump_enqueued_limbo_resolutions(&self) -> SyncResult<()> {
        let to_listen = {
            let mut state = self.state.lock().unwrap();
            let mut pending = Vec::new();
            while state.limbo_targets_by_key.len() < MAX_CONCURRENT_LIMBO_RESOLUTIONS {
                let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                    break;
                };
                let limbo_target_id = state.limbo_target_id_generator.next();
                state.limbo_resolutions_by_target.insert(
                    limbo_target_id,
                    LimboResolution {
                        key: key.clone(),
                        received_document: false,
                    },
                );
                state.limbo_targets_by_key.insert(key.clone(), limbo_target_id);
                // Limbo targets never touch the target cache, so the sequence
                // number is inert.
                pending.push(TargetData::new(
                    Query::at_path(key.path().clone()).to_target(),
                    limbo_target_id,
                    TargetPurpose::LimboResolution,
                    0,
                ));
            }
            pending
        };
        for target_data in to_listen {
            self.remote_store.listen(target_data).await?;
        }
        Ok(())
    }

    async fn apply_remote_event(&self, remote_event: RemoteEvent) -> SyncResult<()> {
        let changes = self
            .local_store
            .apply_remote_event(remote_event.clone())
            .await?;
        {
            let mut state = self.state.lock().unwrap();
            for (target_id, change) in &remote_event.target_changes {
                if let Some(resolution) = state.limbo_resolutions_by_target.get_mut(target_id) {
                    // A limbo lookup concerns exactly one document: added
                    // means it exists, removed means it is gone.
                    if !change.added_documents.is_empty() {
                        resolution.received_document = true;
                    } else if !change.removed_documents.is_empty() {
                        resolution.received_document = false;
                    }
                }
            }
        }
        self.emit_new_snaps_and_notify_local_store(changes, Some(&remote_event))
            .await
    }

    fn apply_online_state_change(&self, online_state: OnlineState) {
        let new_snapshots = {
            let mut state = self.state.lock().unwrap();
            state.online_state = online_state;
            let mut snapshots = Vec::new();
            for query_view in state.views_by_query.values_mut() {
                let view_change = query_view.view.apply_online_state_change(online_state);
                if let Some(snapshot) = view_change.snapshot {
                    snapshots.push(snapshot);
                }
            }
            snapshots
        };
        if let Some(events) = self.events() {
            events.on_online_state_change(online_state);
        }
        self.emit_snapshots(new_snapshots);
    }

    async fn reject_listen(&self, target_id: TargetId, error: SyncError) -> SyncResult<()> {
        let limbo_key = {
            let state = self.state.lock().unwrap();
            state
                .limbo_resolutions_by_target
                .get(&target_id)
                .map(|resolution| resolution.key.clone())
        };
        if let Some(key) = limbo_key {
            // The server rejected the point lookup. Synthesize a deletion so
            // views drop the document instead of waiting forever.
            let mut document_updates = DocumentMap::new();
            document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), SnapshotVersion::MIN),
            );
            let event = RemoteEvent {
                snapshot_version: SnapshotVersion::MIN,
                target_changes: BTreeMap::new(),
                target_mismatches: BTreeMap::new(),
                document_updates,
                resolved_limbo_documents: DocumentKeySet::from([key.clone()]),
            };
            self.apply_remote_event(event).await?;
            {
                let mut state = self.state.lock().unwrap();
                state.limbo_targets_by_key.remove(&key);
                state.limbo_resolutions_by_target.remove(&target_id);
            }
            self.pump_enqueued_limbo_resolutions().await
        } else {
            self.local_store.release_target(target_id, false).await?;
            self.remove_and_cleanup_target(target_id, Some(error)).await
        }
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> SyncResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(result).await?;
        // Write futures resolve before listeners observe the acknowledged
        // data, never after.
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(changes, None).await
    }

    async fn reject_failed_write(&self, batch_id: BatchId, error: SyncError) -> SyncResult<()> {
        let changes = self.local_store.reject_batch(batch_id).await?;
        self.process_user_callback(batch_id, Err(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(changes, None).await
    }

    async fn write(&self, mutations: Vec<Mutation>) -> SyncResult<WriteAck> {
        let result = self.local_store.write_locally(mutations).await?;
        let (sender, receiver) = oneshot::channel();
        self.state
            .lock()
            .unwrap()
            .mutation_callbacks
            .insert(result.batch_id, sender);
        self.emit_new_snaps_and_notify_local_store(result.changes, None)
            .await?;
        self.remote_store.fill_write_pipeline().await?;
        Ok(receiver)
    }

    async fn register_pending_writes_callback(&self) -> SyncResult<WriteAck> {
        let (sender, receiver) = oneshot::channel();
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id().await?;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
            return Ok(receiver);
        }
        self.state
            .lock()
            .unwrap()
            .pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(sender);
        Ok(receiver)
    }

    fn process_user_callback(&self, batch_id: BatchId, result: SyncResult<()>) {
        let sender = self
            .state
            .lock()
            .unwrap()
            .mutation_callbacks
            .remove(&batch_id);
        if let Some(sender) = sender {
            // The caller may have dropped the receiving end.
            let _ = sender.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&self, batch_id: BatchId) {
        let callbacks = self
            .state
            .lock()
            .unwrap()
            .pending_writes_callbacks
            .remove(&batch_id);
        for sender in callbacks.into_iter().flatten() {
            let _ = sender.send(Ok(()));
        }
    }

    async fn handle_credential_change(&self, user: User) -> SyncResult<()> {
        let user_changed = self.state.lock().unwrap().current_user != user;
        if !user_changed {
            return Ok(());
        }
        log::debug!("User changed; new uid {:?}", user.uid());
        let result = self.local_store.handle_user_change(user.clone()).await?;
        self.state.lock().unwrap().current_user = user;
        self.fail_outstanding_user_callbacks();
        self.emit_new_snaps_and_notify_local_store(result.affected_documents, None)
            .await
    }

    /// Write futures belong to the user who issued them; a credential change
    /// orphans every outstanding one.
    fn fail_outstanding_user_callbacks(&self) {
        let (mutation_callbacks, pending_writes_callbacks) = {
            let mut state = self.state.lock().unwrap();
            (
                mem::take(&mut state.mutation_callbacks),
                mem::take(&mut state.pending_writes_callbacks),
            )
        };
        for (_, sender) in mutation_callbacks {
            let _ = sender.send(Err(cancelled("Pending write cancelled by a user change")));
        }
        for sender in pending_writes_callbacks.into_values().flatten() {
            let _ = sender.send(Err(cancelled(
                "Wait for pending writes cancelled by a user change",
            )));
        }
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        let state = self.state.lock().unwrap();
        if let Some(resolution) = state.limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return DocumentKeySet::from([resolution.key.clone()]);
            }
            return DocumentKeySet::new();
        }
        let mut keys = DocumentKeySet::new();
        if let Some(queries) = state.queries_by_target.get(&target_id) {
            for query in queries {
                if let Some(query_view) = state.views_by_query.get(&query.canonical_id()) {
                    keys.extend(query_view.view.synced_documents().iter().cloned());
                }
            }
        }
        keys
    }

    /// Routes a batch of document changes through every view, refilling limit
    /// queries from the cache where needed, then fans the resulting snapshots
    /// out to listeners and reports view membership back to the local store.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> SyncResult<()> {
        let mut new_snapshots = Vec::new();
        let mut local_view_changes = Vec::new();
        let canonical_ids: Vec<String> = {
            let state = self.state.lock().unwrap();
            state.views_by_query.keys().cloned().collect()
        };
        for canonical_id in canonical_ids {
            let (query, target_id, mut view_doc_changes) = {
                let state = self.state.lock().unwrap();
                let Some(query_view) = state.views_by_query.get(&canonical_id) else {
                    continue;
                };
                (
                    query_view.query.clone(),
                    query_view.target_id,
                    query_view.view.compute_doc_changes(&changes, None),
                )
            };
            if view_doc_changes.needs_refill {
                // The limit query shrank below its limit; only a full query
                // against the cache can tell us what slides back in.
                let query_result = self.local_store.execute_query(query.clone(), false).await?;
                view_doc_changes = {
                    let state = self.state.lock().unwrap();
                    let Some(query_view) = state.views_by_query.get(&canonical_id) else {
                        continue;
                    };
                    query_view
                        .view
                        .compute_doc_changes(&query_result.documents, Some(view_doc_changes))
                };
            }
            let view_change = {
                let mut state = self.state.lock().unwrap();
                let Some(query_view) = state.views_by_query.get_mut(&canonical_id) else {
                    continue;
                };
                let target_change =
                    remote_event.and_then(|event| event.target_changes.get(&target_id));
                let target_is_pending_reset = remote_event
                    .map(|event| event.target_mismatches.contains_key(&target_id))
                    .unwrap_or(false);
                query_view.view.apply_changes(
                    view_doc_changes,
                    true,
                    target_change,
                    target_is_pending_reset,
                )
            };
            self.update_tracked_limbos(target_id, &view_change.limbo_changes)
                .await?;
            if let Some(snapshot) = view_change.snapshot {
                local_view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                new_snapshots.push(snapshot);
            }
        }
        self.emit_snapshots(new_snapshots);
        self.local_store
            .notify_local_view_changes(local_view_changes)
            .await?;
        Ok(())
    }
}

/// The remote store's face of the engine. Holds a weak reference so the
/// remote store never keeps the engine alive.
struct EngineSyncer {
    engine: Weak<SyncEngineInner>,
}

#[async_trait]
impl RemoteSyncer for EngineSyncer {
    async fn apply_remote_event(&self, remote_event: RemoteEvent) -> SyncResult<()> {
        match self.engine.upgrade() {
            Some(engine) => engine.apply_remote_event(remote_event).await,
            None => Ok(()),
        }
    }

    async fn reject_listen(&self, target_id: TargetId, error: SyncError) -> SyncResult<()> {
        match self.engine.upgrade() {
            Some(engine) => engine.reject_listen(target_id, error).await,
            None => Ok(()),
        }
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> SyncResult<()> {
        match self.engine.upgrade() {
            Some(engine) => engine.apply_successful_write(result).await,
            None => Ok(()),
        }
    }

    async fn reject_failed_write(&self, batch_id: BatchId, error: SyncError) -> SyncResult<()> {
        match self.engine.upgrade() {
            Some(engine) => engine.reject_failed_write(batch_id, error).await,
            None => Ok(()),
        }
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        match self.engine.upgrade() {
            Some(engine) => engine.get_remote_keys_for_target(target_id),
            None => DocumentKeySet::new(),
        }
    }

    async fn handle_credential_change(&self, user: User) -> SyncResult<()> {
        match self.engine.upgrade() {
            Some(engine) => engine.handle_credential_change(user).await,
            None => Ok(()),
        }
    }

    async fn next_mutation_batch(
        &self,
        after_batch_id: BatchId,
    ) -> SyncResult<Option<MutationBatch>> {
        match self.engine.upgrade() {
            Some(engine) => engine.local_store.next_mutation_batch(after_batch_id).await,
            None => Ok(None),
        }
    }

    async fn get_last_remote_snapshot_version(&self) -> SyncResult<SnapshotVersion> {
        match self.engine.upgrade() {
            Some(engine) => engine.local_store.get_last_remote_snapshot_version().await,
            None => Ok(SnapshotVersion::MIN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::api::EmptyCredentialsProvider;
    use crate::error::SyncErrorCode;
    use crate::local::Persistence;
    use crate::model::{DatabaseId, ResourcePath};
    use crate::remote::{
        ConnectionDatastore, FrameKind, InMemoryTransport, JsonProtoSerializer, StreamId,
        StreamTransport, TransportFrame,
    };
    use crate::runtime;
    use crate::value::MapValue;

    #[derive(Default)]
    struct TestEvents {
        snapshots: StdMutex<Vec<ViewSnapshot>>,
        errors: StdMutex<Vec<(String, SyncErrorCode)>>,
        online_states: StdMutex<Vec<OnlineState>>,
    }

    impl SyncEngineEvents for TestEvents {
        fn on_view_snapshots(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: SyncError) {
            self.errors
                .lock()
                .unwrap()
                .push((query.canonical_id(), error.code));
        }

        fn on_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        engine: SyncEngine,
        server: Arc<InMemoryTransport>,
        events: Arc<TestEvents>,
    }

    fn fixture() -> Fixture {
        let queue = AsyncQueue::new();
        let (client, server) = InMemoryTransport::pair();
        let datastore: DatastoreArc = Arc::new(ConnectionDatastore::new(
            client,
            JsonProtoSerializer::new(DatabaseId::new("p", "(default)")),
        ));
        let persistence = Persistence::in_memory();
        persistence.start();
        let local_store = Arc::new(LocalStore::new(persistence, User::unauthenticated()));
        let engine = SyncEngine::new(
            queue.clone(),
            local_store,
            datastore,
            Arc::new(EmptyCredentialsProvider),
            User::unauthenticated(),
        );
        let events = Arc::new(TestEvents::default());
        engine.set_event_sink(Arc::downgrade(&events) as Weak<dyn SyncEngineEvents>);
        Fixture {
            queue,
            engine,
            server,
            events,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            runtime::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    async fn expect_open(fixture: &Fixture, expected_service: &str) -> StreamId {
        let frame = fixture.server.next().await.unwrap();
        let id = frame.stream_id();
        match frame.kind() {
            FrameKind::Open { service, .. } => assert_eq!(service, expected_service),
            other => panic!("expected open frame, got {other:?}"),
        }
        id
    }

    async fn expect_request(fixture: &Fixture) -> serde_json::Value {
        let frame = fixture.server.next().await.unwrap();
        match frame.into_kind() {
            FrameKind::Data(payload) => serde_json::from_slice(&payload).unwrap(),
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    async fn respond(fixture: &Fixture, stream_id: StreamId, response: serde_json::Value) {
        fixture
            .server
            .send(TransportFrame::data(
                stream_id,
                serde_json::to_vec(&response).unwrap(),
            ))
            .await
            .unwrap();
    }

    fn rooms_query() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    fn set_mutation(path: &str) -> Mutation {
        Mutation::set(DocumentKey::from_string(path).unwrap(), MapValue::empty())
    }

    #[tokio::test]
    async fn listen_returns_a_cache_snapshot_that_sees_local_writes() {
        let fixture = fixture();
        let engine = fixture.engine.clone();
        fixture
            .queue
            .enqueue(async move {
                engine.disable_network().await?;
                let _ack = engine.write(vec![set_mutation("rooms/eros")]).await?;
                let snapshot = engine.listen(rooms_query()).await?;
                assert!(snapshot.from_cache);
                assert!(snapshot.has_pending_writes());
                assert!(snapshot
                    .documents
                    .contains_key(&DocumentKey::from_string("rooms/eros").unwrap()));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn local_writes_fan_out_to_existing_views() {
        let fixture = fixture();
        let engine = fixture.engine.clone();
        fixture
            .queue
            .enqueue(async move {
                engine.disable_network().await?;
                let snapshot = engine.listen(rooms_query()).await?;
                assert!(snapshot.documents.is_empty());
                let _ack = engine.write(vec![set_mutation("rooms/eros")]).await?;
                Ok(())
            })
            .await
            .unwrap();
        let snapshots = fixture.events.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].doc_changes.len(), 1);
        assert!(snapshots[0].has_pending_writes());
        assert!(snapshots[0].from_cache);
    }

    #[tokio::test]
    async fn wait_for_pending_writes_resolves_immediately_when_none_are_outstanding() {
        let fixture = fixture();
        let engine = fixture.engine.clone();
        let ack = fixture
            .queue
            .enqueue(async move { engine.register_pending_writes_callback().await })
            .await
            .unwrap();
        ack.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn user_change_cancels_outstanding_write_futures() {
        let fixture = fixture();
        let engine = fixture.engine.clone();
        let (write_ack, pending_ack) = fixture
            .queue
            .enqueue(async move {
                engine.disable_network().await?;
                let write_ack = engine.write(vec![set_mutation("rooms/eros")]).await?;
                let pending_ack = engine.register_pending_writes_callback().await?;
                engine.handle_credential_change(User::new("bob")).await?;
                Ok((write_ack, pending_ack))
            })
            .await
            .unwrap();
        let error = write_ack.await.unwrap().unwrap_err();
        assert_eq!(error.code, SyncErrorCode::Cancelled);
        let error = pending_ack.await.unwrap().unwrap_err();
        assert_eq!(error.code, SyncErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn unlisten_releases_the_query_for_a_fresh_listen() {
        let fixture = fixture();
        let engine = fixture.engine.clone();
        fixture
            .queue
            .enqueue(async move {
                engine.disable_network().await?;
                engine.listen(rooms_query()).await?;
                engine.unlisten(&rooms_query()).await?;
                let snapshot = engine.listen(rooms_query()).await?;
                assert!(snapshot.from_cache);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn server_current_promotes_the_view_to_synced() {
        let fixture = fixture();
        let engine = fixture.engine.clone();
        let snapshot = fixture
            .queue
            .enqueue(async move {
                engine.enable_network().await?;
                engine.listen(rooms_query()).await
            })
            .await
            .unwrap();
        assert!(snapshot.from_cache);

        let stream_id = expect_open(&fixture, "Listen").await;
        let request = expect_request(&fixture).await;
        assert_eq!(request["addTarget"]["targetId"], 2);
        respond(
            &fixture,
            stream_id,
            serde_json::json!({
                "targetChange": { "targetChangeType": "ADD", "targetIds": [2] }
            }),
        )
        .await;
        respond(
            &fixture,
            stream_id,
            serde_json::json!({
                "targetChange": { "targetChangeType": "CURRENT", "targetIds": [2] }
            }),
        )
        .await;
        respond(
            &fixture,
            stream_id,
            serde_json::json!({
                "targetChange": {
                    "targetChangeType": "NO_CHANGE",
                    "targetIds": [],
                    "readTime": "1970-01-01T00:00:01Z"
                }
            }),
        )
        .await;

        wait_until(|| {
            fixture
                .events
                .snapshots
                .lock()
                .unwrap()
                .iter()
                .any(|snapshot| !snapshot.from_cache)
        })
        .await;
        let snapshots = fixture.events.snapshots.lock().unwrap();
        let synced = snapshots
            .iter()
            .find(|snapshot| !snapshot.from_cache)
            .unwrap();
        assert!(synced.sync_state_changed);
        assert!(synced.documents.is_empty());
    }

    #[tokio::test]
    async fn rejected_target_fails_its_queries_through_the_sink() {
        let fixture = fixture();
        let engine = fixture.engine.clone();
        fixture
            .queue
            .enqueue(async move {
                engine.enable_network().await?;
                engine.listen(rooms_query()).await?;
                Ok(())
            })
            .await
            .unwrap();

        let stream_id = expect_open(&fixture, "Listen").await;
        let request = expect_request(&fixture).await;
        assert_eq!(request["addTarget"]["targetId"], 2);
        respond(
            &fixture,
            stream_id,
            serde_json::json!({
                "targetChange": {
                    "targetChangeType": "REMOVE",
                    "targetIds": [2],
                    "cause": { "code": 7, "message": "not allowed" }
                }
            }),
        )
        .await;

        wait_until(|| !fixture.events.errors.lock().unwrap().is_empty()).await;
        let errors = fixture.events.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, rooms_query().canonical_id());
        assert_eq!(errors[0].1, SyncErrorCode::PermissionDenied);
    }
}
