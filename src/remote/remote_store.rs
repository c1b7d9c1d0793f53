use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;

use crate::api::{CredentialsProviderArc, User};
use crate::error::{
    internal_error, is_permanent_write_error, unavailable, SyncError, SyncResult,
};
use crate::local::TargetData;
use crate::model::{DocumentKeySet, SnapshotVersion, TargetId};
use crate::mutation::{MutationBatch, MutationBatchResult, MutationResult, BATCH_ID_UNKNOWN};
use crate::remote::datastore::DatastoreArc;
use crate::remote::listen_stream::{ListenStream, WatchStreamCallbacks};
use crate::remote::online_state_tracker::{OnlineState, OnlineStateHandler, OnlineStateTracker};
use crate::remote::remote_syncer::RemoteSyncer;
use crate::remote::watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::remote::write_stream::{WriteStream, WriteStreamCallbacks};
use crate::util::async_queue::AsyncQueue;
use crate::value::BytesValue;

/// Cap on unacknowledged batches on the write stream. Keeps a burst of local
/// writes from starving the listen stream on a shared connection.
const MAX_PENDING_WRITES: usize = 10;

/// Reasons network use is currently forbidden. The network is usable only
/// while this set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    Shutdown,
}

/// Feeds the aggregator from the two places target state lives: synced keys
/// from the syncer, target data from the remote store's listen map.
struct StoreMetadataProvider {
    syncer: Arc<dyn RemoteSyncer>,
    store: Weak<RemoteStoreInner>,
}

impl TargetMetadataProvider for StoreMetadataProvider {
    fn get_remote_keys(&self, target_id: TargetId) -> DocumentKeySet {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data(&self, target_id: TargetId) -> Option<TargetData> {
        self.store.upgrade().and_then(|inner| {
            inner
                .state
                .lock()
                .unwrap()
                .listen_targets
                .get(&target_id)
                .cloned()
        })
    }
}

#[derive(Default)]
struct RemoteStoreState {
    listen_targets: BTreeMap<TargetId, TargetData>,
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

/// Owns the client's two backend streams: one Listen stream multiplexing
/// every active target and one Write stream draining the mutation queue in
/// order. Restarts them as needed and translates stream traffic into syncer
/// calls.
///
/// Every method runs on the worker queue; stream callbacks arrive there too.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        queue: AsyncQueue,
        datastore: DatastoreArc,
        credentials: CredentialsProviderArc,
        syncer: Arc<dyn RemoteSyncer>,
        online_state_handler: OnlineStateHandler,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let listen_stream = ListenStream::new(
                queue.clone(),
                Arc::clone(&credentials),
                Arc::clone(&datastore),
                weak.clone() as Weak<dyn WatchStreamCallbacks>,
            );
            let write_stream = WriteStream::new(
                queue.clone(),
                Arc::clone(&credentials),
                Arc::clone(&datastore),
                weak.clone() as Weak<dyn WriteStreamCallbacks>,
            );
            RemoteStoreInner {
                syncer,
                listen_stream,
                write_stream,
                online_state_tracker: OnlineStateTracker::new(queue, online_state_handler),
                state: StdMutex::new(RemoteStoreState::default()),
                aggregator: StdMutex::new(None),
                weak_self: weak.clone(),
            }
        });
        Self { inner }
    }

    /// Re-allows network use after `disable_network` and reconnects streams
    /// that have work.
    pub async fn enable_network(&self) -> SyncResult<()> {
        self.inner.enable_network().await
    }

    /// Tears down both streams and drops queued batches; listens and writes
    /// keep accumulating locally until the network is re-enabled.
    pub async fn disable_network(&self) -> SyncResult<()> {
        self.inner.disable_network().await
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.inner.shutdown().await
    }

    /// Starts tracking a target. Sent immediately when the listen stream is
    /// up, otherwise on the next (re)connect.
    pub async fn listen(&self, target_data: TargetData) -> SyncResult<()> {
        self.inner.listen(target_data).await
    }

    /// Stops tracking a target.
    pub async fn unlisten(&self, target_id: TargetId) -> SyncResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Pulls batches from the mutation queue onto the write stream, up to the
    /// in-flight cap. Call after new local writes are accepted.
    pub async fn fill_write_pipeline(&self) -> SyncResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Restarts both streams so they pick up credentials for `user`, after
    /// letting the syncer rebind its user-scoped state.
    pub async fn handle_credential_change(&self, user: User) -> SyncResult<()> {
        self.inner.handle_credential_change(user).await
    }
}

struct RemoteStoreInner {
    syncer: Arc<dyn RemoteSyncer>,
    listen_stream: ListenStream,
    write_stream: WriteStream,
    online_state_tracker: OnlineStateTracker,
    state: StdMutex<RemoteStoreState>,
    /// Fresh per listen-stream connection; `None` while the stream is down.
    /// Locked after `state`, never the other way around.
    aggregator: StdMutex<Option<WatchChangeAggregator>>,
    weak_self: Weak<RemoteStoreInner>,
}

impl RemoteStoreInner {
    fn can_use_network(&self) -> bool {
        self.state.lock().unwrap().offline_causes.is_empty()
    }

    async fn enable_network(&self) -> SyncResult<()> {
        self.state
            .lock()
            .unwrap()
            .offline_causes
            .remove(&OfflineCause::UserDisabled);
        self.enable_network_internal().await
    }

    async fn enable_network_internal(&self) -> SyncResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream().await;
        } else {
            self.online_state_tracker.set(OnlineState::Unknown).await;
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network(&self) -> SyncResult<()> {
        self.state
            .lock()
            .unwrap()
            .offline_causes
            .insert(OfflineCause::UserDisabled);
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Offline).await;
        Ok(())
    }

    async fn disable_network_internal(&self) {
        self.listen_stream.stop().await;
        self.write_stream.stop().await;
        let dropped = {
            let mut state = self.state.lock().unwrap();
            let dropped = state.write_pipeline.len();
            state.write_pipeline.clear();
            dropped
        };
        if dropped > 0 {
            log::debug!("Dropping {dropped} in-flight batches; they re-enter the pipeline on reconnect");
        }
        self.clean_up_watch_stream_state();
    }

    async fn shutdown(&self) -> SyncResult<()> {
        log::debug!("RemoteStore shutting down");
        self.state
            .lock()
            .unwrap()
            .offline_causes
            .insert(OfflineCause::Shutdown);
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Unknown).await;
        Ok(())
    }

    async fn listen(&self, target_data: TargetData) -> SyncResult<()> {
        let target_id = target_data.target_id;
        {
            let mut state = self.state.lock().unwrap();
            if state.listen_targets.contains_key(&target_id) {
                return Ok(());
            }
            state.listen_targets.insert(target_id, target_data.clone());
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream().await;
        } else if self.listen_stream.is_open() {
            self.send_watch_request(&target_data).await?;
        }
        Ok(())
    }

    async fn unlisten(&self, target_id: TargetId) -> SyncResult<()> {
        let remaining = {
            let mut state = self.state.lock().unwrap();
            state.listen_targets.remove(&target_id);
            state.listen_targets.len()
        };
        if self.listen_stream.is_open() {
            self.send_unwatch_request(target_id).await?;
        }
        if remaining == 0 {
            if self.listen_stream.is_open() {
                self.listen_stream.mark_idle();
            } else if self.can_use_network() {
                // With no targets the watch stream says nothing about
                // connectivity.
                self.online_state_tracker.set(OnlineState::Unknown).await;
            }
        }
        Ok(())
    }

    async fn handle_credential_change(&self, user: User) -> SyncResult<()> {
        log::debug!("Credential change for uid {:?}", user.uid());
        let uses_network = self.can_use_network();
        self.state
            .lock()
            .unwrap()
            .offline_causes
            .insert(OfflineCause::CredentialChange);
        self.disable_network_internal().await;
        if uses_network {
            self.online_state_tracker.set(OnlineState::Unknown).await;
        }
        self.syncer.handle_credential_change(user).await?;
        self.state
            .lock()
            .unwrap()
            .offline_causes
            .remove(&OfflineCause::CredentialChange);
        self.enable_network_internal().await
    }

    fn should_start_watch_stream(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.offline_causes.is_empty()
            && !state.listen_targets.is_empty()
            && !self.listen_stream.is_started()
    }

    async fn start_watch_stream(&self) {
        {
            let provider = Arc::new(StoreMetadataProvider {
                syncer: Arc::clone(&self.syncer),
                store: self.weak_self.clone(),
            });
            *self.aggregator.lock().unwrap() = Some(WatchChangeAggregator::new(provider));
        }
        self.listen_stream.start();
        self.online_state_tracker.handle_watch_stream_start().await;
    }

    fn clean_up_watch_stream_state(&self) {
        *self.aggregator.lock().unwrap() = None;
    }

    async fn send_watch_request(&self, target_data: &TargetData) -> SyncResult<()> {
        if let Some(aggregator) = self.aggregator.lock().unwrap().as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        self.listen_stream.watch(target_data).await
    }

    async fn send_unwatch_request(&self, target_id: TargetId) -> SyncResult<()> {
        if let Some(aggregator) = self.aggregator.lock().unwrap().as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.listen_stream.unwatch(target_id).await
    }

    /// The backend removed targets with an error; their listens are dead.
    async fn handle_target_error(&self, change: &WatchTargetChange) -> SyncResult<()> {
        let error = change
            .cause
            .clone()
            .unwrap_or_else(|| internal_error("Target removal without a cause"));
        for target_id in &change.target_ids {
            let tracked = {
                let mut state = self.state.lock().unwrap();
                state.listen_targets.remove(target_id).is_some()
            };
            // Targets the user already unlistened need no rejection.
            if tracked {
                self.syncer.reject_listen(*target_id, error.clone()).await?;
                if let Some(aggregator) = self.aggregator.lock().unwrap().as_mut() {
                    aggregator.remove_target(*target_id);
                }
            }
        }
        Ok(())
    }

    /// Turns the aggregator's accumulated changes into one remote event:
    /// updates resume tokens, re-listens mismatched targets without their
    /// stale tokens, and hands the event to the syncer.
    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> SyncResult<()> {
        let event = {
            let mut aggregator_slot = self.aggregator.lock().unwrap();
            let Some(aggregator) = aggregator_slot.as_mut() else {
                return Ok(());
            };
            aggregator.create_remote_event(snapshot_version)
        };

        {
            let mut state = self.state.lock().unwrap();
            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = state.listen_targets.get(target_id) {
                    let updated = target_data
                        .clone()
                        .with_resume_token(change.resume_token.clone(), snapshot_version);
                    state.listen_targets.insert(*target_id, updated);
                }
            }
        }

        let mismatches: Vec<(TargetId, _)> = event
            .target_mismatches
            .iter()
            .map(|(target_id, purpose)| (*target_id, *purpose))
            .collect();
        for (target_id, purpose) in mismatches {
            let request_target = {
                let mut state = self.state.lock().unwrap();
                let Some(target_data) = state.listen_targets.get(&target_id).cloned() else {
                    // Unlistened while the snapshot was in flight.
                    continue;
                };
                let cleared = target_data.clone().with_resume_token(
                    BytesValue::new(Vec::new()),
                    target_data.snapshot_version,
                );
                state.listen_targets.insert(target_id, cleared);
                TargetData::new(
                    target_data.target,
                    target_id,
                    purpose,
                    target_data.sequence_number,
                )
            };
            self.send_unwatch_request(target_id).await?;
            self.send_watch_request(&request_target).await?;
        }

        self.syncer.apply_remote_event(event).await
    }

    fn should_start_write_stream(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.offline_causes.is_empty()
            && !state.write_pipeline.is_empty()
            && !self.write_stream.is_started()
    }

    async fn fill_write_pipeline(&self) -> SyncResult<()> {
        loop {
            let (can_add, last_batch_id) = {
                let state = self.state.lock().unwrap();
                (
                    state.offline_causes.is_empty()
                        && state.write_pipeline.len() < MAX_PENDING_WRITES,
                    state
                        .write_pipeline
                        .back()
                        .map(|batch| batch.batch_id)
                        .unwrap_or(BATCH_ID_UNKNOWN),
                )
            };
            if !can_add {
                break;
            }
            match self.syncer.next_mutation_batch(last_batch_id).await? {
                Some(batch) => {
                    self.state
                        .lock()
                        .unwrap()
                        .write_pipeline
                        .push_back(batch.clone());
                    if self.write_stream.is_open() && self.write_stream.handshake_complete() {
                        self.write_stream.write_mutations(&batch.mutations).await?;
                    }
                }
                None => {
                    if self.state.lock().unwrap().write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }
        if self.should_start_write_stream() {
            self.write_stream.start();
        }
        Ok(())
    }

    /// A write stream failure after the handshake concerns the oldest
    /// in-flight batch. Permanent errors reject that batch; transient ones
    /// leave it queued for the reconnect.
    async fn handle_write_error(&self, error: &SyncError) -> SyncResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        let Some(batch) = self.state.lock().unwrap().write_pipeline.pop_front() else {
            return Ok(());
        };
        // The error was specific to the batch, not the connection.
        self.write_stream.inhibit_backoff();
        self.syncer
            .reject_failed_write(batch.batch_id, error.clone())
            .await?;
        self.fill_write_pipeline().await
    }
}

#[async_trait]
impl WatchStreamCallbacks for RemoteStoreInner {
    async fn on_watch_stream_open(&self) -> SyncResult<()> {
        let targets: Vec<TargetData> = self
            .state
            .lock()
            .unwrap()
            .listen_targets
            .values()
            .cloned()
            .collect();
        for target_data in targets {
            self.send_watch_request(&target_data).await?;
        }
        Ok(())
    }

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> SyncResult<()> {
        // Receiving anything proves we are online.
        self.online_state_tracker.set(OnlineState::Online).await;

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed
                && target_change.cause.is_some()
            {
                return self.handle_target_error(target_change).await;
            }
        }

        {
            let mut aggregator_slot = self.aggregator.lock().unwrap();
            let Some(aggregator) = aggregator_slot.as_mut() else {
                return Ok(());
            };
            match &change {
                WatchChange::Document(document_change) => {
                    aggregator.handle_document_change(document_change);
                }
                WatchChange::TargetChange(target_change) => {
                    aggregator.handle_target_change(target_change);
                }
                WatchChange::ExistenceFilter(filter_change) => {
                    aggregator.handle_existence_filter(filter_change);
                }
            }
        }

        if !snapshot_version.is_min() {
            let last_remote = self.syncer.get_last_remote_snapshot_version().await?;
            // Never raise a snapshot that would move the local store backward.
            if snapshot_version >= last_remote {
                self.raise_watch_snapshot(snapshot_version).await?;
            }
        }
        Ok(())
    }

    async fn on_watch_stream_close(&self, error: Option<SyncError>) {
        self.clean_up_watch_stream_state();
        if self.should_start_watch_stream() {
            let error = error.unwrap_or_else(|| unavailable("Watch stream closed"));
            self.online_state_tracker
                .handle_watch_stream_failure(&error)
                .await;
            self.start_watch_stream().await;
        } else {
            // No targets remain, so the stream's absence is not a failure.
            self.online_state_tracker.set(OnlineState::Unknown).await;
        }
    }
}

#[async_trait]
impl WriteStreamCallbacks for RemoteStoreInner {
    async fn on_write_stream_open(&self) -> SyncResult<()> {
        self.write_stream.write_handshake().await
    }

    async fn on_write_handshake_complete(&self) -> SyncResult<()> {
        let batches: Vec<MutationBatch> = self
            .state
            .lock()
            .unwrap()
            .write_pipeline
            .iter()
            .cloned()
            .collect();
        // Everything unacknowledged goes out again, oldest first.
        for batch in batches {
            self.write_stream.write_mutations(&batch.mutations).await?;
        }
        Ok(())
    }

    async fn on_write_response(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> SyncResult<()> {
        let batch = self
            .state
            .lock()
            .unwrap()
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("Write response without a pending batch"))?;
        let stream_token = self.write_stream.last_stream_token();
        let result = MutationBatchResult::from(batch, commit_version, results, Some(stream_token));
        self.syncer.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(&self, error: Option<SyncError>) {
        if let Some(error) = &error {
            // Failures before the handshake concern the connection, not a
            // batch; backoff alone handles those.
            if self.write_stream.handshake_complete() {
                if let Err(err) = self.handle_write_error(error).await {
                    log::warn!("Failed to handle write stream error: {err}");
                }
            }
        }
        if self.should_start_write_stream() {
            self.write_stream.start();
        }
    }
}
