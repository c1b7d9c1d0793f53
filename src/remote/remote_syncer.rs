use async_trait::async_trait;

use crate::api::User;
use crate::error::{SyncError, SyncResult};
use crate::model::{BatchId, DocumentKeySet, SnapshotVersion, TargetId};
use crate::mutation::{MutationBatch, MutationBatchResult};
use crate::remote::remote_event::RemoteEvent;

/// The sync engine surface the remote store drives, plus the two local-store
/// reads it needs. Everything runs on the worker queue; implementations call
/// back into the remote store directly rather than re-enqueueing.
#[async_trait]
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies one consistent backend snapshot.
    async fn apply_remote_event(&self, remote_event: RemoteEvent) -> SyncResult<()>;

    /// The backend rejected a target; the listen is permanently broken.
    async fn reject_listen(&self, target_id: TargetId, error: SyncError) -> SyncResult<()>;

    /// The oldest in-flight batch was committed.
    async fn apply_successful_write(&self, result: MutationBatchResult) -> SyncResult<()>;

    /// The oldest in-flight batch was rejected with a permanent error.
    async fn reject_failed_write(&self, batch_id: BatchId, error: SyncError) -> SyncResult<()>;

    /// Keys the given target matched as of the last raised snapshot.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// The active user changed; pending state must be rebound before streams
    /// restart with the new credentials.
    async fn handle_credential_change(&self, user: User) -> SyncResult<()>;

    /// The next batch after `after_batch_id` still waiting to be sent, if any.
    async fn next_mutation_batch(
        &self,
        after_batch_id: BatchId,
    ) -> SyncResult<Option<MutationBatch>>;

    /// Version of the last snapshot the local store has fully applied.
    async fn get_last_remote_snapshot_version(&self) -> SyncResult<SnapshotVersion>;
}
