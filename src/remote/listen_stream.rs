use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::api::CredentialsProviderArc;
use crate::error::{invalid_argument, SyncError, SyncResult};
use crate::local::TargetData;
use crate::model::{SnapshotVersion, TargetId};
use crate::remote::datastore::{DatastoreArc, StreamHandle};
use crate::remote::persistent_stream::{PersistentStream, StreamSpecifics};
use crate::remote::watch_change::{decode_snapshot_version, decode_watch_change, WatchChange};
use crate::util::async_queue::{AsyncQueue, TimerId};

/// Queue-side consumer of watch stream events.
#[async_trait]
pub(crate) trait WatchStreamCallbacks: Send + Sync + 'static {
    /// The stream (re)connected; active targets must be re-watched.
    async fn on_watch_stream_open(&self) -> SyncResult<()>;

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> SyncResult<()>;

    async fn on_watch_stream_close(&self, error: Option<SyncError>);
}

pub(crate) struct ListenSpecifics {
    datastore: DatastoreArc,
    callbacks: Weak<dyn WatchStreamCallbacks>,
}

#[async_trait]
impl StreamSpecifics for ListenSpecifics {
    fn label(&self) -> &'static str {
        "Listen"
    }

    fn backoff_timer_id(&self) -> TimerId {
        TimerId::ListenStreamConnectionBackoff
    }

    fn idle_timer_id(&self) -> TimerId {
        TimerId::ListenStreamIdle
    }

    async fn open_rpc(&self, auth_token: Option<String>) -> SyncResult<Arc<dyn StreamHandle>> {
        self.datastore.open_listen_stream(auth_token).await
    }

    async fn on_open(&self, _stream: &PersistentStream<Self>) -> SyncResult<()> {
        match self.callbacks.upgrade() {
            Some(callbacks) => callbacks.on_watch_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(
        &self,
        _stream: &PersistentStream<Self>,
        payload: Vec<u8>,
    ) -> SyncResult<()> {
        let Some(callbacks) = self.callbacks.upgrade() else {
            return Ok(());
        };
        let response: serde_json::Value = serde_json::from_slice(&payload)
            .map_err(|err| invalid_argument(format!("Failed to parse listen response: {err}")))?;
        let serializer = self.datastore.serializer();
        // Unknown response kinds decode to None and are skipped.
        let Some(change) = decode_watch_change(serializer, &response)? else {
            return Ok(());
        };
        let snapshot_version = decode_snapshot_version(serializer, &response)?;
        callbacks.on_watch_change(change, snapshot_version).await
    }

    async fn on_close(&self, error: Option<SyncError>) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            callbacks.on_watch_stream_close(error).await;
        }
    }
}

/// The Listen half of the backend connection. One stream carries every active
/// target; individual targets are added and removed with `watch`/`unwatch`
/// while the stream stays up.
#[derive(Clone)]
pub(crate) struct ListenStream {
    stream: PersistentStream<ListenSpecifics>,
}

impl ListenStream {
    pub fn new(
        queue: AsyncQueue,
        credentials: CredentialsProviderArc,
        datastore: DatastoreArc,
        callbacks: Weak<dyn WatchStreamCallbacks>,
    ) -> Self {
        Self {
            stream: PersistentStream::new(
                queue,
                credentials,
                ListenSpecifics {
                    datastore,
                    callbacks,
                },
            ),
        }
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub async fn stop(&self) {
        self.stream.stop().await;
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    /// Registers interest in a target.
    pub async fn watch(&self, target_data: &TargetData) -> SyncResult<()> {
        let request = self
            .stream
            .specifics()
            .datastore
            .serializer()
            .encode_listen_request(target_data);
        self.stream.send_json(request).await
    }

    /// Withdraws interest in a target.
    pub async fn unwatch(&self, target_id: TargetId) -> SyncResult<()> {
        let request = self
            .stream
            .specifics()
            .datastore
            .serializer()
            .encode_unlisten_request(target_id);
        self.stream.send_json(request).await
    }
}
