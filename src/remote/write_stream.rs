use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;

use crate::api::CredentialsProviderArc;
use crate::error::{internal_error, invalid_argument, SyncError, SyncResult};
use crate::model::SnapshotVersion;
use crate::mutation::{Mutation, MutationResult};
use crate::remote::datastore::{DatastoreArc, StreamHandle};
use crate::remote::persistent_stream::{PersistentStream, StreamSpecifics};
use crate::util::async_queue::{AsyncQueue, TimerId};
use crate::value::BytesValue;

/// Queue-side consumer of write stream events.
#[async_trait]
pub(crate) trait WriteStreamCallbacks: Send + Sync + 'static {
    /// The stream (re)connected; the handshake must be sent before any
    /// mutations.
    async fn on_write_stream_open(&self) -> SyncResult<()>;

    /// The handshake response arrived; queued mutations may now be sent.
    async fn on_write_handshake_complete(&self) -> SyncResult<()>;

    /// The backend committed the oldest in-flight batch.
    async fn on_write_response(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> SyncResult<()>;

    async fn on_write_stream_close(&self, error: Option<SyncError>);
}

struct WriteSharedState {
    handshake_complete: bool,
    /// Token from the most recent response, echoed on every subsequent
    /// request so the backend can order them. Scoped to one connection.
    last_stream_token: BytesValue,
}

pub(crate) struct WriteSpecifics {
    datastore: DatastoreArc,
    callbacks: Weak<dyn WriteStreamCallbacks>,
    shared: StdMutex<WriteSharedState>,
}

#[async_trait]
impl StreamSpecifics for WriteSpecifics {
    fn label(&self) -> &'static str {
        "Write"
    }

    fn backoff_timer_id(&self) -> TimerId {
        TimerId::WriteStreamConnectionBackoff
    }

    fn idle_timer_id(&self) -> TimerId {
        TimerId::WriteStreamIdle
    }

    async fn open_rpc(&self, auth_token: Option<String>) -> SyncResult<Arc<dyn StreamHandle>> {
        self.datastore.open_write_stream(auth_token).await
    }

    async fn on_open(&self, _stream: &PersistentStream<Self>) -> SyncResult<()> {
        match self.callbacks.upgrade() {
            Some(callbacks) => callbacks.on_write_stream_open().await,
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
            .map_err(|err| invalid_argument(format!("Failed to parse write response: {err}")))?;
        let decoded = self.datastore.serializer().decode_write_response(&response)?;

        let first_response = {
            let mut shared = self.shared.lock().unwrap();
            shared.last_stream_token = decoded.stream_token;
            if shared.handshake_complete {
                false
            } else {
                shared.handshake_complete = true;
                true
            }
        };

        if first_response {
            callbacks.on_write_handshake_complete().await
        } else {
            let commit_version = decoded.commit_version.ok_or_else(|| {
                invalid_argument("Write response is missing a commit version")
            })?;
            callbacks.on_write_response(commit_version, decoded.results).await
        }
    }

    async fn on_close(&self, error: Option<SyncError>) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            callbacks.on_write_stream_close(error).await;
        }
    }
}

/// The Write half of the backend connection. Every connection starts with a
/// handshake exchange; only then do mutation batches flow, each next request
/// echoing the stream token from the previous response.
#[derive(Clone)]
pub(crate) struct WriteStream {
    stream: PersistentStream<WriteSpecifics>,
}

impl WriteStream {
    pub fn new(
        queue: AsyncQueue,
        credentials: CredentialsProviderArc,
        datastore: DatastoreArc,
        callbacks: Weak<dyn WriteStreamCallbacks>,
    ) -> Self {
        Self {
            stream: PersistentStream::new(
                queue,
                credentials,
                WriteSpecifics {
                    datastore,
                    callbacks,
                    shared: StdMutex::new(WriteSharedState {
                        handshake_complete: false,
                        last_stream_token: BytesValue::new(Vec::new()),
                    }),
                },
            ),
        }
    }

    pub fn start(&self) {
        {
            let mut shared = self.stream.specifics().shared.lock().unwrap();
            shared.handshake_complete = false;
            shared.last_stream_token = BytesValue::new(Vec::new());
        }
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

    pub fn handshake_complete(&self) -> bool {
        self.stream.specifics().shared.lock().unwrap().handshake_complete
    }

    pub fn last_stream_token(&self) -> BytesValue {
        self.stream
            .specifics()
            .shared
            .lock()
            .unwrap()
            .last_stream_token
            .clone()
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    /// Opens the session on a freshly connected stream.
    pub async fn write_handshake(&self) -> SyncResult<()> {
        if self.handshake_complete() {
            return Err(internal_error("Write handshake already complete"));
        }
        let request = self
            .stream
            .specifics()
            .datastore
            .serializer()
            .encode_write_handshake();
        self.stream.send_json(request).await
    }

    /// Sends one batch of mutations. The handshake must have completed.
    pub async fn write_mutations(&self, mutations: &[Mutation]) -> SyncResult<()> {
        let token = {
            let shared = self.stream.specifics().shared.lock().unwrap();
            if !shared.handshake_complete {
                return Err(internal_error("Write handshake is not complete"));
            }
            shared.last_stream_token.clone()
        };
        let request = self
            .stream
            .specifics()
            .datastore
            .serializer()
            .encode_write_request(&token, mutations);
        self.stream.send_json(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::api::EmptyCredentialsProvider;
    use crate::model::{DatabaseId, DocumentKey};
    use crate::remote::connection::{FrameKind, InMemoryTransport, StreamTransport, TransportFrame};
    use crate::remote::datastore::ConnectionDatastore;
    use crate::remote::serializer::JsonProtoSerializer;
    use crate::runtime;
    use crate::value::MapValue;

    #[derive(Default)]
    struct RecordingCallbacks {
        opens: AtomicUsize,
        handshakes: AtomicUsize,
        responses: StdMutex<Vec<(SnapshotVersion, Vec<MutationResult>)>>,
        closes: StdMutex<Vec<Option<SyncError>>>,
    }

    #[async_trait]
    impl WriteStreamCallbacks for RecordingCallbacks {
        async fn on_write_stream_open(&self) -> SyncResult<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_write_handshake_complete(&self) -> SyncResult<()> {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_write_response(
            &self,
            commit_version: SnapshotVersion,
            results: Vec<MutationResult>,
        ) -> SyncResult<()> {
            self.responses.lock().unwrap().push((commit_version, results));
            Ok(())
        }

        async fn on_write_stream_close(&self, error: Option<SyncError>) {
            self.closes.lock().unwrap().push(error);
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        stream: WriteStream,
        server: Arc<InMemoryTransport>,
        recorder: Arc<RecordingCallbacks>,
        _callbacks: Arc<dyn WriteStreamCallbacks>,
    }

    fn fixture() -> Fixture {
        let queue = AsyncQueue::new();
        let (client, server) = InMemoryTransport::pair();
        let datastore: DatastoreArc = Arc::new(ConnectionDatastore::new(
            client,
            JsonProtoSerializer::new(DatabaseId::new("p", "(default)")),
        ));
        let recorder = Arc::new(RecordingCallbacks::default());
        let callbacks: Arc<dyn WriteStreamCallbacks> = Arc::clone(&recorder) as _;
        let stream = WriteStream::new(
            queue.clone(),
            Arc::new(EmptyCredentialsProvider),
            datastore,
            Arc::downgrade(&callbacks),
        );
        Fixture {
            queue,
            stream,
            server,
            recorder,
            _callbacks: callbacks,
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

    async fn open_stream(fixture: &Fixture) -> TransportFrame {
        let queue = fixture.queue.clone();
        let stream = fixture.stream.clone();
        queue
            .enqueue(async move {
                stream.start();
                Ok(())
            })
            .await
            .unwrap();
        let open = fixture.server.next().await.unwrap();
        assert!(matches!(open.kind(), FrameKind::Open { .. }));
        wait_until(|| fixture.stream.is_open()).await;
        open
    }

    async fn complete_handshake(fixture: &Fixture, open: &TransportFrame) {
        let handshaking = fixture.stream.clone();
        fixture
            .queue
            .enqueue(async move { handshaking.write_handshake().await })
            .await
            .unwrap();
        let frame = fixture.server.next().await.unwrap();
        let FrameKind::Data(payload) = frame.into_kind() else {
            panic!("expected handshake frame");
        };
        let request: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert!(request.get("writes").is_none());

        let response = serde_json::json!({ "streamToken": "dG9rZW4tMQ==" });
        fixture
            .server
            .send(TransportFrame::data(
                open.stream_id(),
                serde_json::to_vec(&response).unwrap(),
            ))
            .await
            .unwrap();
        wait_until(|| fixture.stream.handshake_complete()).await;
    }

    #[tokio::test]
    async fn handshake_must_precede_mutations() {
        let fixture = fixture();
        open_stream(&fixture).await;
        assert_eq!(fixture.recorder.opens.load(Ordering::SeqCst), 1);

        let mutation = Mutation::set(
            DocumentKey::from_string("rooms/eros").unwrap(),
            MapValue::empty(),
        );
        let premature = fixture.stream.clone();
        let error = fixture
            .queue
            .enqueue(async move { premature.write_mutations(&[mutation]).await })
            .await
            .unwrap_err();
        assert_eq!(error.code, crate::error::SyncErrorCode::Internal);
    }

    #[tokio::test]
    async fn mutations_echo_the_last_stream_token() {
        let fixture = fixture();
        let open = open_stream(&fixture).await;
        complete_handshake(&fixture, &open).await;
        assert_eq!(fixture.recorder.handshakes.load(Ordering::SeqCst), 1);

        let mutation = Mutation::set(
            DocumentKey::from_string("rooms/eros").unwrap(),
            MapValue::empty(),
        );
        let writing = fixture.stream.clone();
        fixture
            .queue
            .enqueue(async move { writing.write_mutations(&[mutation]).await })
            .await
            .unwrap();
        let frame = fixture.server.next().await.unwrap();
        let FrameKind::Data(payload) = frame.into_kind() else {
            panic!("expected write frame");
        };
        let request: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(request["streamToken"], "dG9rZW4tMQ==");
        assert_eq!(request["writes"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn write_responses_surface_with_commit_version() {
        let fixture = fixture();
        let open = open_stream(&fixture).await;
        complete_handshake(&fixture, &open).await;

        let response = serde_json::json!({
            "streamToken": "dG9rZW4tMg==",
            "commitTime": "1970-01-01T00:00:05Z",
            "writeResults": [{ "updateTime": "1970-01-01T00:00:05Z" }]
        });
        fixture
            .server
            .send(TransportFrame::data(
                open.stream_id(),
                serde_json::to_vec(&response).unwrap(),
            ))
            .await
            .unwrap();

        wait_until(|| !fixture.recorder.responses.lock().unwrap().is_empty()).await;
        let responses = fixture.recorder.responses.lock().unwrap();
        let (version, results) = &responses[0];
        assert_eq!(version.timestamp().seconds, 5);
        assert_eq!(results.len(), 1);
        assert!(fixture.recorder.closes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn restart_requires_a_fresh_handshake() {
        let fixture = fixture();
        let open = open_stream(&fixture).await;
        complete_handshake(&fixture, &open).await;

        let stopping = fixture.stream.clone();
        fixture
            .queue
            .enqueue(async move {
                stopping.stop().await;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(*fixture.recorder.closes.lock().unwrap(), vec![None]);

        let restarting = fixture.stream.clone();
        fixture
            .queue
            .enqueue(async move {
                restarting.start();
                Ok(())
            })
            .await
            .unwrap();
        assert!(!fixture.stream.handshake_complete());
    }
}
