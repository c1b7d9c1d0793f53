use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::api::credentials::{CredentialsProviderArc, User};
use crate::api::settings::ClientSettings;
use crate::api::snapshot::{DocumentSnapshot, QuerySnapshot, SnapshotMetadata};
use crate::core::{
    EventManager, ListenOptions, ListenerRegistration, Query, SyncEngine, View,
    ViewSnapshotHandler, WriteAck,
};
use crate::error::{cancelled, internal_error, SyncResult};
use crate::local::{LocalStore, LruGarbageCollector, LruScheduler, Persistence};
use crate::model::DocumentKey;
use crate::mutation::Mutation;
use crate::remote::DatastoreArc;
use crate::util::AsyncQueue;

/// Receives each snapshot a listened query produces, or the error that ended
/// the listen.
pub type QuerySnapshotHandler = Arc<dyn Fn(SyncResult<QuerySnapshot>) + Send + Sync>;

/// Resolves when the backend acknowledges or rejects a queued write batch.
/// The batch's effects are visible locally long before that.
pub struct WriteAcknowledgment {
    receiver: WriteAck,
}

impl WriteAcknowledgment {
    fn new(receiver: WriteAck) -> Self {
        Self { receiver }
    }
}

impl Future for WriteAcknowledgment {
    type Output = SyncResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(cancelled(
                "The write was abandoned before the backend acknowledged it",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The client facade: owns the serial queue and the component stack behind
/// it. Every method enqueues onto the queue, so callers can use the client
/// from any task without further coordination.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    settings: ClientSettings,
    queue: AsyncQueue,
    credentials: CredentialsProviderArc,
    local_store: Arc<LocalStore>,
    sync_engine: SyncEngine,
    event_manager: EventManager,
    gc_scheduler: Arc<LruScheduler>,
}

impl SyncClient {
    /// Builds and starts a client over the given collaborators: queue, local
    /// store, sync engine, event manager and GC scheduler, plus the
    /// credential listener that restarts streams on user changes.
    pub fn with_settings(
        settings: ClientSettings,
        credentials: CredentialsProviderArc,
        persistence: Persistence,
        datastore: DatastoreArc,
    ) -> Self {
        let queue = AsyncQueue::new();
        persistence.start();
        let initial_user = credentials.current_user();
        let local_store = Arc::new(LocalStore::new(persistence, initial_user.clone()));
        let sync_engine = SyncEngine::new(
            queue.clone(),
            Arc::clone(&local_store),
            datastore,
            Arc::clone(&credentials),
            initial_user,
        );
        let event_manager = EventManager::new(queue.clone(), sync_engine.clone());
        let collector = Arc::new(LruGarbageCollector::new(settings.lru_params));
        let gc_scheduler = LruScheduler::new(
            collector,
            Arc::clone(&local_store),
            queue.clone(),
            settings.gc_schedule,
        );
        gc_scheduler.start();

        let engine_for_user_changes = sync_engine.clone();
        let queue_for_user_changes = queue.clone();
        credentials.start(
            queue.clone(),
            Arc::new(move |user: User| {
                let engine = engine_for_user_changes.clone();
                // Swapping users runs persistence transactions; transient
                // storage contention must not drop the change.
                queue_for_user_changes.enqueue_retryable(move || {
                    let engine = engine.clone();
                    let user = user.clone();
                    Box::pin(async move { engine.handle_credential_change(user).await })
                });
            }),
        );
        log::debug!(
            "Client started for {} ({})",
            settings.database_info.database_id,
            settings.database_info.host
        );

        SyncClient {
            inner: Arc::new(ClientInner {
                settings,
                queue,
                credentials,
                local_store,
                sync_engine,
                event_manager,
                gc_scheduler,
            }),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// The client's serial executor, for ordering outside work relative to
    /// the client's own operations.
    pub fn queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    pub fn current_user(&self) -> User {
        self.inner.sync_engine.current_user()
    }

    /// Registers `handler` for live snapshots of `query`. The initial
    /// snapshot is delivered according to `options` before this returns.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        handler: QuerySnapshotHandler,
    ) -> SyncResult<ListenerRegistration> {
        let event_manager = self.inner.event_manager.clone();
        let view_handler: ViewSnapshotHandler = Arc::new(move |event| {
            handler(event.map(QuerySnapshot::from_view_snapshot));
        });
        self.inner
            .queue
            .enqueue(async move { event_manager.listen(query, options, view_handler).await })
            .await
    }

    /// Reads one document from the local cache, overlays applied.
    pub async fn read_document(&self, key: DocumentKey) -> SyncResult<DocumentSnapshot> {
        let local_store = Arc::clone(&self.inner.local_store);
        self.inner
            .queue
            .enqueue(async move {
                let document = local_store.read_document(key).await?;
                let metadata = SnapshotMetadata {
                    has_pending_writes: document.has_local_mutations(),
                    from_cache: true,
                };
                Ok(DocumentSnapshot::new(document, metadata))
            })
            .await
    }

    /// Runs `query` once against the local cache, overlays applied.
    pub async fn execute_query(&self, query: Query) -> SyncResult<QuerySnapshot> {
        let local_store = Arc::clone(&self.inner.local_store);
        self.inner
            .queue
            .enqueue(async move {
                let result = local_store.execute_query(query.clone(), true).await?;
                let mut view = View::new(query, result.remote_keys);
                let changes = view.compute_doc_changes(&result.documents, None);
                let view_change = view.apply_changes(changes, false, None, false);
                let snapshot = view_change.snapshot.ok_or_else(|| {
                    internal_error("View for a one-shot query produced no snapshot")
                })?;
                Ok(QuerySnapshot::from_view_snapshot(snapshot))
            })
            .await
    }

    /// Queues `mutations` as one atomic batch, immediately visible to reads
    /// and listeners.
    pub async fn write(&self, mutations: Vec<Mutation>) -> SyncResult<WriteAcknowledgment> {
        let sync_engine = self.inner.sync_engine.clone();
        let ack = self
            .inner
            .queue
            .enqueue(async move { sync_engine.write(mutations).await })
            .await?;
        Ok(WriteAcknowledgment::new(ack))
    }

    pub async fn enable_network(&self) -> SyncResult<()> {
        let sync_engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(async move { sync_engine.enable_network().await })
            .await
    }

    pub async fn disable_network(&self) -> SyncResult<()> {
        let sync_engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(async move { sync_engine.disable_network().await })
            .await
    }

    /// Resolves once every write accepted so far has been acknowledged or
    /// rejected.
    pub async fn wait_for_pending_writes(&self) -> SyncResult<()> {
        let sync_engine = self.inner.sync_engine.clone();
        let ack = self
            .inner
            .queue
            .enqueue(async move { sync_engine.register_pending_writes_callback().await })
            .await?;
        WriteAcknowledgment::new(ack).await
    }

    /// Stops streams, the GC scheduler and the queue. Operations submitted
    /// after this fail with `Cancelled`.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.inner.gc_scheduler.stop();
        self.inner.credentials.shutdown();
        let sync_engine = self.inner.sync_engine.clone();
        let result = self
            .inner
            .queue
            .enqueue(async move { sync_engine.shutdown().await })
            .await;
        self.inner.queue.enter_shutdown();
        result
    }
}
