use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use crate::core::sync_engine::{SyncEngine, SyncEngineEvents};
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::core::Query;
use crate::error::{SyncError, SyncResult};
use crate::remote::OnlineState;
use crate::util::AsyncQueue;

/// Receives each event a query listener raises, or the error that ended the
/// listen.
pub type ViewSnapshotHandler = Arc<dyn Fn(SyncResult<ViewSnapshot>) + Send + Sync>;

/// Per-listener delivery knobs.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListenOptions {
    /// Raise events when only metadata (pending-write or cache state) changed.
    pub include_metadata_changes: bool,
    /// Hold the first event back until the view is synced with the server,
    /// unless the client goes offline first.
    pub wait_for_sync_when_online: bool,
}

/// Decides, per listener, which raw view snapshots become events. Tracks the
/// held-back initial event and strips metadata-only changes the listener did
/// not ask for.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    handler: ViewSnapshotHandler,
    raised_initial_event: bool,
    online_state: OnlineState,
    snapshot: Option<ViewSnapshot>,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, handler: ViewSnapshotHandler) -> Self {
        Self {
            query,
            options,
            handler,
            raised_initial_event: false,
            online_state: OnlineState::Unknown,
            snapshot: None,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn handler(&self) -> ViewSnapshotHandler {
        Arc::clone(&self.handler)
    }

    /// Feeds the listener a new view snapshot. Returns the event to deliver,
    /// or `None` when the snapshot should stay invisible to this listener.
    pub fn on_view_snapshot(&mut self, mut snapshot: ViewSnapshot) -> Option<ViewSnapshot> {
        debug_assert!(
            !snapshot.doc_changes.is_empty() || snapshot.sync_state_changed,
            "received a snapshot with no changes"
        );
        if !self.options.include_metadata_changes {
            let doc_changes = snapshot
                .doc_changes
                .iter()
                .filter(|change| change.change_type != ChangeType::Metadata)
                .cloned()
                .collect();
            snapshot = ViewSnapshot {
                doc_changes,
                excludes_metadata_changes: true,
                ..snapshot
            };
        }
        let mut event = None;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot) {
                event = Some(self.raise_initial_event(&snapshot));
            }
        } else if self.should_raise_event(&snapshot) {
            event = Some(snapshot.clone());
        }
        self.snapshot = Some(snapshot);
        event
    }

    /// Tracks the connection state, releasing a held-back initial event when
    /// going offline means cached data is the best the listener will get.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> Option<ViewSnapshot> {
        self.online_state = online_state;
        if self.raised_initial_event {
            return None;
        }
        let snapshot = self.snapshot.clone()?;
        if self.should_raise_initial_event(&snapshot) {
            return Some(self.raise_initial_event(&snapshot));
        }
        None
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        // Unknown counts as online here: it resolves to Healthy or Offline
        // once the stream settles.
        let maybe_online = self.online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.documents.is_empty() || self.online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .map_or(false, |previous| {
                previous.has_pending_writes() != snapshot.has_pending_writes()
            });
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        // Every remaining change was metadata-only and got stripped above.
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) -> ViewSnapshot {
        self.raised_initial_event = true;
        ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
        )
    }
}

struct RegisteredListener {
    id: u64,
    listener: QueryListener,
}

#[derive(Default)]
struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<RegisteredListener>,
}

struct EventManagerState {
    /// Listener groups keyed by canonical query id.
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

/// Fans sync-engine output out to query listeners. The first listener on a
/// query starts the engine listen; the last one leaving stops it. Snapshots
/// are remembered per query so late listeners catch up immediately.
#[derive(Clone)]
pub struct EventManager {
    inner: Arc<EventManagerInner>,
}

struct EventManagerInner {
    queue: AsyncQueue,
    sync_engine: SyncEngine,
    state: StdMutex<EventManagerState>,
    listener_counter: AtomicU64,
}

/// A handler paired with the event it should receive, collected under the
/// state lock and fired after it is released.
type PendingEvent = (ViewSnapshotHandler, SyncResult<ViewSnapshot>);

impl EventManager {
    pub fn new(queue: AsyncQueue, sync_engine: SyncEngine) -> Self {
        let inner = Arc::new(EventManagerInner {
            queue,
            sync_engine: sync_engine.clone(),
            state: StdMutex::new(EventManagerState {
                queries: BTreeMap::new(),
                online_state: OnlineState::Unknown,
            }),
            listener_counter: AtomicU64::new(0),
        });
        sync_engine.set_event_sink(Arc::downgrade(&inner) as Weak<dyn SyncEngineEvents>);
        EventManager { inner }
    }

    /// Registers a listener for `query`, starting the underlying engine
    /// listen if this is the query's first. The listener's initial event is
    /// delivered before this returns whenever its options allow raising one.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        handler: ViewSnapshotHandler,
    ) -> SyncResult<ListenerRegistration> {
        let canonical_id = query.canonical_id();
        let first_listen = {
            let state = self.inner.state.lock().unwrap();
            !state.queries.contains_key(&canonical_id)
        };
        let initial_snapshot = if first_listen {
            Some(self.inner.sync_engine.listen(query.clone()).await?)
        } else {
            None
        };

        let id = self.inner.listener_counter.fetch_add(1, Ordering::SeqCst);
        let mut listener = QueryListener::new(query.clone(), options, handler);
        let mut events: Vec<PendingEvent> = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            let online_state = state.online_state;
            let info = state.queries.entry(canonical_id).or_default();
            if let Some(snapshot) = initial_snapshot {
                info.view_snapshot = Some(snapshot);
            }
            // No snapshot has reached the listener yet, so this only seeds
            // its connection state and cannot raise.
            let _ = listener.apply_online_state_change(online_state);
            if let Some(snapshot) = info.view_snapshot.clone() {
                if let Some(event) = listener.on_view_snapshot(snapshot) {
                    events.push((listener.handler(), Ok(event)));
                }
            }
            info.listeners.push(RegisteredListener { id, listener });
        }
        for (handler, event) in events {
            handler(event);
        }
        Ok(ListenerRegistration::new(self.clone(), query, id))
    }

    /// Removes one listener; the engine listen ends with the last of them.
    pub async fn unlisten(&self, query: &Query, id: u64) -> SyncResult<()> {
        let canonical_id = query.canonical_id();
        let last_listen = {
            let mut state = self.inner.state.lock().unwrap();
            let emptied = match state.queries.get_mut(&canonical_id) {
                Some(info) => {
                    info.listeners.retain(|registered| registered.id != id);
                    info.listeners.is_empty()
                }
                None => false,
            };
            if emptied {
                state.queries.remove(&canonical_id);
            }
            emptied
        };
        if last_listen {
            self.inner.sync_engine.unlisten(query).await?;
        }
        Ok(())
    }
}

impl SyncEngineEvents for EventManagerInner {
    fn on_view_snapshots(&self, snapshots: Vec<ViewSnapshot>) {
        let mut events: Vec<PendingEvent> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for snapshot in snapshots {
                let canonical_id = snapshot.query.canonical_id();
                if let Some(info) = state.queries.get_mut(&canonical_id) {
                    for registered in &mut info.listeners {
                        if let Some(event) = registered.listener.on_view_snapshot(snapshot.clone())
                        {
                            events.push((registered.listener.handler(), Ok(event)));
                        }
                    }
                    info.view_snapshot = Some(snapshot);
                }
            }
        }
        for (handler, event) in events {
            handler(event);
        }
    }

    fn on_watch_error(&self, query: &Query, error: SyncError) {
        let handlers: Vec<ViewSnapshotHandler> = {
            let mut state = self.state.lock().unwrap();
            match state.queries.remove(&query.canonical_id()) {
                Some(info) => info
                    .listeners
                    .iter()
                    .map(|registered| registered.listener.handler())
                    .collect(),
                None => Vec::new(),
            }
        };
        for handler in handlers {
            handler(Err(error.clone()));
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let mut events: Vec<PendingEvent> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.online_state = online_state;
            for info in state.queries.values_mut() {
                for registered in &mut info.listeners {
                    if let Some(event) =
                        registered.listener.apply_online_state_change(online_state)
                    {
                        events.push((registered.listener.handler(), Ok(event)));
                    }
                }
            }
        }
        for (handler, event) in events {
            handler(event);
        }
    }
}

/// RAII-style listener registration; dropping the handle detaches the
/// underlying listener.
pub struct ListenerRegistration {
    event_manager: EventManager,
    query: Query,
    id: Option<u64>,
}

impl ListenerRegistration {
    fn new(event_manager: EventManager, query: Query, id: u64) -> Self {
        Self {
            event_manager,
            query,
            id: Some(id),
        }
    }

    pub fn remove(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(id) = self.id.take() {
            let event_manager = self.event_manager.clone();
            let query = self.query.clone();
            self.event_manager
                .inner
                .queue
                .enqueue_and_forget(async move {
                    if let Err(error) = event_manager.unlisten(&query, id).await {
                        log::warn!("Failed to remove query listener: {error}");
                    }
                });
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}
