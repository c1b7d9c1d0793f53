use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::api::CredentialsProviderArc;
use crate::error::{internal_error, SyncError, SyncErrorCode, SyncResult};
use crate::remote::datastore::StreamHandle;
use crate::runtime;
use crate::util::async_queue::{AsyncQueue, DelayedTask, TimerId};
use crate::util::backoff::{ExponentialBackoff, RetrySettings};

/// How long a stream with no pending work stays open before it is torn down.
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle of a persistent stream.
///
/// `Error` is sticky: the next `start` goes through backoff instead of
/// connecting immediately. `Stopped` is a deliberate teardown and restarts
/// without delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamState {
    Initial,
    Starting,
    Open,
    Backoff,
    Error,
    Stopped,
}

/// The parts of a persistent stream that differ between Listen and Write:
/// which RPC to open, which timer slots to use, and what to do on open,
/// message, and close.
///
/// All callbacks run on the shared worker queue.
#[async_trait]
pub(crate) trait StreamSpecifics: Send + Sync + Sized + 'static {
    fn label(&self) -> &'static str;

    fn backoff_timer_id(&self) -> TimerId;

    fn idle_timer_id(&self) -> TimerId;

    async fn open_rpc(&self, auth_token: Option<String>) -> SyncResult<Arc<dyn StreamHandle>>;

    async fn on_open(&self, stream: &PersistentStream<Self>) -> SyncResult<()>;

    async fn on_message(&self, stream: &PersistentStream<Self>, payload: Vec<u8>)
        -> SyncResult<()>;

    async fn on_close(&self, error: Option<SyncError>);
}

struct MachineState {
    state: StreamState,
    /// Bumped on every close. Auth completions, read-loop events and timers
    /// carry the generation they were spawned under and are dropped when it
    /// no longer matches.
    generation: u64,
    backoff: ExponentialBackoff,
    rpc: Option<Arc<dyn StreamHandle>>,
    idle_timer: Option<DelayedTask>,
    backoff_timer: Option<DelayedTask>,
}

struct PersistentStreamInner<S> {
    queue: AsyncQueue,
    credentials: CredentialsProviderArc,
    specifics: S,
    machine: StdMutex<MachineState>,
}

/// A stream that auto-reconnects: token fetch, exponential backoff after
/// failures, an idle timeout, and generation tracking so events from a
/// previous connection cannot corrupt the current one.
///
/// State transitions happen only on the worker queue. The token fetch and the
/// read loop run detached and re-enter the queue with their results.
pub(crate) struct PersistentStream<S: StreamSpecifics> {
    inner: Arc<PersistentStreamInner<S>>,
}

impl<S: StreamSpecifics> Clone for PersistentStream<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum StartAction {
    Authenticate(u64),
    Backoff,
    Ignore,
}

impl<S: StreamSpecifics> PersistentStream<S> {
    pub fn new(queue: AsyncQueue, credentials: CredentialsProviderArc, specifics: S) -> Self {
        Self {
            inner: Arc::new(PersistentStreamInner {
                queue,
                credentials,
                specifics,
                machine: StdMutex::new(MachineState {
                    state: StreamState::Initial,
                    generation: 0,
                    backoff: ExponentialBackoff::new(RetrySettings::streaming_defaults()),
                    rpc: None,
                    idle_timer: None,
                    backoff_timer: None,
                }),
            }),
        }
    }

    pub fn specifics(&self) -> &S {
        &self.inner.specifics
    }

    /// Started covers every state with a connection attempt in flight or
    /// scheduled, not just an open RPC.
    pub fn is_started(&self) -> bool {
        let machine = self.inner.machine.lock().unwrap();
        matches!(
            machine.state,
            StreamState::Starting | StreamState::Open | StreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        let machine = self.inner.machine.lock().unwrap();
        machine.state == StreamState::Open
    }

    /// Begins connecting unless an attempt is already under way. After an
    /// error the connection waits out the backoff delay first.
    pub fn start(&self) {
        let action = {
            let mut machine = self.inner.machine.lock().unwrap();
            match machine.state {
                StreamState::Error => StartAction::Backoff,
                StreamState::Initial | StreamState::Stopped => {
                    machine.state = StreamState::Starting;
                    StartAction::Authenticate(machine.generation)
                }
                StreamState::Starting | StreamState::Open | StreamState::Backoff => {
                    StartAction::Ignore
                }
            }
        };
        match action {
            StartAction::Authenticate(generation) => self.spawn_auth(generation),
            StartAction::Backoff => self.perform_backoff(),
            StartAction::Ignore => {}
        }
    }

    /// Tears the stream down without the error path, so a later `start`
    /// reconnects immediately. No-op when the stream is not started.
    pub async fn stop(&self) {
        if self.is_started() {
            self.close(StreamState::Stopped, None).await;
        }
    }

    /// Clears a pending backoff so the next `start` connects immediately.
    /// Only meaningful while the stream is not running.
    pub fn inhibit_backoff(&self) {
        let mut machine = self.inner.machine.lock().unwrap();
        if matches!(
            machine.state,
            StreamState::Starting | StreamState::Open | StreamState::Backoff
        ) {
            return;
        }
        machine.state = StreamState::Initial;
        machine.backoff.reset();
    }

    /// Arms the idle timer. The stream closes back to `Initial` if nothing is
    /// sent before it fires; any send disarms it.
    pub fn mark_idle(&self) {
        let mut machine = self.inner.machine.lock().unwrap();
        if machine.state != StreamState::Open || machine.idle_timer.is_some() {
            return;
        }
        let generation = machine.generation;
        let stream = self.clone();
        let timer = self.inner.queue.enqueue_after_delay(
            self.inner.specifics.idle_timer_id(),
            IDLE_TIMEOUT,
            async move {
                stream.handle_idle_timeout(generation).await;
            },
        );
        machine.idle_timer = Some(timer);
    }

    /// Serializes and sends one request on the open RPC.
    pub async fn send_json(&self, message: JsonValue) -> SyncResult<()> {
        let rpc = {
            let mut machine = self.inner.machine.lock().unwrap();
            if let Some(timer) = machine.idle_timer.take() {
                timer.cancel();
            }
            if machine.state != StreamState::Open {
                return Err(internal_error(format!(
                    "{} stream is not open",
                    self.inner.specifics.label()
                )));
            }
            match &machine.rpc {
                Some(rpc) => Arc::clone(rpc),
                None => {
                    return Err(internal_error(format!(
                        "{} stream has no RPC",
                        self.inner.specifics.label()
                    )))
                }
            }
        };
        let payload = serde_json::to_vec(&message)
            .map_err(|err| internal_error(format!("Failed to encode request: {err}")))?;
        rpc.send(payload).await
    }

    fn spawn_auth(&self, generation: u64) {
        let stream = self.clone();
        runtime::spawn_detached(async move {
            let token = match stream.fetch_auth_token().await {
                Ok(token) => token,
                Err(err) => {
                    stream.enqueue_close(generation, Some(err));
                    return;
                }
            };
            match stream.inner.specifics.open_rpc(token).await {
                Ok(rpc) => {
                    let opened = stream.clone();
                    stream.inner.queue.enqueue_and_forget(async move {
                        opened.handle_stream_opened(generation, rpc).await;
                    });
                }
                Err(err) => stream.enqueue_close(generation, Some(err)),
            }
        });
    }

    /// Fetches a token for the connection attempt. A rejected cached token is
    /// refreshed and retried exactly once.
    async fn fetch_auth_token(&self) -> SyncResult<Option<String>> {
        match self.inner.credentials.get_token(false).await {
            Ok(token) => Ok(token),
            Err(err) if err.code == SyncErrorCode::Unauthenticated => {
                self.inner.credentials.invalidate_token();
                self.inner.credentials.get_token(true).await
            }
            Err(err) => Err(err),
        }
    }

    fn enqueue_close(&self, generation: u64, error: Option<SyncError>) {
        let stream = self.clone();
        self.inner.queue.enqueue_and_forget(async move {
            stream.handle_stream_close(generation, error).await;
        });
    }

    async fn handle_stream_opened(&self, generation: u64, rpc: Arc<dyn StreamHandle>) {
        {
            let mut machine = self.inner.machine.lock().unwrap();
            if machine.generation != generation || machine.state != StreamState::Starting {
                drop(machine);
                rpc.close();
                return;
            }
            machine.state = StreamState::Open;
            machine.rpc = Some(Arc::clone(&rpc));
        }
        log::debug!("{} stream opened", self.inner.specifics.label());
        self.spawn_read_loop(generation, rpc);
        if let Err(err) = self.inner.specifics.on_open(self).await {
            self.handle_stream_close(generation, Some(err)).await;
        }
    }

    fn spawn_read_loop(&self, generation: u64, rpc: Arc<dyn StreamHandle>) {
        let stream = self.clone();
        runtime::spawn_detached(async move {
            loop {
                match rpc.next().await {
                    Some(Ok(payload)) => {
                        let on_queue = stream.clone();
                        stream.inner.queue.enqueue_and_forget(async move {
                            on_queue.handle_stream_message(generation, payload).await;
                        });
                    }
                    Some(Err(err)) => {
                        stream.enqueue_close(generation, Some(err));
                        return;
                    }
                    None => {
                        stream.enqueue_close(generation, None);
                        return;
                    }
                }
            }
        });
    }

    async fn handle_stream_message(&self, generation: u64, payload: Vec<u8>) {
        let current = {
            let mut machine = self.inner.machine.lock().unwrap();
            if machine.generation == generation && machine.state == StreamState::Open {
                // Any response proves the connection is healthy.
                machine.backoff.reset();
                true
            } else {
                false
            }
        };
        if !current {
            return;
        }
        if let Err(err) = self.inner.specifics.on_message(self, payload).await {
            log::warn!(
                "{} stream failed to handle a response: {err}",
                self.inner.specifics.label()
            );
            self.handle_stream_close(generation, Some(err)).await;
        }
    }

    async fn handle_stream_close(&self, generation: u64, error: Option<SyncError>) {
        {
            let machine = self.inner.machine.lock().unwrap();
            if machine.generation != generation {
                return;
            }
        }
        self.close(StreamState::Error, error).await;
    }

    async fn handle_idle_timeout(&self, generation: u64) {
        let still_open = {
            let machine = self.inner.machine.lock().unwrap();
            machine.generation == generation && machine.state == StreamState::Open
        };
        if still_open {
            log::debug!(
                "{} stream idled out, closing",
                self.inner.specifics.label()
            );
            self.close(StreamState::Initial, None).await;
        }
    }

    /// Shared teardown. Cancels timers, adjusts the backoff according to the
    /// close cause, invalidates a rejected token, bumps the generation so
    /// stale events are ignored, and finally notifies the specifics.
    async fn close(&self, final_state: StreamState, error: Option<SyncError>) {
        let rpc = {
            let mut machine = self.inner.machine.lock().unwrap();
            if let Some(timer) = machine.idle_timer.take() {
                timer.cancel();
            }
            if let Some(timer) = machine.backoff_timer.take() {
                timer.cancel();
            }
            machine.generation += 1;

            if final_state != StreamState::Error {
                machine.backoff.reset();
            } else if let Some(err) = &error {
                if err.code == SyncErrorCode::ResourceExhausted {
                    log::warn!(
                        "{} stream is rate limited, using maximum backoff delay",
                        self.inner.specifics.label()
                    );
                    machine.backoff.reset();
                    machine.backoff.reset_to_max();
                }
            }

            machine.state = final_state;
            machine.rpc.take()
        };
        if let Some(rpc) = rpc {
            rpc.close();
        }
        if let Some(err) = &error {
            if err.code == SyncErrorCode::Unauthenticated {
                self.inner.credentials.invalidate_token();
            }
            log::debug!(
                "{} stream closed: {err}",
                self.inner.specifics.label()
            );
        }
        self.inner.specifics.on_close(error).await;
    }

    fn perform_backoff(&self) {
        let mut machine = self.inner.machine.lock().unwrap();
        if machine.state != StreamState::Error {
            return;
        }
        machine.state = StreamState::Backoff;
        let Some(delay) = machine.backoff.next_delay() else {
            // Streaming settings retry without an attempt cap, so this only
            // triggers with custom settings.
            log::warn!(
                "{} stream is out of retry attempts",
                self.inner.specifics.label()
            );
            machine.state = StreamState::Error;
            return;
        };
        log::debug!(
            "{} stream backing off for {delay:?}",
            self.inner.specifics.label()
        );
        let stream = self.clone();
        let timer = self.inner.queue.enqueue_after_delay(
            self.inner.specifics.backoff_timer_id(),
            delay,
            async move {
                stream.resume_after_backoff().await;
            },
        );
        machine.backoff_timer = Some(timer);
    }

    async fn resume_after_backoff(&self) {
        {
            let mut machine = self.inner.machine.lock().unwrap();
            if machine.state != StreamState::Backoff {
                return;
            }
            machine.backoff_timer = None;
            machine.state = StreamState::Initial;
        }
        self.start();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::api::{CredentialsProvider, User, UserChangeListener};
    use crate::error::{unauthenticated, unavailable};

    struct ScriptedRpc {
        to_stream: async_channel::Receiver<SyncResult<Vec<u8>>>,
        sent: StdMutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    fn scripted_rpc() -> (Arc<ScriptedRpc>, async_channel::Sender<SyncResult<Vec<u8>>>) {
        let (sender, receiver) = async_channel::unbounded();
        let rpc = Arc::new(ScriptedRpc {
            to_stream: receiver,
            sent: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        (rpc, sender)
    }

    #[async_trait]
    impl StreamHandle for ScriptedRpc {
        async fn send(&self, payload: Vec<u8>) -> SyncResult<()> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }

        async fn next(&self) -> Option<SyncResult<Vec<u8>>> {
            self.to_stream.recv().await.ok()
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.to_stream.close();
        }
    }

    #[derive(Default)]
    struct Events {
        tokens: StdMutex<Vec<Option<String>>>,
        opens: AtomicUsize,
        closes: StdMutex<Vec<Option<SyncError>>>,
    }

    struct TestSpecifics {
        events: Arc<Events>,
        rpc_supply: StdMutex<VecDeque<SyncResult<Arc<ScriptedRpc>>>>,
    }

    #[async_trait]
    impl StreamSpecifics for TestSpecifics {
        fn label(&self) -> &'static str {
            "Test"
        }

        fn backoff_timer_id(&self) -> TimerId {
            TimerId::ListenStreamConnectionBackoff
        }

        fn idle_timer_id(&self) -> TimerId {
            TimerId::ListenStreamIdle
        }

        async fn open_rpc(
            &self,
            auth_token: Option<String>,
        ) -> SyncResult<Arc<dyn StreamHandle>> {
            self.events.tokens.lock().unwrap().push(auth_token);
            let next = self
                .rpc_supply
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(unavailable("no rpc scripted")));
            next.map(|rpc| rpc as Arc<dyn StreamHandle>)
        }

        async fn on_open(&self, _stream: &PersistentStream<Self>) -> SyncResult<()> {
            self.events.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_message(
            &self,
            _stream: &PersistentStream<Self>,
            _payload: Vec<u8>,
        ) -> SyncResult<()> {
            Ok(())
        }

        async fn on_close(&self, error: Option<SyncError>) {
            self.events.closes.lock().unwrap().push(error);
        }
    }

    /// Fails the first plain token fetch; succeeds once refreshed.
    #[derive(Default)]
    struct ExpiringTokenProvider {
        calls: StdMutex<Vec<bool>>,
    }

    #[async_trait]
    impl CredentialsProvider for ExpiringTokenProvider {
        async fn get_token(&self, force_refresh: bool) -> SyncResult<Option<String>> {
            self.calls.lock().unwrap().push(force_refresh);
            if force_refresh {
                Ok(Some("fresh-token".to_string()))
            } else {
                Err(unauthenticated("token expired"))
            }
        }

        fn invalidate_token(&self) {}

        fn current_user(&self) -> User {
            User::unauthenticated()
        }

        fn start(&self, _queue: AsyncQueue, _on_user_change: UserChangeListener) {}

        fn shutdown(&self) {}
    }

    fn stream_under_test(
        queue: &AsyncQueue,
        credentials: CredentialsProviderArc,
        rpcs: Vec<SyncResult<Arc<ScriptedRpc>>>,
    ) -> (PersistentStream<TestSpecifics>, Arc<Events>) {
        let events = Arc::new(Events::default());
        let specifics = TestSpecifics {
            events: Arc::clone(&events),
            rpc_supply: StdMutex::new(rpcs.into_iter().collect()),
        };
        (
            PersistentStream::new(queue.clone(), credentials, specifics),
            events,
        )
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

    #[tokio::test]
    async fn rejected_token_is_refreshed_once() {
        let queue = AsyncQueue::new();
        let credentials = Arc::new(ExpiringTokenProvider::default());
        let (rpc, _script) = scripted_rpc();
        let (stream, events) =
            stream_under_test(&queue, Arc::clone(&credentials) as _, vec![Ok(rpc)]);

        let started = stream.clone();
        queue
            .enqueue(async move {
                started.start();
                Ok(())
            })
            .await
            .unwrap();
        wait_until(|| stream.is_open()).await;

        assert_eq!(*credentials.calls.lock().unwrap(), vec![false, true]);
        assert_eq!(
            *events.tokens.lock().unwrap(),
            vec![Some("fresh-token".to_string())]
        );
        assert_eq!(events.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_attempt_backs_off_before_reconnecting() {
        let queue = AsyncQueue::new();
        let (rpc, _script) = scripted_rpc();
        let (stream, events) = stream_under_test(
            &queue,
            Arc::new(crate::api::EmptyCredentialsProvider),
            vec![Err(unavailable("connection refused")), Ok(rpc)],
        );

        let started = stream.clone();
        queue
            .enqueue(async move {
                started.start();
                Ok(())
            })
            .await
            .unwrap();
        wait_until(|| !events.closes.lock().unwrap().is_empty()).await;
        queue.drain().await;
        assert!(!stream.is_started());

        let restarted = stream.clone();
        queue
            .enqueue(async move {
                restarted.start();
                Ok(())
            })
            .await
            .unwrap();
        assert!(stream.is_started());
        assert!(!stream.is_open());

        queue.run_delayed_tasks_early(TimerId::ListenStreamConnectionBackoff);
        queue.drain().await;
        wait_until(|| stream.is_open()).await;
        assert_eq!(events.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_timeout_closes_an_open_stream() {
        let queue = AsyncQueue::new();
        let (rpc, _script) = scripted_rpc();
        let closed_flag = Arc::clone(&rpc);
        let (stream, events) = stream_under_test(
            &queue,
            Arc::new(crate::api::EmptyCredentialsProvider),
            vec![Ok(rpc)],
        );

        let started = stream.clone();
        queue
            .enqueue(async move {
                started.start();
                Ok(())
            })
            .await
            .unwrap();
        wait_until(|| stream.is_open()).await;

        let idled = stream.clone();
        queue
            .enqueue(async move {
                idled.mark_idle();
                Ok(())
            })
            .await
            .unwrap();
        queue.run_delayed_tasks_early(TimerId::ListenStreamIdle);
        queue.drain().await;

        assert!(!stream.is_open());
        assert!(!stream.is_started());
        assert!(closed_flag.closed.load(Ordering::SeqCst));
        assert_eq!(*events.closes.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn sending_disarms_the_idle_timer() {
        let queue = AsyncQueue::new();
        let (rpc, _script) = scripted_rpc();
        let sent_log = Arc::clone(&rpc);
        let (stream, _events) = stream_under_test(
            &queue,
            Arc::new(crate::api::EmptyCredentialsProvider),
            vec![Ok(rpc)],
        );

        let started = stream.clone();
        queue
            .enqueue(async move {
                started.start();
                Ok(())
            })
            .await
            .unwrap();
        wait_until(|| stream.is_open()).await;

        let active = stream.clone();
        queue
            .enqueue(async move {
                active.mark_idle();
                active
                    .send_json(serde_json::json!({ "database": "projects/p/databases/d" }))
                    .await
            })
            .await
            .unwrap();
        queue.run_delayed_tasks_early(TimerId::ListenStreamIdle);
        queue.drain().await;

        assert!(stream.is_open());
        assert_eq!(sent_log.sent.lock().unwrap().len(), 1);
    }
}
