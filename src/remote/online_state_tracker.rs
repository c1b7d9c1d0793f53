use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::SyncError;
use crate::util::async_queue::{AsyncQueue, DelayedTask, TimerId};

/// Watch stream failures tolerated before the client reports itself offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// How long a freshly started watch stream may stay silent before the client
/// reports itself offline.
const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// The client's view of its connection to the backend, as reflected in
/// snapshot metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// No recent evidence either way; typical at startup and right after a
    /// stream failure.
    Unknown,
    Online,
    Offline,
}

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) -> BoxFuture<'static, ()> + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedTask>,
    should_warn_client_is_offline: bool,
}

/// Derives [`OnlineState`] from watch stream activity and broadcasts changes.
///
/// The watch stream is the only signal used: write traffic succeeding while
/// the watch stream fails still counts as offline.
#[derive(Clone)]
pub struct OnlineStateTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    state: StdMutex<TrackerState>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, handler: OnlineStateHandler) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                queue,
                handler,
                state: StdMutex::new(TrackerState {
                    state: OnlineState::Unknown,
                    watch_stream_failures: 0,
                    online_state_timer: None,
                    should_warn_client_is_offline: true,
                }),
            }),
        }
    }

    /// Called when the watch stream starts connecting. Arms a timer so a
    /// backend that never answers still settles to offline.
    pub async fn handle_watch_stream_start(&self) {
        let arm_timer = {
            let state = self.inner.state.lock().unwrap();
            state.watch_stream_failures == 0
        };
        if !arm_timer {
            return;
        }

        self.clear_online_state_timer();
        self.set_and_broadcast(OnlineState::Unknown).await;

        let inner = Arc::clone(&self.inner);
        let timer = self.inner.queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            ONLINE_STATE_TIMEOUT,
            async move {
                inner.state.lock().unwrap().online_state_timer = None;
                inner.log_offline_warning("Backend did not respond within 10 seconds.");
                let tracker = OnlineStateTracker { inner };
                tracker.set_and_broadcast(OnlineState::Offline).await;
            },
        );
        self.inner.state.lock().unwrap().online_state_timer = Some(timer);
    }

    /// Called on every watch stream failure. The first failure from online
    /// drops back to unknown; repeated failures settle to offline.
    pub async fn handle_watch_stream_failure(&self, error: &SyncError) {
        let current = self.inner.state.lock().unwrap().state;
        if current == OnlineState::Online {
            self.set_and_broadcast(OnlineState::Unknown).await;
            return;
        }

        let go_offline = {
            let mut state = self.inner.state.lock().unwrap();
            state.watch_stream_failures += 1;
            state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES
        };
        if go_offline {
            self.clear_online_state_timer();
            self.inner.log_offline_warning(&format!(
                "Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {error}"
            ));
            self.set_and_broadcast(OnlineState::Offline).await;
        }
    }

    /// Forces a known state: online on the first server message, offline or
    /// unknown when streams are torn down deliberately.
    pub async fn set(&self, new_state: OnlineState) {
        self.clear_online_state_timer();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                // Reaching the backend once silences the offline warning for
                // the rest of this run.
                state.should_warn_client_is_offline = false;
            }
        }
        self.set_and_broadcast(new_state).await;
    }

    async fn set_and_broadcast(&self, new_state: OnlineState) {
        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            if state.state == new_state {
                false
            } else {
                state.state = new_state;
                true
            }
        };
        if changed {
            (self.inner.handler)(new_state).await;
        }
    }

    fn clear_online_state_timer(&self) {
        if let Some(timer) = self.inner.state.lock().unwrap().online_state_timer.take() {
            timer.cancel();
        }
    }
}

impl TrackerInner {
    fn log_offline_warning(&self, details: &str) {
        let warn = {
            let mut state = self.state.lock().unwrap();
            let warn = state.should_warn_client_is_offline;
            state.should_warn_client_is_offline = false;
            warn
        };
        let message =
            format!("Could not reach the backend. {details} Operating in offline mode until connectivity returns.");
        if warn {
            log::warn!("{message}");
        } else {
            log::debug!("{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::unavailable;

    fn tracker_with_log(queue: &AsyncQueue) -> (OnlineStateTracker, Arc<StdMutex<Vec<OnlineState>>>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let handler: OnlineStateHandler = Arc::new(move |state| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(state);
            })
        });
        (OnlineStateTracker::new(queue.clone(), handler), log)
    }

    #[tokio::test]
    async fn first_failure_settles_to_offline() {
        let queue = AsyncQueue::new();
        let (tracker, log) = tracker_with_log(&queue);

        tracker.handle_watch_stream_start().await;
        tracker
            .handle_watch_stream_failure(&unavailable("connection refused"))
            .await;

        assert_eq!(*log.lock().unwrap(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn silent_backend_times_out_to_offline() {
        let queue = AsyncQueue::new();
        let (tracker, log) = tracker_with_log(&queue);

        tracker.handle_watch_stream_start().await;
        queue.run_delayed_tasks_early(TimerId::OnlineStateTimeout);
        queue.drain().await;

        assert_eq!(*log.lock().unwrap(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn server_message_cancels_the_timeout() {
        let queue = AsyncQueue::new();
        let (tracker, log) = tracker_with_log(&queue);

        tracker.handle_watch_stream_start().await;
        tracker.set(OnlineState::Online).await;
        queue.run_delayed_tasks_early(TimerId::OnlineStateTimeout);
        queue.drain().await;

        assert_eq!(*log.lock().unwrap(), vec![OnlineState::Online]);
    }

    #[tokio::test]
    async fn failure_while_online_degrades_to_unknown_first() {
        let queue = AsyncQueue::new();
        let (tracker, log) = tracker_with_log(&queue);

        tracker.set(OnlineState::Online).await;
        tracker
            .handle_watch_stream_failure(&unavailable("reset by peer"))
            .await;
        tracker
            .handle_watch_stream_failure(&unavailable("reset by peer"))
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![OnlineState::Online, OnlineState::Unknown, OnlineState::Offline]
        );
    }
}
