use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::BoxFuture;

use crate::error::{cancelled, SyncErrorCode, SyncResult};
use crate::runtime;
use crate::util::backoff::{ExponentialBackoff, RetrySettings};

/// Identifies the purpose of a delayed operation so tests (and idle handling)
/// can cancel or force-run a specific class of timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerId {
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    GarbageCollection,
    TransactionRetry,
}

type QueueOp = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Strict-FIFO serialized executor.
///
/// Every engine-internal operation (persistence transactions, stream
/// callbacks, listener notifications) runs as one queued task at a time, in
/// enqueue order. Components already running on the queue call each other
/// directly; only entry points (public API, stream loops, timers) enqueue.
/// Awaiting [`AsyncQueue::enqueue`] from inside a queued task deadlocks.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

struct AsyncQueueInner {
    sender: async_channel::Sender<QueueOp>,
    shutting_down: AtomicBool,
    delayed: StdMutex<Vec<Arc<DelayedState>>>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<QueueOp>();
        runtime::spawn_detached(async move {
            while let Ok(op) = receiver.recv().await {
                op.await;
            }
        });
        Self {
            inner: Arc::new(AsyncQueueInner {
                sender,
                shutting_down: AtomicBool::new(false),
                delayed: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Rejects new work. Tasks already queued still run.
    pub fn enter_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Enqueues `op` and resolves with its result once the queue reaches it.
    pub fn enqueue<F, T>(&self, op: F) -> impl Future<Output = SyncResult<T>>
    where
        F: Future<Output = SyncResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if self.is_shutting_down() {
            let _ = tx.send(Err(cancelled("AsyncQueue is shutting down")));
        } else {
            let task: QueueOp = Box::pin(async move {
                let _ = tx.send(op.await);
            });
            if self.inner.sender.try_send(task).is_err() {
                // Channel closed: executor is gone, nothing will run.
            }
        }
        async move {
            rx.await
                .unwrap_or_else(|_| Err(cancelled("AsyncQueue task dropped")))
        }
    }

    /// Enqueues `op` without observing its completion.
    pub fn enqueue_and_forget<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            return;
        }
        let _ = self.inner.sender.try_send(Box::pin(op));
    }

    /// Like [`AsyncQueue::enqueue_and_forget`], but still accepted during
    /// shutdown. Teardown steps use this.
    pub fn enqueue_even_while_shutting_down<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.inner.sender.try_send(Box::pin(op));
    }

    /// Schedules `op` to be enqueued after `delay`. The returned handle
    /// cancels the operation as long as it has not been enqueued yet.
    pub fn enqueue_after_delay<F>(&self, timer_id: TimerId, delay: Duration, op: F) -> DelayedTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = Arc::new(DelayedState {
            timer_id,
            cancelled: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            op: StdMutex::new(Some(Box::pin(op) as QueueOp)),
            sender: self.inner.sender.clone(),
        });

        {
            let mut delayed = self.inner.delayed.lock().unwrap();
            delayed.retain(|entry| !entry.fired.load(Ordering::SeqCst));
            delayed.push(Arc::clone(&state));
        }

        let sleeper = Arc::clone(&state);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            sleeper.fire();
        });

        DelayedTask { state }
    }

    /// Runs `op` on the queue, retrying storage-transient failures with
    /// backoff. Each retry re-enqueues at the back of the queue.
    pub fn enqueue_retryable<F>(&self, op: F)
    where
        F: Fn() -> BoxFuture<'static, SyncResult<()>> + Send + Sync + 'static,
    {
        let queue = self.clone();
        let op = Arc::new(op);
        runtime::spawn_detached(async move {
            let mut backoff = ExponentialBackoff::new(RetrySettings::transaction_defaults());
            loop {
                let attempt = Arc::clone(&op);
                match queue.enqueue(async move { attempt().await }).await {
                    Ok(()) => break,
                    Err(err) if err.code == SyncErrorCode::StorageTransient => {
                        let Some(delay) = backoff.next_delay() else {
                            log::warn!("retryable operation exhausted retries: {err}");
                            break;
                        };
                        log::debug!("transient storage failure, retrying in {delay:?}: {err}");
                        runtime::sleep(delay).await;
                    }
                    Err(err) => {
                        log::warn!("retryable operation failed: {err}");
                        break;
                    }
                }
            }
        });
    }

    /// Immediately enqueues every pending delayed operation matching
    /// `timer_id` (or all of them for [`TimerId::All`]). Test hook.
    pub fn run_delayed_tasks_early(&self, timer_id: TimerId) {
        let pending: Vec<Arc<DelayedState>> = {
            let delayed = self.inner.delayed.lock().unwrap();
            delayed
                .iter()
                .filter(|state| {
                    timer_id == TimerId::All || state.timer_id == timer_id
                })
                .cloned()
                .collect()
        };
        for state in pending {
            state.fire();
        }
    }

    /// Resolves once every task enqueued before the call has run.
    pub async fn drain(&self) {
        let _ = self.enqueue(async { SyncResult::Ok(()) }).await;
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct DelayedState {
    timer_id: TimerId,
    cancelled: AtomicBool,
    fired: AtomicBool,
    op: StdMutex<Option<QueueOp>>,
    sender: async_channel::Sender<QueueOp>,
}

impl DelayedState {
    fn fire(&self) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(op) = self.op.lock().unwrap().take() {
            let _ = self.sender.try_send(op);
        }
    }
}

/// Handle for a scheduled-but-not-yet-run operation.
pub struct DelayedTask {
    state: Arc<DelayedState>,
}

impl DelayedTask {
    pub fn timer_id(&self) -> TimerId {
        self.state.timer_id
    }

    /// Cancels the operation unless it already made it onto the queue.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.op.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::storage_transient;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn tasks_run_in_enqueue_order() {
        let queue = AsyncQueue::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..10 {
            let seen = Arc::clone(&seen);
            queue.enqueue_and_forget(async move {
                seen.lock().unwrap().push(i);
            });
        }
        queue.drain().await;
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn enqueue_returns_result() {
        let queue = AsyncQueue::new();
        let value = queue.enqueue(async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn cancelled_delayed_task_never_runs() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let task = queue.enqueue_after_delay(TimerId::GarbageCollection, Duration::from_secs(60), async move {
            flag.store(true, Ordering::SeqCst);
        });
        task.cancel();
        queue.run_delayed_tasks_early(TimerId::All);
        queue.drain().await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn run_delayed_tasks_early_fires_matching_timer() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let _task = queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(600), async move {
            flag.store(true, Ordering::SeqCst);
        });
        queue.run_delayed_tasks_early(TimerId::ListenStreamIdle);
        queue.drain().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn retryable_operations_retry_transient_failures() {
        let queue = AsyncQueue::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        queue.enqueue_retryable(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(storage_transient("simulated contention"))
                } else {
                    Ok(())
                }
            })
        });
        for _ in 0..50 {
            if attempts.load(Ordering::SeqCst) >= 3 {
                break;
            }
            runtime::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let queue = AsyncQueue::new();
        queue.enter_shutdown();
        let result: SyncResult<()> = queue.enqueue(async { Ok(()) }).await;
        assert_eq!(result.unwrap_err().code, SyncErrorCode::Cancelled);
    }
}
