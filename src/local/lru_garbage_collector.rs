use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::local::local_store::LocalStore;
use crate::local::persistence::StoreSet;
use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, ListenSequenceNumber, TargetId};
use crate::util::{AsyncQueue, DelayedTask, TimerId};

/// Threshold value that turns collection off entirely.
pub const COLLECTION_DISABLED: i64 = -1;

const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
const INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
const REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);

/// When the scheduler fires: once after `initial_delay`, then every
/// `regular_delay`.
#[derive(Clone, Copy, Debug)]
pub struct GcSchedule {
    pub initial_delay: Duration,
    pub regular_delay: Duration,
}

impl Default for GcSchedule {
    fn default() -> Self {
        Self {
            initial_delay: INITIAL_GC_DELAY,
            regular_delay: REGULAR_GC_DELAY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Collection runs only once the remote document cache exceeds this many
    /// bytes; [`COLLECTION_DISABLED`] turns the collector off.
    pub cache_size_threshold_bytes: i64,
    /// Fraction (in percent) of tracked sequence numbers to collect per run.
    pub percentile_to_collect: u32,
    /// Hard cap on sequence numbers collected in one run.
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub fn disabled() -> Self {
        Self {
            cache_size_threshold_bytes: COLLECTION_DISABLED,
            ..Self::default()
        }
    }

    pub fn with_cache_size_threshold(cache_size_threshold_bytes: i64) -> Self {
        Self {
            cache_size_threshold_bytes,
            ..Self::default()
        }
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_threshold_bytes: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    fn did_not_run() -> Self {
        Self::default()
    }
}

/// Keeps the `max_elements` smallest sequence numbers seen; the largest kept
/// value is then the nth-smallest overall, which becomes the eviction upper
/// bound.
struct RollingSequenceNumberBuffer {
    max_elements: usize,
    heap: BinaryHeap<ListenSequenceNumber>,
}

impl RollingSequenceNumberBuffer {
    fn new(max_elements: usize) -> Self {
        Self {
            max_elements,
            heap: BinaryHeap::new(),
        }
    }

    fn add(&mut self, sequence_number: ListenSequenceNumber) {
        if self.heap.len() < self.max_elements {
            self.heap.push(sequence_number);
        } else if let Some(&largest) = self.heap.peek() {
            if sequence_number < largest {
                self.heap.pop();
                self.heap.push(sequence_number);
            }
        }
    }

    fn max_value(&self) -> Option<ListenSequenceNumber> {
        self.heap.peek().copied()
    }
}

/// Sequence-number LRU over targets and orphaned documents.
///
/// A run computes the nth-percentile sequence number across all tracked
/// entries, evicts inactive targets at or below it, then evicts documents
/// that no retained target, pending mutation, or recent orphan stamp pins.
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> LruParams {
        self.params
    }

    pub(crate) fn collect(
        &self,
        stores: &mut StoreSet,
        active_targets: &HashMap<TargetId, TargetData>,
    ) -> LruResults {
        if self.params.cache_size_threshold_bytes == COLLECTION_DISABLED {
            return LruResults::did_not_run();
        }

        let cache_size = stores.remote_documents.byte_size() as i64;
        if cache_size < self.params.cache_size_threshold_bytes {
            log::debug!(
                "lru: cache size {cache_size} under threshold {}, skipping",
                self.params.cache_size_threshold_bytes
            );
            return LruResults::did_not_run();
        }
        log::warn!(
            "lru: cache size {cache_size} exceeds threshold {}, collecting",
            self.params.cache_size_threshold_bytes
        );

        let sequence_count = stores.target_cache.target_count() + stores.orphaned_at.len();
        let to_collect = (sequence_count * self.params.percentile_to_collect as usize / 100)
            .min(self.params.maximum_sequence_numbers_to_collect);

        let mut buffer = RollingSequenceNumberBuffer::new(to_collect);
        for target in stores.target_cache.all_targets() {
            buffer.add(target.sequence_number);
        }
        for sequence_number in stores.orphaned_at.values() {
            buffer.add(*sequence_number);
        }
        let Some(upper_bound) = buffer.max_value() else {
            return LruResults {
                did_run: true,
                ..LruResults::default()
            };
        };

        let targets_removed = stores.target_cache.remove_targets(upper_bound, active_targets);
        let documents_removed = Self::remove_orphaned_documents(stores, upper_bound);

        log::debug!(
            "lru: collected {to_collect} sequence numbers, removed {targets_removed} targets \
             and {documents_removed} documents (upper bound {upper_bound})"
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        }
    }

    fn remove_orphaned_documents(
        stores: &mut StoreSet,
        upper_bound: ListenSequenceNumber,
    ) -> usize {
        let doomed: Vec<DocumentKey> = stores
            .remote_documents
            .get_all_keys()
            .into_iter()
            .filter(|key| !Self::is_pinned(stores, key, upper_bound))
            .collect();
        for key in &doomed {
            stores.remote_documents.remove_entry(key);
            stores.orphaned_at.remove(key);
        }
        doomed.len()
    }

    /// A document survives while any user's queue mutates it, any retained
    /// target (including limbo resolutions) matches it, or its orphan stamp
    /// is newer than the eviction bound.
    fn is_pinned(stores: &StoreSet, key: &DocumentKey, upper_bound: ListenSequenceNumber) -> bool {
        if stores
            .users
            .values()
            .any(|user| user.mutation_queue.contains_key(key))
        {
            return true;
        }
        if stores.target_cache.contains_key(key) {
            return true;
        }
        stores
            .orphaned_at
            .get(key)
            .map(|sequence_number| *sequence_number > upper_bound)
            .unwrap_or(false)
    }
}

/// Periodically runs the collector on the shared queue: first after a short
/// initial delay, then at a regular cadence.
pub struct LruScheduler {
    collector: Arc<LruGarbageCollector>,
    local_store: Arc<LocalStore>,
    queue: AsyncQueue,
    schedule: GcSchedule,
    task: StdMutex<Option<DelayedTask>>,
    has_run: AtomicBool,
}

impl LruScheduler {
    pub fn new(
        collector: Arc<LruGarbageCollector>,
        local_store: Arc<LocalStore>,
        queue: AsyncQueue,
        schedule: GcSchedule,
    ) -> Arc<Self> {
        Arc::new(Self {
            collector,
            local_store,
            queue,
            schedule,
            task: StdMutex::new(None),
            has_run: AtomicBool::new(false),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if self.collector.params().cache_size_threshold_bytes != COLLECTION_DISABLED {
            self.schedule();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.cancel();
        }
    }

    fn schedule(self: &Arc<Self>) {
        let delay = if self.has_run.load(Ordering::SeqCst) {
            self.schedule.regular_delay
        } else {
            self.schedule.initial_delay
        };
        let scheduler = Arc::clone(self);
        let task = self
            .queue
            .enqueue_after_delay(TimerId::GarbageCollection, delay, async move {
                let results = scheduler
                    .local_store
                    .collect_garbage(&scheduler.collector)
                    .await;
                if results.did_run {
                    log::debug!(
                        "lru: scheduled run removed {} targets, {} documents",
                        results.targets_removed,
                        results.documents_removed
                    );
                }
                scheduler.has_run.store(true, Ordering::SeqCst);
                scheduler.schedule();
            });
        *self.task.lock().unwrap() = Some(task);
    }
}
