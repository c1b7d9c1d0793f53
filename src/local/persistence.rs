use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex as AsyncMutex;

use crate::api::credentials::User;
use crate::error::{failed_precondition, SyncResult};
use crate::local::bundle_cache::{BundleCache, MemoryBundleCache};
use crate::local::document_overlay_cache::{DocumentOverlayCache, MemoryDocumentOverlayCache};
use crate::local::index_manager::{IndexManager, MemoryIndexManager};
use crate::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::local::mutation_queue::{MemoryMutationQueue, MutationQueue};
use crate::local::remote_document_cache::{MemoryRemoteDocumentCache, RemoteDocumentCache};
use crate::local::target_cache::{MemoryTargetCache, TargetCache};
use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, ListenSequenceNumber, TargetId};

/// Factory for the concrete caches behind one logical database. A durable
/// backend returns handles onto its tables; the in-memory backend returns
/// fresh empty caches.
pub trait PersistenceBackend: Send + Sync + 'static {
    fn remote_document_cache(&self) -> Box<dyn RemoteDocumentCache>;
    fn target_cache(&self) -> Box<dyn TargetCache>;
    fn bundle_cache(&self) -> Box<dyn BundleCache>;
    fn index_manager(&self) -> Box<dyn IndexManager>;
    fn mutation_queue(&self, user: &User) -> Box<dyn MutationQueue>;
    fn document_overlay_cache(&self, user: &User) -> Box<dyn DocumentOverlayCache>;

    /// Whether this backend coordinates a primary lease between multiple
    /// clients sharing the same storage. Single-client backends are
    /// implicitly primary.
    fn supports_multi_client(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct MemoryPersistenceBackend;

impl PersistenceBackend for MemoryPersistenceBackend {
    fn remote_document_cache(&self) -> Box<dyn RemoteDocumentCache> {
        Box::new(MemoryRemoteDocumentCache::new())
    }

    fn target_cache(&self) -> Box<dyn TargetCache> {
        Box::new(MemoryTargetCache::new())
    }

    fn bundle_cache(&self) -> Box<dyn BundleCache> {
        Box::new(MemoryBundleCache::new())
    }

    fn index_manager(&self) -> Box<dyn IndexManager> {
        Box::new(MemoryIndexManager::new())
    }

    fn mutation_queue(&self, _user: &User) -> Box<dyn MutationQueue> {
        Box::new(MemoryMutationQueue::new())
    }

    fn document_overlay_cache(&self, _user: &User) -> Box<dyn DocumentOverlayCache> {
        Box::new(MemoryDocumentOverlayCache::new())
    }
}

pub(crate) struct UserStores {
    pub(crate) mutation_queue: Box<dyn MutationQueue>,
    pub(crate) overlays: Box<dyn DocumentOverlayCache>,
}

/// Every cache of one logical database, plus the shared listen-sequence
/// counter and the orphaned-document ledger the LRU collector sweeps.
pub(crate) struct StoreSet {
    pub(crate) remote_documents: Box<dyn RemoteDocumentCache>,
    pub(crate) target_cache: Box<dyn TargetCache>,
    pub(crate) bundle_cache: Box<dyn BundleCache>,
    pub(crate) index_manager: Box<dyn IndexManager>,
    pub(crate) users: HashMap<String, UserStores>,
    /// Documents that may have lost their last reference, stamped with the
    /// sequence number current at that moment.
    pub(crate) orphaned_at: HashMap<DocumentKey, ListenSequenceNumber>,
    pub(crate) listen_sequence: ListenSequenceNumber,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Write access that additionally requires this client to hold the
    /// primary lease on multi-client backends.
    ReadWritePrimary,
}

/// One unit of cross-cache work. All fields borrow exclusively from the
/// locked [`StoreSet`], so a transaction can move data between caches without
/// intermediate copies; dropping the transaction releases the lock.
pub struct PersistenceTransaction<'a> {
    pub remote_documents: &'a mut dyn RemoteDocumentCache,
    pub target_cache: &'a mut dyn TargetCache,
    pub bundle_cache: &'a mut dyn BundleCache,
    pub index_manager: &'a mut dyn IndexManager,
    pub mutation_queue: &'a mut dyn MutationQueue,
    pub overlays: &'a mut dyn DocumentOverlayCache,
    orphaned_at: &'a mut HashMap<DocumentKey, ListenSequenceNumber>,
    sequence_number: ListenSequenceNumber,
}

impl PersistenceTransaction<'_> {
    pub fn sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    /// Records that `key` may no longer be referenced by any target or
    /// mutation. The LRU collector evicts it once the stamped sequence number
    /// falls below the collection threshold, unless something re-references
    /// it first.
    pub fn mark_potentially_orphaned(&mut self, key: DocumentKey) {
        self.orphaned_at.insert(key, self.sequence_number);
    }
}

/// Handle onto one logical database's storage. Clones share the same
/// underlying caches, so tearing components down and rebuilding them over a
/// cloned handle models a client restart against surviving storage.
#[derive(Clone)]
pub struct Persistence {
    state: Arc<AsyncMutex<StoreSet>>,
    backend: Arc<dyn PersistenceBackend>,
    started: Arc<AtomicBool>,
}

impl Persistence {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        let remote_documents = backend.remote_document_cache();
        let target_cache = backend.target_cache();
        let bundle_cache = backend.bundle_cache();
        let index_manager = backend.index_manager();
        // Sequence numbers continue from whatever the target cache already
        // recorded, keeping them monotonic across restarts.
        let listen_sequence = target_cache.highest_sequence_number();
        Self {
            state: Arc::new(AsyncMutex::new(StoreSet {
                remote_documents,
                target_cache,
                bundle_cache,
                index_manager,
                users: HashMap::new(),
                orphaned_at: HashMap::new(),
                listen_sequence,
            })),
            backend,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPersistenceBackend))
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_primary(&self) -> bool {
        // Single-client backends hold the primary role implicitly; a
        // multi-client backend would track the lease here.
        !self.backend.supports_multi_client()
    }

    /// Runs `op` as one atomic unit over every cache, against `user`'s
    /// mutation queue and overlays. Each transaction observes a fresh,
    /// strictly increasing sequence number.
    pub async fn run_transaction<T, F>(
        &self,
        label: &'static str,
        mode: TransactionMode,
        user: &User,
        op: F,
    ) -> SyncResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction<'_>) -> SyncResult<T> + Send,
        T: Send,
    {
        if !self.is_started() {
            return Err(failed_precondition(format!(
                "persistence transaction '{label}' issued before start"
            )));
        }
        if mode == TransactionMode::ReadWritePrimary && !self.is_primary() {
            return Err(failed_precondition(format!(
                "persistence transaction '{label}' requires the primary lease"
            )));
        }

        let mut stores = self.state.lock().await;
        log::debug!("persistence transaction: {label} ({mode:?})");

        let storage_key = user.storage_key();
        if !stores.users.contains_key(&storage_key) {
            let user_stores = UserStores {
                mutation_queue: self.backend.mutation_queue(user),
                overlays: self.backend.document_overlay_cache(user),
            };
            stores.users.insert(storage_key.clone(), user_stores);
        }

        stores.listen_sequence += 1;
        let sequence_number = stores.listen_sequence;

        let StoreSet {
            remote_documents,
            target_cache,
            bundle_cache,
            index_manager,
            users,
            orphaned_at,
            ..
        } = &mut *stores;
        let Some(user_stores) = users.get_mut(&storage_key) else {
            return Err(failed_precondition(format!(
                "no stores for user {storage_key}"
            )));
        };

        let mut transaction = PersistenceTransaction {
            remote_documents: &mut **remote_documents,
            target_cache: &mut **target_cache,
            bundle_cache: &mut **bundle_cache,
            index_manager: &mut **index_manager,
            mutation_queue: &mut *user_stores.mutation_queue,
            overlays: &mut *user_stores.overlays,
            orphaned_at,
            sequence_number,
        };
        op(&mut transaction)
    }

    /// Runs one LRU collection cycle over the whole store set. Holding the
    /// lock for the full sweep keeps eviction atomic with respect to
    /// transactions.
    pub async fn collect_garbage(
        &self,
        collector: &LruGarbageCollector,
        active_targets: &HashMap<TargetId, TargetData>,
    ) -> LruResults {
        let mut stores = self.state.lock().await;
        collector.collect(&mut stores, active_targets)
    }
}
