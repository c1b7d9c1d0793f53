//! Offline persistence: the caches, the query engine that reads them, and the
//! local store that coordinates everything under one transaction at a time.

mod bundle_cache;
mod document_overlay_cache;
mod index_manager;
mod local_documents_view;
mod local_store;
mod local_view_changes;
mod lru_garbage_collector;
mod mutation_queue;
mod persistence;
mod query_engine;
mod reference_set;
mod remote_document_cache;
mod target_cache;
mod target_data;

pub use bundle_cache::{BundleCache, BundleMetadata, MemoryBundleCache, NamedQuery};
pub use document_overlay_cache::{DocumentOverlayCache, MemoryDocumentOverlayCache, OverlayMap};
pub use index_manager::{IndexManager, IndexType, MemoryIndexManager};
pub use local_store::{LocalStore, LocalWriteResult, QueryResult, UserChangeResult};
pub use local_view_changes::LocalViewChanges;
pub use lru_garbage_collector::{
    GcSchedule, LruGarbageCollector, LruParams, LruResults, LruScheduler, COLLECTION_DISABLED,
};
pub use mutation_queue::{MemoryMutationQueue, MutationQueue};
pub use persistence::{
    MemoryPersistenceBackend, Persistence, PersistenceBackend, PersistenceTransaction,
    TransactionMode,
};
pub use reference_set::ReferenceSet;
pub use remote_document_cache::{MemoryRemoteDocumentCache, RemoteDocumentCache};
pub use target_cache::{MemoryTargetCache, TargetCache};
pub use target_data::{TargetData, TargetPurpose};
