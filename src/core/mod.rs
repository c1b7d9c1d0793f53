mod event_manager;
mod filter;
mod query;
mod sync_engine;
mod target;
mod target_id_generator;
mod view;
mod view_snapshot;

pub use event_manager::{
    EventManager, ListenOptions, ListenerRegistration, QueryListener, ViewSnapshotHandler,
};
pub use filter::{CompositeFilter, CompositeOperator, FieldFilter, FieldOperator, Filter};
pub use query::{Bound, Direction, LimitType, OrderBy, Query};
pub use sync_engine::{SyncEngine, SyncEngineEvents, WriteAck};
pub use target::Target;
pub use target_id_generator::TargetIdGenerator;
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
