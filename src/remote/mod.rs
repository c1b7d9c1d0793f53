pub mod connection;
pub mod datastore;
pub(crate) mod listen_stream;
pub mod online_state_tracker;
pub(crate) mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
pub mod watch_change;
pub mod watch_change_aggregator;
pub(crate) mod write_stream;

pub use connection::{
    FrameKind, InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamId,
    StreamTransport, TransportFrame, LISTEN_SERVICE, WRITE_SERVICE,
};
pub use datastore::{ConnectionDatastore, Datastore, DatastoreArc, StreamHandle};
pub use online_state_tracker::{OnlineState, OnlineStateHandler};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use serializer::{JsonProtoSerializer, WriteResponse};
pub use watch_change::{
    decode_snapshot_version, decode_watch_change, DocumentWatchChange, ExistenceFilterChange,
    WatchChange, WatchTargetChange, WatchTargetChangeState,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
