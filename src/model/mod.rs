mod database_id;
mod document;
mod document_key;
mod document_set;
mod field_path;
mod geo_point;
mod resource_path;
mod timestamp;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::MutableDocument;
pub use document_key::DocumentKey;
pub use document_set::{DocumentComparator, DocumentSet};
pub use field_path::{FieldMask, FieldPath};
pub use geo_point::GeoPoint;
pub use resource_path::ResourcePath;
pub use timestamp::{SnapshotVersion, Timestamp};

use std::collections::{BTreeMap, BTreeSet};

/// Convenience aliases for the key-indexed collections passed between the
/// local store, sync engine, and views.
pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;
pub type DocumentKeySet = BTreeSet<DocumentKey>;

/// Batch ids order the local mutation queue; target ids name server-side
/// listens. Both are assigned by the engine and never reused within a client.
pub type BatchId = i32;
pub type TargetId = i32;

/// Monotonic counter threaded through persistence operations so the garbage
/// collector can tell recently used targets and documents from stale ones.
pub type ListenSequenceNumber = i64;
