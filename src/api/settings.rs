use crate::local::{GcSchedule, LruParams};
use crate::model::DatabaseId;

/// Labels the backend database a client talks to. `app_id` and `host` are
/// carried for logging and diagnostics; the wire layer identifies the
/// database through its serializer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub database_id: DatabaseId,
    pub app_id: String,
    pub host: String,
}

impl DatabaseInfo {
    pub fn new(
        database_id: DatabaseId,
        app_id: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            database_id,
            app_id: app_id.into(),
            host: host.into(),
        }
    }
}

/// Construction-time knobs for a [`SyncClient`](crate::api::SyncClient).
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub database_info: DatabaseInfo,
    pub lru_params: LruParams,
    pub gc_schedule: GcSchedule,
}

impl ClientSettings {
    /// Settings for `database_info` with every tunable at its default.
    pub fn new(database_info: DatabaseInfo) -> Self {
        Self {
            database_info,
            lru_params: LruParams::default(),
            gc_schedule: GcSchedule::default(),
        }
    }
}
