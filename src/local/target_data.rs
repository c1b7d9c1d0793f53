use crate::core::Target;
use crate::model::{ListenSequenceNumber, SnapshotVersion, TargetId};
use crate::value::BytesValue;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetPurpose {
    /// A user-issued listen.
    Listen,
    /// Re-listen after the server's existence filter disagreed with the local
    /// result set; the resume token is discarded so the server resends state.
    ExistenceFilterMismatch,
    /// Server-side lookup of a single document whose membership in some view
    /// is in doubt.
    LimboResolution,
}

/// Everything the client tracks about an allocated target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    /// Last transaction this target was used in; drives LRU eviction.
    pub sequence_number: ListenSequenceNumber,
    /// Version of the last snapshot the server confirmed for this target.
    pub snapshot_version: SnapshotVersion,
    /// Newest snapshot at which the view had no limbo documents; local query
    /// results cached at or before this version can be trusted.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque server state allowing the listen to resume without a replay.
    pub resume_token: BytesValue,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::MIN,
            last_limbo_free_snapshot_version: SnapshotVersion::MIN,
            resume_token: BytesValue::new(Vec::new()),
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_resume_token(
        mut self,
        resume_token: BytesValue,
        snapshot_version: SnapshotVersion,
    ) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }
}
