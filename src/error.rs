use std::fmt;

/// Canonical error codes for the sync engine.
///
/// The set mirrors the RPC status codes the backend speaks, plus
/// [`SyncErrorCode::StorageTransient`] for recoverable persistence contention
/// (lock stealing, tab handover) that callers retry with backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncErrorCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
    StorageTransient,
}

impl SyncErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCode::Ok => "docsync/ok",
            SyncErrorCode::Cancelled => "docsync/cancelled",
            SyncErrorCode::Unknown => "docsync/unknown",
            SyncErrorCode::InvalidArgument => "docsync/invalid-argument",
            SyncErrorCode::DeadlineExceeded => "docsync/deadline-exceeded",
            SyncErrorCode::NotFound => "docsync/not-found",
            SyncErrorCode::AlreadyExists => "docsync/already-exists",
            SyncErrorCode::PermissionDenied => "docsync/permission-denied",
            SyncErrorCode::ResourceExhausted => "docsync/resource-exhausted",
            SyncErrorCode::FailedPrecondition => "docsync/failed-precondition",
            SyncErrorCode::Aborted => "docsync/aborted",
            SyncErrorCode::OutOfRange => "docsync/out-of-range",
            SyncErrorCode::Unimplemented => "docsync/unimplemented",
            SyncErrorCode::Internal => "docsync/internal",
            SyncErrorCode::Unavailable => "docsync/unavailable",
            SyncErrorCode::DataLoss => "docsync/data-loss",
            SyncErrorCode::Unauthenticated => "docsync/unauthenticated",
            SyncErrorCode::StorageTransient => "docsync/storage-transient",
        }
    }

    /// Maps a numeric gRPC status code onto the local taxonomy. Unknown codes
    /// collapse to [`SyncErrorCode::Unknown`].
    pub fn from_grpc_code(code: i64) -> SyncErrorCode {
        match code {
            0 => SyncErrorCode::Ok,
            1 => SyncErrorCode::Cancelled,
            2 => SyncErrorCode::Unknown,
            3 => SyncErrorCode::InvalidArgument,
            4 => SyncErrorCode::DeadlineExceeded,
            5 => SyncErrorCode::NotFound,
            6 => SyncErrorCode::AlreadyExists,
            7 => SyncErrorCode::PermissionDenied,
            8 => SyncErrorCode::ResourceExhausted,
            9 => SyncErrorCode::FailedPrecondition,
            10 => SyncErrorCode::Aborted,
            11 => SyncErrorCode::OutOfRange,
            12 => SyncErrorCode::Unimplemented,
            13 => SyncErrorCode::Internal,
            14 => SyncErrorCode::Unavailable,
            15 => SyncErrorCode::DataLoss,
            16 => SyncErrorCode::Unauthenticated,
            _ => SyncErrorCode::Unknown,
        }
    }

    /// Maps an upper-snake status name (`"RESOURCE_EXHAUSTED"`) onto the local
    /// taxonomy.
    pub fn from_status_name(status: &str) -> SyncErrorCode {
        match status {
            "OK" => SyncErrorCode::Ok,
            "CANCELLED" => SyncErrorCode::Cancelled,
            "INVALID_ARGUMENT" => SyncErrorCode::InvalidArgument,
            "DEADLINE_EXCEEDED" => SyncErrorCode::DeadlineExceeded,
            "NOT_FOUND" => SyncErrorCode::NotFound,
            "ALREADY_EXISTS" => SyncErrorCode::AlreadyExists,
            "PERMISSION_DENIED" => SyncErrorCode::PermissionDenied,
            "RESOURCE_EXHAUSTED" => SyncErrorCode::ResourceExhausted,
            "FAILED_PRECONDITION" => SyncErrorCode::FailedPrecondition,
            "ABORTED" => SyncErrorCode::Aborted,
            "OUT_OF_RANGE" => SyncErrorCode::OutOfRange,
            "UNIMPLEMENTED" => SyncErrorCode::Unimplemented,
            "INTERNAL" => SyncErrorCode::Internal,
            "UNAVAILABLE" => SyncErrorCode::Unavailable,
            "DATA_LOSS" => SyncErrorCode::DataLoss,
            "UNAUTHENTICATED" => SyncErrorCode::Unauthenticated,
            _ => SyncErrorCode::Unknown,
        }
    }
}

impl fmt::Display for SyncErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncError {
    pub code: SyncErrorCode,
    pub message: String,
}

impl SyncError {
    pub fn new(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for SyncError {}

pub type SyncResult<T> = Result<T, SyncError>;

pub fn cancelled(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Cancelled, message)
}

pub fn invalid_argument(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::InvalidArgument, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::DeadlineExceeded, message)
}

pub fn not_found(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::PermissionDenied, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Aborted, message)
}

pub fn internal_error(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Internal, message)
}

pub fn unavailable(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unavailable, message)
}

pub fn unauthenticated(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unauthenticated, message)
}

pub fn storage_transient(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::StorageTransient, message)
}

/// Whether an error received on a stream or target is terminal for that
/// target. Transient codes restart with backoff instead.
pub fn is_permanent_error(code: SyncErrorCode) -> bool {
    match code {
        SyncErrorCode::Ok
        | SyncErrorCode::Cancelled
        | SyncErrorCode::Unknown
        | SyncErrorCode::DeadlineExceeded
        | SyncErrorCode::ResourceExhausted
        | SyncErrorCode::Internal
        | SyncErrorCode::Unavailable
        | SyncErrorCode::Unauthenticated
        | SyncErrorCode::StorageTransient => false,
        SyncErrorCode::InvalidArgument
        | SyncErrorCode::NotFound
        | SyncErrorCode::AlreadyExists
        | SyncErrorCode::PermissionDenied
        | SyncErrorCode::FailedPrecondition
        | SyncErrorCode::Aborted
        | SyncErrorCode::OutOfRange
        | SyncErrorCode::Unimplemented
        | SyncErrorCode::DataLoss => true,
    }
}

/// Whether an error on the write stream rejects the in-flight batch.
///
/// `Aborted` means the commit raced a concurrent transaction; the batch is
/// safe to re-send, so it stays queued.
pub fn is_permanent_write_error(code: SyncErrorCode) -> bool {
    is_permanent_error(code) && code != SyncErrorCode::Aborted
}
