use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

const NANOS_PER_SECOND: i32 = 1_000_000_000;

/// Wall-clock instant with nanosecond precision, normalized so `nanos` is
/// always in `[0, 1e9)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let mut timestamp = Self { seconds, nanos };
        timestamp.normalize();
        timestamp
    }

    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(duration) => Self::new(duration.as_secs() as i64, duration.subsec_nanos() as i32),
            Err(err) => {
                let duration = err.duration();
                Self::new(-(duration.as_secs() as i64), -(duration.subsec_nanos() as i32))
            }
        }
    }

    fn normalize(&mut self) {
        if self.nanos >= NANOS_PER_SECOND {
            self.seconds += (self.nanos / NANOS_PER_SECOND) as i64;
            self.nanos %= NANOS_PER_SECOND;
        } else if self.nanos < 0 {
            let borrow = (-self.nanos + NANOS_PER_SECOND - 1) / NANOS_PER_SECOND;
            self.seconds -= borrow as i64;
            self.nanos += borrow * NANOS_PER_SECOND;
        }
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        match self.seconds.cmp(&other.seconds) {
            Ordering::Equal => self.nanos.cmp(&other.nanos),
            non_eq => non_eq,
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

/// A document/watch version: the server timestamp at which a change became
/// visible. `SnapshotVersion::MIN` means "version unknown".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub const MIN: SnapshotVersion = SnapshotVersion(Timestamp { seconds: 0, nanos: 0 });

    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::MIN
    }
}
