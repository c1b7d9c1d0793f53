use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::error::{invalid_argument, SyncResult};
use crate::model::resource_path::ResourcePath;

/// Identifies one document: a resource path with an even segment count.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn new(path: ResourcePath) -> SyncResult<Self> {
        if path.is_empty() || path.len() % 2 != 0 {
            return Err(invalid_argument(format!(
                "Invalid document key path (must have an even number of segments): {}",
                path.canonical_string()
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> SyncResult<Self> {
        Self::new(ResourcePath::from_string(path)?)
    }

    pub fn from_segments<I, S>(segments: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ResourcePath::from_segments(segments))
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// The collection this document belongs to.
    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// The last collection id on the key's path.
    pub fn collection_group(&self) -> Option<&str> {
        let len = self.path.len();
        if len < 2 {
            return None;
        }
        self.path.segment(len - 2)
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == Some(collection_id)
    }

    pub fn comparator(left: &Self, right: &Self) -> Ordering {
        ResourcePath::comparator(&left.path, &right.path)
    }
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::comparator(self, other)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.canonical_string())
    }
}
