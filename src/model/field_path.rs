use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::error::{invalid_argument, SyncResult};

const DOCUMENT_KEY_NAME: &str = "__name__";

/// A dot-separated path into a document's field tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn empty() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(segments.into_iter().map(Into::into).collect())
    }

    pub fn from_dot_separated(path: &str) -> SyncResult<Self> {
        if path.is_empty() {
            return Err(invalid_argument("Field path must not be empty"));
        }
        let segments: Vec<String> = path.split('.').map(|s| s.to_string()).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid_argument(format!(
                "Invalid field path ({path}): must not contain empty segments"
            )));
        }
        Ok(Self::new(segments))
    }

    /// The sentinel path addressing the document key itself.
    pub fn document_id() -> Self {
        Self::from_segments([DOCUMENT_KEY_NAME])
    }

    pub fn is_key_field(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_KEY_NAME
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn first_segment(&self) -> Option<&str> {
        self.segments.first().map(|s| s.as_str())
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    pub fn pop_first(&self) -> Self {
        if self.segments.len() <= 1 {
            return Self::empty();
        }
        Self::new(self.segments[1..].to_vec())
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self::new(segments)
    }

    pub fn without_last(&self) -> Self {
        if self.segments.len() <= 1 {
            return Self::empty();
        }
        Self::new(self.segments[..self.segments.len() - 1].to_vec())
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        if self.len() > other.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(l, r)| l == r)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }

    pub fn comparator(left: &Self, right: &Self) -> Ordering {
        for (l, r) in left.segments.iter().zip(right.segments.iter()) {
            match l.cmp(r) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        left.len().cmp(&right.len())
    }
}

impl PartialOrd for FieldPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldPath {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::comparator(self, other)
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

/// An ordered, duplicate-free set of field paths.
///
/// A mask `covers` a path when any of its fields is the path itself or a
/// prefix of it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: Vec<FieldPath>,
}

impl FieldMask {
    pub fn new(mut fields: Vec<FieldPath>) -> Self {
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn fields(&self) -> &[FieldPath] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with(&self, other: &FieldMask) -> FieldMask {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        FieldMask::new(fields)
    }

    pub fn insert(&mut self, path: FieldPath) {
        if let Err(pos) = self.fields.binary_search(&path) {
            self.fields.insert(pos, path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_paths() {
        let path = FieldPath::from_dot_separated("address.city").unwrap();
        assert_eq!(path.segments(), ["address", "city"]);
        assert_eq!(path.canonical_string(), "address.city");
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(FieldPath::from_dot_separated("a..b").is_err());
        assert!(FieldPath::from_dot_separated("").is_err());
    }

    #[test]
    fn key_field_sentinel() {
        assert!(FieldPath::document_id().is_key_field());
        assert!(!FieldPath::from_dot_separated("name").unwrap().is_key_field());
    }

    #[test]
    fn mask_covers_prefixes() {
        let mask = FieldMask::new(vec![
            FieldPath::from_dot_separated("address").unwrap(),
            FieldPath::from_dot_separated("tags").unwrap(),
        ]);
        assert!(mask.covers(&FieldPath::from_dot_separated("address.city").unwrap()));
        assert!(mask.covers(&FieldPath::from_dot_separated("tags").unwrap()));
        assert!(!mask.covers(&FieldPath::from_dot_separated("name").unwrap()));
    }

    #[test]
    fn mask_deduplicates_and_sorts() {
        let mask = FieldMask::new(vec![
            FieldPath::from_dot_separated("b").unwrap(),
            FieldPath::from_dot_separated("a").unwrap(),
            FieldPath::from_dot_separated("b").unwrap(),
        ]);
        assert_eq!(mask.fields().len(), 2);
        assert_eq!(mask.fields()[0].canonical_string(), "a");
    }
}
