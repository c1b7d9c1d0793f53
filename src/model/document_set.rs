use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::model::{DocumentKey, MutableDocument};

/// Total ordering over documents. Implementations do not need to break ties;
/// [`DocumentSet`] always appends a comparison of document keys.
pub type DocumentComparator =
    Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync>;

/// An immutable-in-spirit sorted set of documents, indexed both by key and by
/// a caller-supplied ordering. Equal positions under the caller's comparator
/// fall back to key order, so iteration order is always deterministic.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    keyed: BTreeMap<DocumentKey, MutableDocument>,
    order: Vec<DocumentKey>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        let comparator: DocumentComparator = Arc::new(move |left, right| {
            comparator(left, right).then_with(|| left.key().cmp(right.key()))
        });
        Self {
            comparator,
            keyed: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub fn by_key_order() -> Self {
        Self::new(Arc::new(|left, right| left.key().cmp(right.key())))
    }

    /// An empty set that shares this set's ordering.
    pub fn empty_copy(&self) -> Self {
        Self {
            comparator: self.comparator.clone(),
            keyed: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.keyed.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.keyed.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.order.first().map(|key| &self.keyed[key])
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.order.last().map(|key| &self.keyed[key])
    }

    /// Position of `key` in the sorted order, or `None` when absent.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.keyed.get(key)?;
        self.position_of(document).ok()
    }

    /// Inserts `document`, replacing any previous document with the same key.
    pub fn add(&mut self, document: MutableDocument) {
        self.remove(document.key());
        let index = match self.position_of(&document) {
            Ok(index) | Err(index) => index,
        };
        self.order.insert(index, document.key().clone());
        self.keyed.insert(document.key().clone(), document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let document = self.keyed.remove(key)?;
        if let Ok(index) = self.position_of(&document) {
            self.order.remove(index);
        }
        Some(document)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.order.iter().map(|key| &self.keyed[key])
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.order.iter()
    }

    fn position_of(&self, document: &MutableDocument) -> Result<usize, usize> {
        let comparator = &self.comparator;
        self.order
            .binary_search_by(|key| comparator(&self.keyed[key], document))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}
