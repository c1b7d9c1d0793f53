use std::cmp::Ordering;
use std::sync::Arc;

use crate::core::filter::Filter;
use crate::core::target::Target;
use crate::model::{DocumentComparator, FieldPath, MutableDocument, ResourcePath};
use crate::value::FieldValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn flip(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }

    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn canonical_id(&self) -> String {
        let direction = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), direction)
    }
}

/// A cursor over the ordered result set. Position values align with the
/// query's normalized order-by list; a key-field component holds a full
/// document resource name.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    pub position: Vec<FieldValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FieldValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn canonical_id(&self) -> String {
        let values: Vec<String> = self.position.iter().map(FieldValue::canonical_id).collect();
        format!("{}:[{}]", self.inclusive, values.join(","))
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by.iter()) {
            let comparison = if order.field.is_key_field() {
                match component.as_reference() {
                    Some(name) => compare_reference_to_key(name, document),
                    None => Ordering::Less,
                }
            } else {
                match document.data().field(&order.field) {
                    Some(value) => component.compare(value),
                    None => Ordering::Less,
                }
            };
            let comparison = order.direction.apply(comparison);
            if comparison != Ordering::Equal {
                return comparison;
            }
        }
        Ordering::Equal
    }

    pub fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let comparison = self.compare_to_document(order_by, document);
        if self.inclusive {
            comparison != Ordering::Greater
        } else {
            comparison == Ordering::Less
        }
    }

    pub fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let comparison = self.compare_to_document(order_by, document);
        if self.inclusive {
            comparison != Ordering::Less
        } else {
            comparison == Ordering::Greater
        }
    }
}

fn compare_reference_to_key(name: &str, document: &MutableDocument) -> Ordering {
    let segments: Vec<&str> = name
        .split('/')
        .skip_while(|segment| *segment != "documents")
        .skip(1)
        .collect();
    let key_segments = document.key().path();
    for (l, r) in segments.iter().zip(key_segments.iter()) {
        match l.cmp(&r.as_str()) {
            Ordering::Equal => continue,
            non_eq => return non_eq,
        }
    }
    segments.len().cmp(&key_segments.len())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitType {
    First,
    Last,
}

/// A user-visible query over one collection, one collection group, or a
/// single document path.
#[derive(Clone, Debug)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<Filter>,
    limit: Option<i32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group(group: impl Into<String>) -> Self {
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(group.into());
        query
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, field: FieldPath, direction: Direction) -> Self {
        self.explicit_order_by.push(OrderBy::new(field, direction));
        self
    }

    pub fn with_limit_to_first(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<i32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    /// A query addressing exactly one document by path.
    pub fn is_document_query(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// Rebases a collection-group query onto one concrete collection,
    /// keeping filters, ordering, limits, and bounds.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            ..self.clone()
        }
    }

    /// This query with the limit removed.
    pub fn without_limit(&self) -> Self {
        Self {
            limit: None,
            limit_type: LimitType::First,
            ..self.clone()
        }
    }

    /// True when every document of the collection matches: no filters, no
    /// limit, no bounds, and at most an explicit key ordering. Such queries
    /// can always reuse cached results without refill checks.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    /// The full ordering: explicit order-bys, then any inequality-filter
    /// fields not already ordered, then the document key, all inheriting the
    /// last explicit direction.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        let last_direction = order_by
            .last()
            .map(|order| order.direction)
            .unwrap_or(Direction::Ascending);

        let mut inequality_fields: Vec<FieldPath> = self
            .filters
            .iter()
            .flat_map(Filter::flattened)
            .filter(|filter| filter.op.is_inequality())
            .map(|filter| filter.field.clone())
            .collect();
        inequality_fields.sort_by(FieldPath::comparator);
        inequality_fields.dedup();
        for field in inequality_fields {
            if field.is_key_field() || order_by.iter().any(|order| order.field == field) {
                continue;
            }
            order_by.push(OrderBy::new(field, last_direction));
        }

        if !order_by.iter().any(|order| order.field.is_key_field()) {
            order_by.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        order_by
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path_and_collection_group(document)
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path_and_collection_group(&self, document: &MutableDocument) -> bool {
        let doc_path = document.key().path();
        if let Some(group) = &self.collection_group {
            document.key().has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if self.path.is_document_path() {
            *doc_path == self.path
        } else {
            // Immediate children only; subcollections do not match.
            self.path.is_prefix_of(doc_path) && doc_path.len() == self.path.len() + 1
        }
    }

    /// A document must define every explicitly ordered field to be compared
    /// against its peers.
    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.normalized_order_by().iter().all(|order| {
            order.field.is_key_field() || document.data().field(&order.field).is_some()
        })
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(bound) = &self.start_at {
            if !bound.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            if !bound.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// A comparator ranking documents by this query's normalized ordering.
    /// Documents missing an ordered field sort arbitrarily among themselves;
    /// `matches` excludes them from views.
    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left, right| {
            for order in &order_by {
                let comparison = if order.field.is_key_field() {
                    left.key().cmp(right.key())
                } else {
                    match (
                        left.data().field(&order.field),
                        right.data().field(&order.field),
                    ) {
                        (Some(l), Some(r)) => l.compare(r),
                        (Some(_), None) => Ordering::Greater,
                        (None, Some(_)) => Ordering::Less,
                        (None, None) => Ordering::Equal,
                    }
                };
                let comparison = order.direction.apply(comparison);
                if comparison != Ordering::Equal {
                    return comparison;
                }
            }
            Ordering::Equal
        })
    }

    /// The wire-level target this query listens to. A limit-to-last query
    /// watches the reversed ordering; results are re-reversed on the way out.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by,
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by: order_by
                    .into_iter()
                    .map(|order| OrderBy::new(order.field, order.direction.flip()))
                    .collect(),
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self
                    .end_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), bound.inclusive)),
                end_at: self
                    .start_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), bound.inclusive)),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "F",
            LimitType::Last => "L",
        };
        format!("{}|lt:{}", self.to_target().canonical_id(), limit_type)
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id() == other.canonical_id()
    }
}

impl Eq for Query {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::filter::FieldOperator;
    use crate::model::{DocumentKey, SnapshotVersion, Timestamp};
    use crate::value::MapValue;

    fn doc(path: &str, entries: &[(&str, FieldValue)]) -> MutableDocument {
        let mut data = MapValue::empty();
        for (name, value) in entries {
            data.insert(name.to_string(), value.clone());
        }
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            SnapshotVersion::MIN,
            data,
        )
    }

    fn field(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    fn collection(path: &str) -> Query {
        Query::at_path(ResourcePath::from_string(path).unwrap())
    }

    #[test]
    fn collection_query_matches_immediate_children_only() {
        let query = collection("rooms");
        assert!(query.matches(&doc("rooms/a", &[])));
        assert!(!query.matches(&doc("rooms/a/messages/m", &[])));
        assert!(!query.matches(&doc("other/a", &[])));
    }

    #[test]
    fn collection_group_query_matches_any_depth() {
        let query = Query::collection_group("messages");
        assert!(query.matches(&doc("rooms/a/messages/m", &[])));
        assert!(query.matches(&doc("messages/m", &[])));
        assert!(!query.matches(&doc("rooms/a", &[])));
    }

    #[test]
    fn order_by_requires_field_presence() {
        let query = collection("rooms").with_order_by(field("rank"), Direction::Ascending);
        assert!(query.matches(&doc("rooms/a", &[("rank", FieldValue::from_integer(1))])));
        assert!(!query.matches(&doc("rooms/a", &[])));
    }

    #[test]
    fn inequality_filter_adds_implicit_order_by() {
        let query = collection("rooms").with_filter(Filter::field(
            field("rank"),
            FieldOperator::GreaterThan,
            FieldValue::from_integer(0),
        ));
        let order_by = query.normalized_order_by();
        assert_eq!(order_by.len(), 2);
        assert_eq!(order_by[0].field, field("rank"));
        assert!(order_by[1].field.is_key_field());
    }

    #[test]
    fn comparator_orders_by_field_then_key() {
        let query = collection("rooms").with_order_by(field("rank"), Direction::Descending);
        let comparator = query.comparator();
        let high = doc("rooms/z", &[("rank", FieldValue::from_integer(9))]);
        let low = doc("rooms/a", &[("rank", FieldValue::from_integer(1))]);
        assert_eq!(comparator(&high, &low), Ordering::Less);
    }

    #[test]
    fn limit_to_last_target_flips_order_and_bounds() {
        let query = collection("rooms")
            .with_order_by(field("rank"), Direction::Ascending)
            .with_limit_to_last(3)
            .ending_at(Bound::new(vec![FieldValue::from_integer(10)], true));
        let target = query.to_target();
        assert_eq!(target.order_by[0].direction, Direction::Descending);
        assert!(target.start_at.is_some());
        assert!(target.end_at.is_none());
        assert_eq!(target.limit, Some(3));
    }

    #[test]
    fn bounds_filter_matching_documents() {
        let query = collection("rooms")
            .with_order_by(field("rank"), Direction::Ascending)
            .starting_at(Bound::new(vec![FieldValue::from_integer(5)], false));
        assert!(query.matches(&doc("rooms/a", &[("rank", FieldValue::from_integer(6))])));
        assert!(!query.matches(&doc("rooms/b", &[("rank", FieldValue::from_integer(5))])));
    }

    #[test]
    fn canonical_id_distinguishes_limit_direction() {
        let first = collection("rooms").with_limit_to_first(1);
        let last = collection("rooms").with_limit_to_last(1);
        assert_ne!(first.canonical_id(), last.canonical_id());
        assert_eq!(first, collection("rooms").with_limit_to_first(1));
    }

    #[test]
    fn document_query_detection() {
        assert!(collection("rooms/a").is_document_query());
        assert!(!collection("rooms").is_document_query());
        assert!(collection("rooms").matches_all_documents());
    }
}
