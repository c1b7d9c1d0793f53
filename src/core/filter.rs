use std::cmp::Ordering;

use crate::model::{DocumentKey, FieldPath, MutableDocument};
use crate::value::{FieldValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    ArrayContainsAny,
    NotIn,
}

impl FieldOperator {
    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FieldOperator::LessThan
                | FieldOperator::LessThanOrEqual
                | FieldOperator::GreaterThan
                | FieldOperator::GreaterThanOrEqual
                | FieldOperator::NotEqual
                | FieldOperator::NotIn
        )
    }

    /// The token used in canonical target ids.
    pub fn canonical_token(&self) -> &'static str {
        match self {
            FieldOperator::LessThan => "<",
            FieldOperator::LessThanOrEqual => "<=",
            FieldOperator::Equal => "==",
            FieldOperator::NotEqual => "!=",
            FieldOperator::GreaterThan => ">",
            FieldOperator::GreaterThanOrEqual => ">=",
            FieldOperator::ArrayContains => "array-contains",
            FieldOperator::In => "in",
            FieldOperator::ArrayContainsAny => "array-contains-any",
            FieldOperator::NotIn => "not-in",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: FieldOperator,
    pub value: FieldValue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompositeFilter {
    pub op: CompositeOperator,
    pub filters: Vec<Filter>,
}

/// A query constraint: either a single field comparison or a boolean
/// combination of nested filters.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl Filter {
    pub fn field(field: FieldPath, op: FieldOperator, value: FieldValue) -> Self {
        Filter::Field(FieldFilter { field, op, value })
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter {
            op: CompositeOperator::And,
            filters,
        })
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter {
            op: CompositeOperator::Or,
            filters,
        })
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite(composite) => {
                let mut results = composite
                    .filters
                    .iter()
                    .map(|filter| filter.matches(document));
                match composite.op {
                    CompositeOperator::And => results.all(|matched| matched),
                    CompositeOperator::Or => results.any(|matched| matched),
                }
            }
        }
    }

    /// All field filters in this tree, in declaration order.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite(composite) => composite
                .filters
                .iter()
                .flat_map(Filter::flattened)
                .collect(),
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => format!(
                "{}{}{}",
                filter.field.canonical_string(),
                filter.op.canonical_token(),
                filter.value.canonical_id()
            ),
            Filter::Composite(composite) => {
                let op = match composite.op {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                let parts: Vec<String> = composite
                    .filters
                    .iter()
                    .map(Filter::canonical_id)
                    .collect();
                format!("{}({})", op, parts.join(","))
            }
        }
    }
}

impl FieldFilter {
    pub fn matches(&self, document: &MutableDocument) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(document.key());
        }
        let value = document.data().field(&self.field);
        match self.op {
            FieldOperator::ArrayContains => match value.map(FieldValue::kind) {
                Some(ValueKind::Array(array)) => array.contains(&self.value),
                _ => false,
            },
            FieldOperator::ArrayContainsAny => {
                match (value.map(FieldValue::kind), self.value.kind()) {
                    (Some(ValueKind::Array(array)), ValueKind::Array(needles)) => needles
                        .values()
                        .iter()
                        .any(|needle| array.contains(needle)),
                    _ => false,
                }
            }
            FieldOperator::In => match self.value.kind() {
                ValueKind::Array(candidates) => {
                    value.is_some_and(|value| candidates.contains(value))
                }
                _ => false,
            },
            FieldOperator::NotIn => match self.value.kind() {
                ValueKind::Array(candidates) => {
                    if candidates.contains(&FieldValue::null()) {
                        return false;
                    }
                    value.is_some_and(|value| {
                        !value.is_null() && !candidates.contains(value)
                    })
                }
                _ => false,
            },
            FieldOperator::NotEqual => {
                value.is_some_and(|value| {
                    !value.is_null() && self.matches_comparison(value.compare(&self.value))
                })
            }
            _ => value.is_some_and(|value| {
                // Relational comparisons only apply within one type.
                value.type_order() == self.value.type_order()
                    && self.matches_comparison(value.compare(&self.value))
            }),
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        match self.op {
            FieldOperator::In => match self.value.kind() {
                ValueKind::Array(candidates) => candidates
                    .values()
                    .iter()
                    .any(|candidate| reference_matches_key(candidate, key)),
                _ => false,
            },
            FieldOperator::NotIn => match self.value.kind() {
                ValueKind::Array(candidates) => !candidates
                    .values()
                    .iter()
                    .any(|candidate| reference_matches_key(candidate, key)),
                _ => false,
            },
            _ => match self.value.kind() {
                ValueKind::Reference(name) => {
                    let comparison = compare_key_to_reference(key, name);
                    self.matches_comparison(comparison)
                }
                _ => false,
            },
        }
    }

    fn matches_comparison(&self, comparison: Ordering) -> bool {
        match self.op {
            FieldOperator::LessThan => comparison == Ordering::Less,
            FieldOperator::LessThanOrEqual => comparison != Ordering::Greater,
            FieldOperator::Equal => comparison == Ordering::Equal,
            FieldOperator::NotEqual => comparison != Ordering::Equal,
            FieldOperator::GreaterThan => comparison == Ordering::Greater,
            FieldOperator::GreaterThanOrEqual => comparison != Ordering::Less,
            _ => false,
        }
    }
}

fn reference_matches_key(candidate: &FieldValue, key: &DocumentKey) -> bool {
    matches!(candidate.kind(), ValueKind::Reference(name)
        if compare_key_to_reference(key, name) == Ordering::Equal)
}

/// Compares a local key against a full resource name by its trailing
/// document-path segments.
fn compare_key_to_reference(key: &DocumentKey, name: &str) -> Ordering {
    let key_segments: Vec<&str> = key.path().iter().map(String::as_str).collect();
    let reference_segments: Vec<&str> = name
        .split('/')
        .skip_while(|segment| *segment != "documents")
        .skip(1)
        .collect();
    let reference_segments = if reference_segments.is_empty() {
        name.split('/').collect()
    } else {
        reference_segments
    };
    key_segments
        .iter()
        .zip(reference_segments.iter())
        .map(|(l, r)| l.cmp(r))
        .find(|ordering| *ordering != Ordering::Equal)
        .unwrap_or_else(|| key_segments.len().cmp(&reference_segments.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SnapshotVersion, Timestamp};
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

    fn path(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    #[test]
    fn relational_filters_require_matching_type() {
        let filter = Filter::field(
            path("count"),
            FieldOperator::GreaterThan,
            FieldValue::from_integer(5),
        );
        assert!(filter.matches(&doc("c/a", &[("count", FieldValue::from_integer(6))])));
        assert!(filter.matches(&doc("c/a", &[("count", FieldValue::from_double(5.5))])));
        assert!(!filter.matches(&doc("c/a", &[("count", FieldValue::from_string("6"))])));
        assert!(!filter.matches(&doc("c/a", &[])));
    }

    #[test]
    fn not_equal_ignores_missing_and_null() {
        let filter = Filter::field(
            path("tag"),
            FieldOperator::NotEqual,
            FieldValue::from_string("x"),
        );
        assert!(filter.matches(&doc("c/a", &[("tag", FieldValue::from_string("y"))])));
        assert!(filter.matches(&doc("c/a", &[("tag", FieldValue::from_integer(1))])));
        assert!(!filter.matches(&doc("c/a", &[("tag", FieldValue::null())])));
        assert!(!filter.matches(&doc("c/a", &[])));
    }

    #[test]
    fn array_contains_any_intersects() {
        let filter = Filter::field(
            path("tags"),
            FieldOperator::ArrayContainsAny,
            FieldValue::from_array(vec![
                FieldValue::from_string("a"),
                FieldValue::from_string("b"),
            ]),
        );
        let matching = doc(
            "c/a",
            &[(
                "tags",
                FieldValue::from_array(vec![FieldValue::from_string("b")]),
            )],
        );
        let missing = doc(
            "c/a",
            &[(
                "tags",
                FieldValue::from_array(vec![FieldValue::from_string("z")]),
            )],
        );
        assert!(filter.matches(&matching));
        assert!(!filter.matches(&missing));
    }

    #[test]
    fn not_in_with_null_candidate_matches_nothing() {
        let filter = Filter::field(
            path("tag"),
            FieldOperator::NotIn,
            FieldValue::from_array(vec![FieldValue::null()]),
        );
        assert!(!filter.matches(&doc("c/a", &[("tag", FieldValue::from_string("y"))])));
    }

    #[test]
    fn key_field_filters_compare_references() {
        let filter = Filter::field(
            FieldPath::document_id(),
            FieldOperator::Equal,
            FieldValue::from_reference("projects/p/databases/d/documents/c/a"),
        );
        assert!(filter.matches(&doc("c/a", &[])));
        assert!(!filter.matches(&doc("c/b", &[])));
    }

    #[test]
    fn composite_or_short_circuits() {
        let filter = Filter::or(vec![
            Filter::field(path("a"), FieldOperator::Equal, FieldValue::from_integer(1)),
            Filter::field(path("b"), FieldOperator::Equal, FieldValue::from_integer(2)),
        ]);
        assert!(filter.matches(&doc("c/a", &[("b", FieldValue::from_integer(2))])));
        assert!(!filter.matches(&doc("c/a", &[("b", FieldValue::from_integer(3))])));
    }

    #[test]
    fn canonical_ids_are_stable() {
        let filter = Filter::and(vec![
            Filter::field(path("a"), FieldOperator::Equal, FieldValue::from_integer(1)),
            Filter::field(
                path("b"),
                FieldOperator::ArrayContains,
                FieldValue::from_string("x"),
            ),
        ]);
        assert_eq!(filter.canonical_id(), "and(a==1,barray-containsx)");
    }
}
