use crate::model::{FieldPath, Timestamp};
use crate::value::{server_timestamps, FieldValue, ValueKind};

/// A transform applied to one field as part of a mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FieldValue>),
    ArrayRemove(Vec<FieldValue>),
    /// Operand is an integer or double value.
    NumericIncrement(FieldValue),
}

impl TransformOperation {
    /// The value the local view shows before the backend acknowledges the
    /// transform.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FieldValue>,
        local_write_time: Timestamp,
    ) -> FieldValue {
        match self {
            TransformOperation::ServerTimestamp => {
                server_timestamps::server_timestamp(local_write_time, previous)
            }
            TransformOperation::ArrayUnion(elements) => apply_array_union(elements, previous),
            TransformOperation::ArrayRemove(elements) => apply_array_remove(elements, previous),
            TransformOperation::NumericIncrement(operand) => apply_increment(operand, previous),
        }
    }

    /// The post-acknowledge value. Array transforms are recomputed locally
    /// because the backend reports no result for them; the other transforms
    /// take the backend's value verbatim.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FieldValue>,
        transform_result: FieldValue,
    ) -> FieldValue {
        match self {
            TransformOperation::ArrayUnion(elements) => apply_array_union(elements, previous),
            TransformOperation::ArrayRemove(elements) => apply_array_remove(elements, previous),
            _ => transform_result,
        }
    }

    /// The value this transform must observe as its starting point for the
    /// application to be repeatable, or `None` when any starting point works.
    /// Only numeric increments are non-idempotent: they pin the existing
    /// number, or integer zero when the field is absent or non-numeric.
    pub fn compute_base_value(&self, previous: Option<&FieldValue>) -> Option<FieldValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FieldValue::from_integer(0),
            }),
            _ => None,
        }
    }
}

fn apply_array_union(elements: &[FieldValue], previous: Option<&FieldValue>) -> FieldValue {
    let mut values: Vec<FieldValue> = match previous.and_then(FieldValue::as_array) {
        Some(array) => array.values().to_vec(),
        None => Vec::new(),
    };
    for element in elements {
        if !values.iter().any(|existing| existing == element) {
            values.push(element.clone());
        }
    }
    FieldValue::from_array(values)
}

fn apply_array_remove(elements: &[FieldValue], previous: Option<&FieldValue>) -> FieldValue {
    let values: Vec<FieldValue> = match previous.and_then(FieldValue::as_array) {
        Some(array) => array
            .values()
            .iter()
            .filter(|existing| !elements.iter().any(|element| element == *existing))
            .cloned()
            .collect(),
        None => Vec::new(),
    };
    FieldValue::from_array(values)
}

fn apply_increment(operand: &FieldValue, previous: Option<&FieldValue>) -> FieldValue {
    let base = match previous {
        Some(value) if value.is_number() => value.clone(),
        _ => FieldValue::from_integer(0),
    };
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(base), ValueKind::Integer(operand)) => {
            FieldValue::from_integer(base.saturating_add(*operand))
        }
        _ => {
            let sum = base.as_number().unwrap_or(0.0) + operand.as_number().unwrap_or(0.0);
            FieldValue::from_double(sum)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_timestamp_keeps_previous_value() {
        let op = TransformOperation::ServerTimestamp;
        let previous = FieldValue::from_string("before");
        let pending = op.apply_to_local_view(Some(&previous), Timestamp::new(5, 0));
        assert!(server_timestamps::is_server_timestamp(&pending));
        assert_eq!(server_timestamps::previous_value(&pending), Some(&previous));
    }

    #[test]
    fn array_union_skips_duplicates() {
        let op = TransformOperation::ArrayUnion(vec![
            FieldValue::from_integer(1),
            FieldValue::from_integer(3),
        ]);
        let previous = FieldValue::from_array(vec![
            FieldValue::from_integer(1),
            FieldValue::from_integer(2),
        ]);
        let result = op.apply_to_local_view(Some(&previous), Timestamp::new(0, 0));
        let values = result.as_array().unwrap();
        assert_eq!(values.len(), 3);
        assert!(values.contains(&FieldValue::from_integer(3)));
    }

    #[test]
    fn array_remove_filters_by_value_equality() {
        let op = TransformOperation::ArrayRemove(vec![FieldValue::from_integer(2)]);
        let previous = FieldValue::from_array(vec![
            FieldValue::from_integer(1),
            FieldValue::from_integer(2),
            FieldValue::from_integer(2),
        ]);
        let result = op.apply_to_local_view(Some(&previous), Timestamp::new(0, 0));
        assert_eq!(result.as_array().unwrap().values().len(), 1);
    }

    #[test]
    fn array_transform_on_non_array_starts_empty() {
        let op = TransformOperation::ArrayUnion(vec![FieldValue::from_integer(1)]);
        let previous = FieldValue::from_string("scalar");
        let result = op.apply_to_local_view(Some(&previous), Timestamp::new(0, 0));
        assert_eq!(result.as_array().unwrap().values().len(), 1);
    }

    #[test]
    fn integer_increment_saturates() {
        let op = TransformOperation::NumericIncrement(FieldValue::from_integer(1));
        let previous = FieldValue::from_integer(i64::MAX);
        let result = op.apply_to_local_view(Some(&previous), Timestamp::new(0, 0));
        assert_eq!(result, FieldValue::from_integer(i64::MAX));
    }

    #[test]
    fn mixed_increment_widens_to_double() {
        let op = TransformOperation::NumericIncrement(FieldValue::from_double(0.5));
        let previous = FieldValue::from_integer(1);
        let result = op.apply_to_local_view(Some(&previous), Timestamp::new(0, 0));
        assert_eq!(result, FieldValue::from_double(1.5));
    }

    #[test]
    fn increment_base_value_pins_existing_number() {
        let op = TransformOperation::NumericIncrement(FieldValue::from_integer(1));
        assert_eq!(
            op.compute_base_value(Some(&FieldValue::from_double(2.0))),
            Some(FieldValue::from_double(2.0))
        );
        assert_eq!(
            op.compute_base_value(Some(&FieldValue::from_string("x"))),
            Some(FieldValue::from_integer(0))
        );
        assert_eq!(op.compute_base_value(None), Some(FieldValue::from_integer(0)));
        assert_eq!(
            TransformOperation::ServerTimestamp.compute_base_value(None),
            None
        );
    }
}
