use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::model::{GeoPoint, Timestamp};
use crate::value::{server_timestamps, ArrayValue, BytesValue, MapValue};

/// Map key that flags a sentinel-shaped map value.
pub const TYPE_KEY: &str = "__type__";
/// Sentinel marking a map as an embedding vector; its components live under
/// [`VECTOR_VALUES_KEY`].
pub const VECTOR_TYPE_SENTINEL: &str = "__vector__";
pub const VECTOR_VALUES_KEY: &str = "value";

pub const TYPE_ORDER_NULL: i32 = 0;
pub const TYPE_ORDER_BOOLEAN: i32 = 1;
pub const TYPE_ORDER_NUMBER: i32 = 2;
pub const TYPE_ORDER_TIMESTAMP: i32 = 3;
pub const TYPE_ORDER_SERVER_TIMESTAMP: i32 = 4;
pub const TYPE_ORDER_STRING: i32 = 5;
pub const TYPE_ORDER_BYTES: i32 = 6;
pub const TYPE_ORDER_REFERENCE: i32 = 7;
pub const TYPE_ORDER_GEO_POINT: i32 = 8;
pub const TYPE_ORDER_ARRAY: i32 = 9;
pub const TYPE_ORDER_VECTOR: i32 = 10;
pub const TYPE_ORDER_MAP: i32 = 11;

/// A single value stored in a document field.
///
/// Equality distinguishes integers from doubles and `0.0` from `-0.0`, while
/// `NaN` equals `NaN`. Ordering first ranks values by type, then within the
/// numeric type compares integers and doubles on the number line with `NaN`
/// smaller than everything else.
#[derive(Clone, Debug)]
pub struct FieldValue {
    kind: ValueKind,
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FieldValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    /// `path` is the full document name, `projects/{p}/databases/{d}/documents/{path}`.
    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FieldValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_array_value(value: ArrayValue) -> Self {
        Self {
            kind: ValueKind::Array(value),
        }
    }

    pub fn from_map(map: BTreeMap<String, FieldValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(value: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(value),
        }
    }

    pub fn empty_map() -> Self {
        Self {
            kind: ValueKind::Map(MapValue::empty()),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut ValueKind {
        &mut self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(d) if d.is_nan())
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self.kind, ValueKind::Map(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ValueKind::Array(_))
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match &self.kind {
            ValueKind::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match &self.kind {
            ValueKind::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match &self.kind {
            ValueKind::Double(value) => Some(*value),
            _ => None,
        }
    }

    /// Integer or double widened to `f64`.
    pub fn as_number(&self) -> Option<f64> {
        match &self.kind {
            ValueKind::Integer(value) => Some(*value as f64),
            ValueKind::Double(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match &self.kind {
            ValueKind::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Reference(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(value) => Some(value),
            _ => None,
        }
    }

    /// Relative position of this value's type in the cross-type ordering.
    /// Sentinel-shaped maps (pending server timestamps, vectors) rank as their
    /// own types rather than as plain maps.
    pub fn type_order(&self) -> i32 {
        match &self.kind {
            ValueKind::Null => TYPE_ORDER_NULL,
            ValueKind::Boolean(_) => TYPE_ORDER_BOOLEAN,
            ValueKind::Integer(_) | ValueKind::Double(_) => TYPE_ORDER_NUMBER,
            ValueKind::Timestamp(_) => TYPE_ORDER_TIMESTAMP,
            ValueKind::String(_) => TYPE_ORDER_STRING,
            ValueKind::Bytes(_) => TYPE_ORDER_BYTES,
            ValueKind::Reference(_) => TYPE_ORDER_REFERENCE,
            ValueKind::GeoPoint(_) => TYPE_ORDER_GEO_POINT,
            ValueKind::Array(_) => TYPE_ORDER_ARRAY,
            ValueKind::Map(map) => {
                if server_timestamps::is_server_timestamp(self) {
                    TYPE_ORDER_SERVER_TIMESTAMP
                } else if is_vector_map(map) {
                    TYPE_ORDER_VECTOR
                } else {
                    TYPE_ORDER_MAP
                }
            }
        }
    }

    pub fn compare(&self, other: &FieldValue) -> Ordering {
        let left_order = self.type_order();
        let right_order = other.type_order();
        if left_order != right_order {
            return left_order.cmp(&right_order);
        }
        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
            (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
            (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
            (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
            (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
            (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
            (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.cmp(r),
            (ValueKind::Array(l), ValueKind::Array(r)) => compare_arrays(l, r),
            (ValueKind::Map(l), ValueKind::Map(r)) => {
                if left_order == TYPE_ORDER_SERVER_TIMESTAMP {
                    compare_server_timestamps(self, other)
                } else if left_order == TYPE_ORDER_VECTOR {
                    compare_vectors(l, r)
                } else {
                    compare_maps(l, r)
                }
            }
            _ => compare_numbers(&self.kind, &other.kind),
        }
    }

    /// A stable textual form used to compare and name targets. Not a
    /// serialization format.
    pub fn canonical_id(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => value.to_string(),
            ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
            ValueKind::String(value) => value.clone(),
            ValueKind::Bytes(value) => value.to_base64(),
            ValueKind::Reference(value) => value.clone(),
            ValueKind::GeoPoint(value) => {
                format!("geo({},{})", value.latitude(), value.longitude())
            }
            ValueKind::Array(value) => {
                let elements: Vec<String> =
                    value.values().iter().map(FieldValue::canonical_id).collect();
                format!("[{}]", elements.join(","))
            }
            ValueKind::Map(value) => {
                let entries: Vec<String> = value
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{}:{}", key, value.canonical_id()))
                    .collect();
                format!("{{{}}}", entries.join(","))
            }
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        let left_order = self.type_order();
        if left_order != other.type_order() {
            return false;
        }
        if left_order == TYPE_ORDER_SERVER_TIMESTAMP {
            return server_timestamps::local_write_time(self)
                == server_timestamps::local_write_time(other);
        }
        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
            (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
            (ValueKind::Double(l), ValueKind::Double(r)) => {
                (l.is_nan() && r.is_nan()) || l.to_bits() == r.to_bits()
            }
            (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
            (ValueKind::String(l), ValueKind::String(r)) => l == r,
            (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
            (ValueKind::Reference(l), ValueKind::Reference(r)) => l == r,
            (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l == r,
            (ValueKind::Array(l), ValueKind::Array(r)) => l == r,
            (ValueKind::Map(l), ValueKind::Map(r)) => l == r,
            _ => false,
        }
    }
}

fn is_vector_map(map: &MapValue) -> bool {
    matches!(
        map.get(TYPE_KEY).map(FieldValue::kind),
        Some(ValueKind::String(marker)) if marker == VECTOR_TYPE_SENTINEL
    )
}

fn compare_numbers(left: &ValueKind, right: &ValueKind) -> Ordering {
    if let (ValueKind::Integer(l), ValueKind::Integer(r)) = (left, right) {
        return l.cmp(r);
    }
    let l = match left {
        ValueKind::Integer(value) => *value as f64,
        ValueKind::Double(value) => *value,
        _ => return Ordering::Equal,
    };
    let r = match right {
        ValueKind::Integer(value) => *value as f64,
        ValueKind::Double(value) => *value,
        _ => return Ordering::Equal,
    };
    if l < r {
        Ordering::Less
    } else if l > r {
        Ordering::Greater
    } else if l == r {
        Ordering::Equal
    } else if l.is_nan() {
        if r.is_nan() {
            Ordering::Equal
        } else {
            Ordering::Less
        }
    } else {
        Ordering::Greater
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_segments: Vec<&str> = left.split('/').collect();
    let right_segments: Vec<&str> = right.split('/').collect();
    for (l, r) in left_segments.iter().zip(right_segments.iter()) {
        match l.cmp(r) {
            Ordering::Equal => continue,
            non_eq => return non_eq,
        }
    }
    left_segments.len().cmp(&right_segments.len())
}

fn compare_server_timestamps(left: &FieldValue, right: &FieldValue) -> Ordering {
    match (
        server_timestamps::local_write_time(left),
        server_timestamps::local_write_time(right),
    ) {
        (Some(l), Some(r)) => l.cmp(&r),
        (l, r) => l.is_some().cmp(&r.is_some()),
    }
}

fn compare_arrays(left: &ArrayValue, right: &ArrayValue) -> Ordering {
    for (l, r) in left.values().iter().zip(right.values().iter()) {
        match l.compare(r) {
            Ordering::Equal => continue,
            non_eq => return non_eq,
        }
    }
    left.len().cmp(&right.len())
}

fn compare_vectors(left: &MapValue, right: &MapValue) -> Ordering {
    let empty = ArrayValue::empty();
    let left_values = left
        .get(VECTOR_VALUES_KEY)
        .and_then(FieldValue::as_array)
        .unwrap_or(&empty);
    let right_values = right
        .get(VECTOR_VALUES_KEY)
        .and_then(FieldValue::as_array)
        .unwrap_or(&empty);
    left_values
        .len()
        .cmp(&right_values.len())
        .then_with(|| compare_arrays(left_values, right_values))
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((left_key, left_value), (right_key, right_value)) in
        left.fields().iter().zip(right.fields().iter())
    {
        let by_key = left_key.cmp(right_key);
        if by_key != Ordering::Equal {
            return by_key;
        }
        let by_value = left_value.compare(right_value);
        if by_value != Ordering::Equal {
            return by_value;
        }
    }
    left.len().cmp(&right.len())
}
