mod array_value;
mod bytes_value;
mod map_value;
pub mod server_timestamps;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use value::{
    FieldValue, ValueKind, TYPE_KEY, TYPE_ORDER_ARRAY, TYPE_ORDER_BOOLEAN, TYPE_ORDER_BYTES,
    TYPE_ORDER_GEO_POINT, TYPE_ORDER_MAP, TYPE_ORDER_NULL, TYPE_ORDER_NUMBER,
    TYPE_ORDER_REFERENCE, TYPE_ORDER_SERVER_TIMESTAMP, TYPE_ORDER_STRING, TYPE_ORDER_TIMESTAMP,
    TYPE_ORDER_VECTOR, VECTOR_TYPE_SENTINEL, VECTOR_VALUES_KEY,
};
