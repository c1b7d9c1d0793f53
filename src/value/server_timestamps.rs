//! Pending server timestamps.
//!
//! While a server-timestamp transform is unacknowledged, the local view holds
//! a sentinel-shaped map recording the local write time and, when known, the
//! field's previous value. Snapshots can then surface either an estimate or
//! the previous value without waiting for the backend.

use crate::model::Timestamp;
use crate::value::{FieldValue, MapValue, TYPE_KEY};

const SERVER_TIMESTAMP_SENTINEL: &str = "server_timestamp";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";

pub fn is_server_timestamp(value: &FieldValue) -> bool {
    let Some(map) = value.as_map() else {
        return false;
    };
    matches!(
        map.get(TYPE_KEY).and_then(FieldValue::as_string),
        Some(SERVER_TIMESTAMP_SENTINEL)
    )
}

/// Builds the sentinel for an unacknowledged server-timestamp transform. When
/// the previous value is itself a pending server timestamp, its own previous
/// value is carried forward instead of nesting sentinels.
pub fn server_timestamp(local_write_time: Timestamp, previous: Option<&FieldValue>) -> FieldValue {
    let mut map = MapValue::empty();
    map.insert(
        TYPE_KEY.to_string(),
        FieldValue::from_string(SERVER_TIMESTAMP_SENTINEL),
    );
    map.insert(
        LOCAL_WRITE_TIME_KEY.to_string(),
        FieldValue::from_timestamp(local_write_time),
    );
    let previous = match previous {
        Some(value) if is_server_timestamp(value) => previous_value(value),
        other => other,
    };
    if let Some(previous) = previous {
        map.insert(PREVIOUS_VALUE_KEY.to_string(), previous.clone());
    }
    FieldValue::from_map_value(map)
}

pub fn local_write_time(value: &FieldValue) -> Option<Timestamp> {
    value
        .as_map()?
        .get(LOCAL_WRITE_TIME_KEY)?
        .as_timestamp()
}

/// The field's value before the pending transform, unwrapping chained
/// sentinels. `None` when the field did not exist.
pub fn previous_value(value: &FieldValue) -> Option<&FieldValue> {
    let previous = value.as_map()?.get(PREVIOUS_VALUE_KEY)?;
    if is_server_timestamp(previous) {
        previous_value(previous)
    } else {
        Some(previous)
    }
}
