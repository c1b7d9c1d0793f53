use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::core::{
    Bound, CompositeOperator, Direction, FieldOperator, Filter, OrderBy, Target,
};
use crate::error::{invalid_argument, SyncResult};
use crate::local::TargetData;
use crate::model::{
    DatabaseId, DocumentKey, FieldPath, GeoPoint, MutableDocument, ResourcePath, SnapshotVersion,
    TargetId, Timestamp,
};
use crate::mutation::{FieldTransform, Mutation, MutationResult, Precondition, TransformOperation};
use crate::value::{BytesValue, FieldValue, MapValue, ValueKind};

/// Response to one message on the write stream. The handshake reply carries
/// only a stream token; replies to writes also carry the commit version and
/// one result per mutation.
#[derive(Debug, Clone)]
pub struct WriteResponse {
    pub stream_token: BytesValue,
    pub commit_version: Option<SnapshotVersion>,
    pub results: Vec<MutationResult>,
}

/// Translates between the in-memory model and the JSON mapping of the
/// backend's proto API. All resource names are scoped to one database.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.database_id.project_id(),
            self.database_id.database()
        )
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!(
            "{}/documents/{}",
            self.database_name(),
            key.path().canonical_string()
        )
    }

    fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            format!("{}/documents", self.database_name())
        } else {
            format!("{}/documents/{}", self.database_name(), path.canonical_string())
        }
    }

    /// Parses a full resource name back into a document key, verifying it
    /// belongs to this database.
    pub fn document_key_from_name(&self, name: &str) -> SyncResult<DocumentKey> {
        let segments: Vec<&str> = name.split('/').collect();
        if segments.len() < 5
            || segments[0] != "projects"
            || segments[2] != "databases"
            || segments[4] != "documents"
        {
            return Err(invalid_argument(format!(
                "Resource name is not a document name: {name}"
            )));
        }
        if segments[1] != self.database_id.project_id()
            || segments[3] != self.database_id.database()
        {
            return Err(invalid_argument(format!(
                "Document name {name} does not belong to database {}",
                self.database_name()
            )));
        }
        DocumentKey::from_segments(segments[5..].iter().copied())
    }

    pub fn encode_timestamp(&self, timestamp: Timestamp) -> String {
        let datetime = Utc
            .timestamp_opt(timestamp.seconds, timestamp.nanos.max(0) as u32)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("zero timestamp"));
        datetime.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn decode_timestamp_string(&self, value: &str) -> SyncResult<Timestamp> {
        let datetime = DateTime::parse_from_rfc3339(value)
            .map_err(|err| invalid_argument(format!("Invalid timestamp {value}: {err}")))?
            .with_timezone(&Utc);
        Ok(Timestamp::new(
            datetime.timestamp(),
            datetime.timestamp_subsec_nanos() as i32,
        ))
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> String {
        self.encode_timestamp(version.timestamp())
    }

    pub fn decode_version(&self, value: &str) -> SyncResult<SnapshotVersion> {
        Ok(SnapshotVersion::new(self.decode_timestamp_string(value)?))
    }

    pub fn encode_value(&self, value: &FieldValue) -> JsonValue {
        match value.kind() {
            ValueKind::Null => json!({ "nullValue": null }),
            ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
            ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
            ValueKind::Double(double) => json!({ "doubleValue": double }),
            ValueKind::Timestamp(timestamp) => {
                json!({ "timestampValue": self.encode_timestamp(*timestamp) })
            }
            ValueKind::String(string) => json!({ "stringValue": string }),
            ValueKind::Bytes(bytes) => {
                json!({ "bytesValue": BASE64_STANDARD.encode(bytes.as_slice()) })
            }
            ValueKind::Reference(name) => json!({ "referenceValue": name }),
            ValueKind::GeoPoint(point) => json!({
                "geoPointValue": {
                    "latitude": point.latitude(),
                    "longitude": point.longitude(),
                }
            }),
            ValueKind::Array(array) => {
                let values: Vec<JsonValue> = array
                    .values()
                    .iter()
                    .map(|entry| self.encode_value(entry))
                    .collect();
                json!({ "arrayValue": { "values": values } })
            }
            ValueKind::Map(map) => json!({ "mapValue": self.encode_map_value(map) }),
        }
    }

    fn encode_map_value(&self, map: &MapValue) -> JsonValue {
        let mut fields = serde_json::Map::new();
        for (name, value) in map.fields() {
            fields.insert(name.clone(), self.encode_value(value));
        }
        json!({ "fields": fields })
    }

    pub fn decode_value(&self, value: &JsonValue) -> SyncResult<FieldValue> {
        if value.get("nullValue").is_some() {
            return Ok(FieldValue::null());
        }
        if let Some(boolean) = value.get("booleanValue") {
            let boolean = boolean
                .as_bool()
                .ok_or_else(|| invalid_argument("booleanValue must be a bool"))?;
            return Ok(FieldValue::from_bool(boolean));
        }
        if let Some(integer) = value.get("integerValue") {
            let integer = match integer {
                JsonValue::String(text) => text
                    .parse::<i64>()
                    .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
                JsonValue::Number(number) => number
                    .as_i64()
                    .ok_or_else(|| invalid_argument("integerValue out of range"))?,
                _ => return Err(invalid_argument("integerValue must be a string or number")),
            };
            return Ok(FieldValue::from_integer(integer));
        }
        if let Some(double) = value.get("doubleValue") {
            let double = match double {
                JsonValue::Number(number) => number
                    .as_f64()
                    .ok_or_else(|| invalid_argument("doubleValue out of range"))?,
                JsonValue::String(text) => match text.as_str() {
                    "NaN" => f64::NAN,
                    "Infinity" => f64::INFINITY,
                    "-Infinity" => f64::NEG_INFINITY,
                    other => other
                        .parse::<f64>()
                        .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
                },
                _ => return Err(invalid_argument("doubleValue must be a number or string")),
            };
            return Ok(FieldValue::from_double(double));
        }
        if let Some(timestamp) = value.get("timestampValue") {
            let timestamp = timestamp
                .as_str()
                .ok_or_else(|| invalid_argument("timestampValue must be a string"))?;
            return Ok(FieldValue::from_timestamp(
                self.decode_timestamp_string(timestamp)?,
            ));
        }
        if let Some(string) = value.get("stringValue") {
            let string = string
                .as_str()
                .ok_or_else(|| invalid_argument("stringValue must be a string"))?;
            return Ok(FieldValue::from_string(string));
        }
        if let Some(bytes) = value.get("bytesValue") {
            let bytes = bytes
                .as_str()
                .ok_or_else(|| invalid_argument("bytesValue must be a string"))?;
            let decoded = BytesValue::from_base64(bytes)
                .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
            return Ok(FieldValue::from_bytes(decoded));
        }
        if let Some(reference) = value.get("referenceValue") {
            let reference = reference
                .as_str()
                .ok_or_else(|| invalid_argument("referenceValue must be a string"))?;
            return Ok(FieldValue::from_reference(reference));
        }
        if let Some(point) = value.get("geoPointValue") {
            let latitude = point.get("latitude").and_then(JsonValue::as_f64).unwrap_or(0.0);
            let longitude = point
                .get("longitude")
                .and_then(JsonValue::as_f64)
                .unwrap_or(0.0);
            return Ok(FieldValue::from_geo_point(GeoPoint::new(latitude, longitude)));
        }
        if let Some(array) = value.get("arrayValue") {
            let mut values = Vec::new();
            if let Some(entries) = array.get("values").and_then(JsonValue::as_array) {
                for entry in entries {
                    values.push(self.decode_value(entry)?);
                }
            }
            return Ok(FieldValue::from_array(values));
        }
        if let Some(map) = value.get("mapValue") {
            return Ok(FieldValue::from_map_value(self.decode_map_fields(map)?));
        }
        Err(invalid_argument(format!("Unknown value kind: {value}")))
    }

    fn decode_map_fields(&self, value: &JsonValue) -> SyncResult<MapValue> {
        let mut map = MapValue::empty();
        if let Some(fields) = value.get("fields").and_then(JsonValue::as_object) {
            for (name, entry) in fields {
                map.insert(name.clone(), self.decode_value(entry)?);
            }
        }
        Ok(map)
    }

    pub fn encode_document_fields(&self, data: &MapValue) -> JsonValue {
        let mut fields = serde_json::Map::new();
        for (name, value) in data.fields() {
            fields.insert(name.clone(), self.encode_value(value));
        }
        JsonValue::Object(fields)
    }

    /// Decodes the `fields` object of a document message, if present.
    pub fn decode_document_fields(&self, document: &JsonValue) -> SyncResult<Option<MapValue>> {
        match document.get("fields") {
            Some(fields) => {
                let mut map = MapValue::empty();
                if let Some(entries) = fields.as_object() {
                    for (name, entry) in entries {
                        map.insert(name.clone(), self.decode_value(entry)?);
                    }
                }
                Ok(Some(map))
            }
            None => Ok(None),
        }
    }

    pub fn decode_document(&self, document: &JsonValue) -> SyncResult<MutableDocument> {
        let name = document
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing a name"))?;
        let key = self.document_key_from_name(name)?;
        let data = self
            .decode_document_fields(document)?
            .unwrap_or_else(MapValue::empty);
        let version = document
            .get("updateTime")
            .and_then(JsonValue::as_str)
            .map(|timestamp| self.decode_version(timestamp))
            .transpose()?
            .unwrap_or(SnapshotVersion::MIN);
        let create_time = document
            .get("createTime")
            .and_then(JsonValue::as_str)
            .map(|timestamp| self.decode_version(timestamp))
            .transpose()?
            .unwrap_or(SnapshotVersion::MIN);
        Ok(MutableDocument::new_found_document(
            key, version, create_time, data,
        ))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match mutation {
            Mutation::Set(set) => {
                write.insert(
                    "update".to_string(),
                    json!({
                        "name": self.document_name(&set.key),
                        "fields": self.encode_document_fields(&set.value),
                    }),
                );
                self.insert_update_transforms(&mut write, &set.field_transforms);
            }
            Mutation::Patch(patch) => {
                write.insert(
                    "update".to_string(),
                    json!({
                        "name": self.document_name(&patch.key),
                        "fields": self.encode_document_fields(&patch.data),
                    }),
                );
                let paths: Vec<String> = patch
                    .field_mask
                    .fields()
                    .iter()
                    .map(FieldPath::canonical_string)
                    .collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
                self.insert_update_transforms(&mut write, &patch.field_transforms);
            }
            Mutation::Delete(delete) => {
                write.insert(
                    "delete".to_string(),
                    json!(self.document_name(&delete.key)),
                );
            }
            Mutation::Verify(verify) => {
                write.insert(
                    "verify".to_string(),
                    json!(self.document_name(&verify.key)),
                );
            }
        }
        if let Some(precondition) = self.encode_precondition(mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }
        JsonValue::Object(write)
    }

    fn insert_update_transforms(
        &self,
        write: &mut serde_json::Map<String, JsonValue>,
        transforms: &[FieldTransform],
    ) {
        if transforms.is_empty() {
            return;
        }
        let encoded: Vec<JsonValue> = transforms
            .iter()
            .map(|transform| self.encode_field_transform(transform))
            .collect();
        write.insert("updateTransforms".to_string(), JsonValue::Array(encoded));
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field.canonical_string();
        match &transform.operation {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME",
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": {
                    "values": elements
                        .iter()
                        .map(|value| self.encode_value(value))
                        .collect::<Vec<_>>(),
                },
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": {
                    "values": elements
                        .iter()
                        .map(|value| self.encode_value(value))
                        .collect::<Vec<_>>(),
                },
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": self.encode_value(operand),
            }),
        }
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        if precondition.is_none() {
            return None;
        }
        if let Some(exists) = precondition.exists_value() {
            return Some(json!({ "exists": exists }));
        }
        precondition
            .update_time_value()
            .map(|version| json!({ "updateTime": self.encode_version(version) }))
    }

    pub fn decode_mutation_results(
        &self,
        response: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> SyncResult<Vec<MutationResult>> {
        let mut results = Vec::new();
        if let Some(entries) = response.get("writeResults").and_then(JsonValue::as_array) {
            for entry in entries {
                // Deletes carry no update time; they commit at the response's
                // commit version.
                let version = entry
                    .get("updateTime")
                    .and_then(JsonValue::as_str)
                    .map(|timestamp| self.decode_version(timestamp))
                    .transpose()?
                    .unwrap_or(commit_version);
                let mut transform_results = Vec::new();
                if let Some(values) = entry.get("transformResults").and_then(JsonValue::as_array) {
                    for value in values {
                        transform_results.push(self.decode_value(value)?);
                    }
                }
                results.push(MutationResult::new(version, transform_results));
            }
        }
        Ok(results)
    }

    /// Decodes one write-stream response. The first response on a stream is
    /// the handshake acknowledgement and carries no commit version.
    pub fn decode_write_response(&self, response: &JsonValue) -> SyncResult<WriteResponse> {
        let stream_token = response
            .get("streamToken")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Write response is missing streamToken"))?;
        let stream_token = BytesValue::from_base64(stream_token)
            .map_err(|err| invalid_argument(format!("Invalid streamToken: {err}")))?;
        let commit_version = response
            .get("commitTime")
            .and_then(JsonValue::as_str)
            .map(|timestamp| self.decode_version(timestamp))
            .transpose()?;
        let results = match commit_version {
            Some(version) => self.decode_mutation_results(response, version)?,
            None => Vec::new(),
        };
        Ok(WriteResponse {
            stream_token,
            commit_version,
            results,
        })
    }

    pub fn encode_write_handshake(&self) -> JsonValue {
        json!({ "database": self.database_name() })
    }

    pub fn encode_write_request(
        &self,
        stream_token: &BytesValue,
        mutations: &[Mutation],
    ) -> JsonValue {
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.encode_mutation(mutation))
            .collect();
        json!({
            "database": self.database_name(),
            "streamToken": stream_token.to_base64(),
            "writes": writes,
        })
    }

    pub fn encode_listen_request(&self, target_data: &TargetData) -> JsonValue {
        json!({
            "database": self.database_name(),
            "addTarget": self.encode_target(target_data),
        })
    }

    pub fn encode_unlisten_request(&self, target_id: TargetId) -> JsonValue {
        json!({
            "database": self.database_name(),
            "removeTarget": target_id,
        })
    }

    fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let mut entry = serde_json::Map::new();
        entry.insert("targetId".to_string(), json!(target_data.target_id));
        if !target_data.resume_token.is_empty() {
            entry.insert(
                "resumeToken".to_string(),
                json!(target_data.resume_token.to_base64()),
            );
        } else if !target_data.snapshot_version.is_min() {
            entry.insert(
                "readTime".to_string(),
                json!(self.encode_version(target_data.snapshot_version)),
            );
        }
        let target = &target_data.target;
        if target.is_document_target() {
            entry.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(&target.path)] }),
            );
        } else {
            entry.insert("query".to_string(), self.encode_query_target(target));
        }
        JsonValue::Object(entry)
    }

    fn encode_query_target(&self, target: &Target) -> JsonValue {
        let (parent, structured_query) = self.encode_structured_query(target);
        json!({
            "parent": parent,
            "structuredQuery": structured_query,
        })
    }

    fn encode_structured_query(&self, target: &Target) -> (String, JsonValue) {
        let mut structured = serde_json::Map::new();

        let parent;
        let mut from_entry = serde_json::Map::new();
        if let Some(group) = &target.collection_group {
            parent = self.resource_name(&target.path);
            from_entry.insert("collectionId".to_string(), json!(group));
            from_entry.insert("allDescendants".to_string(), json!(true));
        } else {
            parent = self.resource_name(&target.path.without_last());
            from_entry.insert(
                "collectionId".to_string(),
                json!(target.path.last_segment().unwrap_or_default()),
            );
        }
        structured.insert(
            "from".to_string(),
            JsonValue::Array(vec![JsonValue::Object(from_entry)]),
        );

        if !target.filters.is_empty() {
            structured.insert("where".to_string(), self.encode_filters(&target.filters));
        }

        if !target.order_by.is_empty() {
            let orders: Vec<JsonValue> = target
                .order_by
                .iter()
                .map(|order| self.encode_order_by(order))
                .collect();
            structured.insert("orderBy".to_string(), JsonValue::Array(orders));
        }

        if let Some(limit) = target.limit {
            structured.insert("limit".to_string(), json!(limit));
        }

        if let Some(bound) = &target.start_at {
            structured.insert("startAt".to_string(), self.encode_cursor(bound, true));
        }
        if let Some(bound) = &target.end_at {
            structured.insert("endAt".to_string(), self.encode_cursor(bound, false));
        }

        (parent, JsonValue::Object(structured))
    }

    fn encode_filters(&self, filters: &[Filter]) -> JsonValue {
        if filters.len() == 1 {
            return self.encode_filter(&filters[0]);
        }
        let nested: Vec<JsonValue> = filters
            .iter()
            .map(|filter| self.encode_filter(filter))
            .collect();
        json!({
            "compositeFilter": {
                "op": "AND",
                "filters": nested,
            }
        })
    }

    fn encode_filter(&self, filter: &Filter) -> JsonValue {
        match filter {
            Filter::Field(field_filter) => {
                // Null and NaN comparisons use the unary filter forms.
                let unary_op = match (&field_filter.op, field_filter.value.kind()) {
                    (FieldOperator::Equal, ValueKind::Null) => Some("IS_NULL"),
                    (FieldOperator::NotEqual, ValueKind::Null) => Some("IS_NOT_NULL"),
                    (FieldOperator::Equal, _) if field_filter.value.is_nan() => Some("IS_NAN"),
                    (FieldOperator::NotEqual, _) if field_filter.value.is_nan() => {
                        Some("IS_NOT_NAN")
                    }
                    _ => None,
                };
                if let Some(op) = unary_op {
                    return json!({
                        "unaryFilter": {
                            "field": { "fieldPath": field_filter.field.canonical_string() },
                            "op": op,
                        }
                    });
                }
                json!({
                    "fieldFilter": {
                        "field": { "fieldPath": field_filter.field.canonical_string() },
                        "op": field_operator_name(field_filter.op),
                        "value": self.encode_value(&field_filter.value),
                    }
                })
            }
            Filter::Composite(composite) => {
                let op = match composite.op {
                    CompositeOperator::And => "AND",
                    CompositeOperator::Or => "OR",
                };
                let nested: Vec<JsonValue> = composite
                    .filters
                    .iter()
                    .map(|entry| self.encode_filter(entry))
                    .collect();
                json!({
                    "compositeFilter": {
                        "op": op,
                        "filters": nested,
                    }
                })
            }
        }
    }

    fn encode_order_by(&self, order: &OrderBy) -> JsonValue {
        let direction = match order.direction {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
        };
        json!({
            "field": { "fieldPath": order.field.canonical_string() },
            "direction": direction,
        })
    }

    fn encode_cursor(&self, bound: &Bound, start: bool) -> JsonValue {
        let values: Vec<JsonValue> = bound
            .position
            .iter()
            .map(|value| self.encode_value(value))
            .collect();
        json!({
            "values": values,
            "before": if start { bound.inclusive } else { !bound.inclusive },
        })
    }
}

fn field_operator_name(op: FieldOperator) -> &'static str {
    match op {
        FieldOperator::LessThan => "LESS_THAN",
        FieldOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        FieldOperator::Equal => "EQUAL",
        FieldOperator::NotEqual => "NOT_EQUAL",
        FieldOperator::GreaterThan => "GREATER_THAN",
        FieldOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        FieldOperator::ArrayContains => "ARRAY_CONTAINS",
        FieldOperator::In => "IN",
        FieldOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        FieldOperator::NotIn => "NOT_IN",
    }
}
