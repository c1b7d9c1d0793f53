use serde_json::Value as JsonValue;

use crate::error::{internal_error, invalid_argument, SyncError, SyncErrorCode, SyncResult};
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::remote::serializer::JsonProtoSerializer;
use crate::value::BytesValue;

/// A single message on the watch stream, decoded into the model the change
/// aggregator consumes.
#[derive(Debug, Clone)]
pub enum WatchChange {
    Document(DocumentWatchChange),
    TargetChange(WatchTargetChange),
    ExistenceFilter(ExistenceFilterChange),
}

/// A document entering, changing within, or leaving some targets.
#[derive(Debug, Clone)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    /// The new document state. A tombstone marks a confirmed delete; `None`
    /// means the document merely left the named targets.
    pub document: Option<MutableDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// Server-side state change for a set of targets. An empty `target_ids` list
/// addresses every active target.
#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    pub target_ids: Vec<TargetId>,
    pub resume_token: BytesValue,
    pub read_time: Option<SnapshotVersion>,
    pub cause: Option<SyncError>,
}

/// The server's count of documents in a target, used to detect divergence
/// from the local result set.
#[derive(Debug, Clone, Copy)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
}

/// Decodes one listen response. Unrecognized response kinds decode to `None`
/// so newer server messages are skipped rather than fatal.
pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> SyncResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }

    Ok(None)
}

/// The snapshot version a listen response advances the global watch position
/// to. Only an untargeted change carries one; everything else reports
/// [`SnapshotVersion::MIN`].
pub fn decode_snapshot_version(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> SyncResult<SnapshotVersion> {
    let Some(target_change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::MIN);
    };
    let targeted = target_change
        .get("targetIds")
        .and_then(JsonValue::as_array)
        .is_some_and(|ids| !ids.is_empty());
    if targeted {
        return Ok(SnapshotVersion::MIN);
    }
    target_change
        .get("readTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_version(timestamp))
        .transpose()
        .map(|version| version.unwrap_or(SnapshotVersion::MIN))
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> SyncResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));

    let resume_token = value
        .get("resumeToken")
        .and_then(JsonValue::as_str)
        .and_then(|token| BytesValue::from_base64(token).ok())
        .unwrap_or_else(|| BytesValue::new(Vec::new()));

    let read_time = value
        .get("readTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_version(timestamp))
        .transpose()?;

    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(WatchTargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(decode_cause)
        .transpose()?;

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_cause(cause: &JsonValue) -> SyncResult<SyncError> {
    let code = cause
        .get("code")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| internal_error("Watch cause is missing a status code"))?;
    let message = cause
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or("watch stream error")
        .to_string();
    Ok(SyncError::new(SyncErrorCode::from_grpc_code(code), message))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> SyncResult<WatchChange> {
    let updated_target_ids = numeric_array(value.get("targetIds"));
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document)?;

    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids,
        removed_target_ids,
        key: document.key().clone(),
        document: Some(document),
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> SyncResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentDelete missing document"))?;
    let key = serializer.document_key_from_name(name)?;
    let version = value
        .get("readTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_version(timestamp))
        .transpose()?
        .unwrap_or(SnapshotVersion::MIN);
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));

    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids,
        document: Some(MutableDocument::new_no_document(key.clone(), version)),
        key,
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> SyncResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentRemove missing document"))?;
    let key = serializer.document_key_from_name(name)?;
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));

    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids,
        key,
        document: None,
    }))
}

fn decode_filter_change(value: &JsonValue) -> SyncResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value
        .get("count")
        .and_then(JsonValue::as_i64)
        .unwrap_or(0) as i32;
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
    }))
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|id| id as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> WatchTargetChangeState {
    match value {
        "NO_CHANGE" => WatchTargetChangeState::NoChange,
        "ADD" => WatchTargetChangeState::Added,
        "REMOVE" => WatchTargetChangeState::Removed,
        "CURRENT" => WatchTargetChangeState::Current,
        "RESET" => WatchTargetChangeState::Reset,
        _ => WatchTargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DatabaseId;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": BASE64_STANDARD.encode([1u8, 2, 3]),
                "targetChangeType": "CURRENT"
            }
        });

        let decoded = decode_watch_change(&serializer(), &change)
            .unwrap()
            .unwrap();
        match decoded {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token.as_slice(), &[1, 2, 3]);
                assert_eq!(change.state, WatchTargetChangeState::Current);
                assert!(change.cause.is_none());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_target_removal_cause() {
        let change = json!({
            "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [4],
                "cause": { "code": 7, "message": "denied" }
            }
        });

        let decoded = decode_watch_change(&serializer(), &change)
            .unwrap()
            .unwrap();
        match decoded {
            WatchChange::TargetChange(change) => {
                let cause = change.cause.unwrap();
                assert_eq!(cause.code, SyncErrorCode::PermissionDenied);
                assert_eq!(cause.message, "denied");
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_document_change() {
        let change = json!({
            "documentChange": {
                "document": {
                    "name": "projects/project/databases/(default)/documents/rooms/a",
                    "fields": { "count": { "integerValue": "3" } },
                    "updateTime": "2024-01-01T00:00:07Z"
                },
                "targetIds": [2],
                "removedTargetIds": [4]
            }
        });

        let decoded = decode_watch_change(&serializer(), &change)
            .unwrap()
            .unwrap();
        match decoded {
            WatchChange::Document(change) => {
                assert_eq!(change.updated_target_ids, vec![2]);
                assert_eq!(change.removed_target_ids, vec![4]);
                let document = change.document.unwrap();
                assert!(document.is_found_document());
                assert_eq!(
                    document.data().get("count").unwrap().as_integer(),
                    Some(3)
                );
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn document_delete_decodes_to_a_tombstone() {
        let change = json!({
            "documentDelete": {
                "document": "projects/project/databases/(default)/documents/rooms/a",
                "readTime": "2024-01-01T00:00:09Z",
                "removedTargetIds": [2]
            }
        });

        let decoded = decode_watch_change(&serializer(), &change)
            .unwrap()
            .unwrap();
        match decoded {
            WatchChange::Document(change) => {
                assert!(change.updated_target_ids.is_empty());
                assert!(change.document.unwrap().is_no_document());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn snapshot_version_comes_from_untargeted_changes_only() {
        let serializer = serializer();
        let untargeted = json!({
            "targetChange": { "readTime": "2024-01-01T00:00:05Z" }
        });
        let targeted = json!({
            "targetChange": { "targetIds": [1], "readTime": "2024-01-01T00:00:05Z" }
        });

        assert!(!decode_snapshot_version(&serializer, &untargeted)
            .unwrap()
            .is_min());
        assert!(decode_snapshot_version(&serializer, &targeted)
            .unwrap()
            .is_min());
    }

    #[test]
    fn unknown_responses_are_skipped() {
        let decoded = decode_watch_change(&serializer(), &json!({ "somethingNew": {} })).unwrap();
        assert!(decoded.is_none());
    }
}
