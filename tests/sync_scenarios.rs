use std::sync::{Arc, Mutex};
use std::time::Duration;

use docsync::api::{
    ClientSettings, DatabaseInfo, EmptyCredentialsProvider, QuerySnapshot, QuerySnapshotHandler,
    SyncClient,
};
use docsync::core::{ListenOptions, Query};
use docsync::local::Persistence;
use docsync::model::{DatabaseId, DocumentKey, ResourcePath};
use docsync::mutation::Mutation;
use docsync::remote::{
    ConnectionDatastore, DatastoreArc, FrameKind, InMemoryTransport, JsonProtoSerializer, StreamId,
    StreamTransport, TransportFrame,
};
use docsync::value::MapValue;
use serde_json::json;

fn client_with_persistence(persistence: Persistence) -> (SyncClient, Arc<InMemoryTransport>) {
    let (transport, server) = InMemoryTransport::pair();
    let datastore: DatastoreArc = Arc::new(ConnectionDatastore::new(
        transport,
        JsonProtoSerializer::new(DatabaseId::new("p", "(default)")),
    ));
    let settings = ClientSettings::new(DatabaseInfo::new(
        DatabaseId::new("p", "(default)"),
        "scenario-app",
        "localhost",
    ));
    let client = SyncClient::with_settings(
        settings,
        Arc::new(EmptyCredentialsProvider),
        persistence,
        datastore,
    );
    (client, server)
}

fn client() -> (SyncClient, Arc<InMemoryTransport>) {
    client_with_persistence(Persistence::in_memory())
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn rooms_query() -> Query {
    Query::at_path(ResourcePath::from_string("rooms").unwrap())
}

fn set_mutation(path: &str) -> Mutation {
    Mutation::set(key(path), MapValue::empty())
}

type RecordedSnapshots = Arc<Mutex<Vec<QuerySnapshot>>>;

fn recording_handler() -> (QuerySnapshotHandler, RecordedSnapshots) {
    let snapshots: RecordedSnapshots = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    let handler: QuerySnapshotHandler = Arc::new(move |event| {
        sink.lock().unwrap().push(event.expect("listen error"));
    });
    (handler, snapshots)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        docsync::runtime::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

async fn expect_open(server: &InMemoryTransport, expected_service: &str) -> StreamId {
    let frame = server.next().await.unwrap();
    let id = frame.stream_id();
    match frame.kind() {
        FrameKind::Open { service, .. } => assert_eq!(service, expected_service),
        other => panic!("expected open frame, got {other:?}"),
    }
    id
}

async fn expect_request(server: &InMemoryTransport) -> serde_json::Value {
    let frame = server.next().await.unwrap();
    match frame.into_kind() {
        FrameKind::Data(payload) => serde_json::from_slice(&payload).unwrap(),
        other => panic!("expected data frame, got {other:?}"),
    }
}

async fn respond(server: &InMemoryTransport, stream_id: StreamId, response: serde_json::Value) {
    server
        .send(TransportFrame::data(
            stream_id,
            serde_json::to_vec(&response).unwrap(),
        ))
        .await
        .unwrap();
}

/// Brings a freshly listened target to a synced state with one document,
/// returning the listen stream's id.
async fn sync_rooms_target(server: &InMemoryTransport) -> StreamId {
    let stream_id = expect_open(server, "Listen").await;
    let request = expect_request(server).await;
    assert_eq!(request["addTarget"]["targetId"], 2);
    respond(
        server,
        stream_id,
        json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }),
    )
    .await;
    respond(
        server,
        stream_id,
        json!({
            "documentChange": {
                "document": {
                    "name": "projects/p/databases/(default)/documents/rooms/eros",
                    "fields": { "topic": { "stringValue": "hello" } },
                    "updateTime": "1970-01-01T00:00:01Z"
                },
                "targetIds": [2]
            }
        }),
    )
    .await;
    respond(
        server,
        stream_id,
        json!({
            "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [2],
                "resumeToken": "cmVzdW1l"
            }
        }),
    )
    .await;
    respond(
        server,
        stream_id,
        json!({
            "targetChange": {
                "targetChangeType": "NO_CHANGE",
                "targetIds": [],
                "readTime": "1970-01-01T00:00:02Z"
            }
        }),
    )
    .await;
    stream_id
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_writes_reach_the_backend_after_reconnecting() {
    let (client, server) = client();
    client.disable_network().await.unwrap();
    let ack = client.write(vec![set_mutation("rooms/eros")]).await.unwrap();

    let cached = client.read_document(key("rooms/eros")).await.unwrap();
    assert!(cached.exists());
    assert!(cached.metadata().has_pending_writes);

    client.enable_network().await.unwrap();
    let stream_id = expect_open(&server, "Write").await;
    let handshake = expect_request(&server).await;
    assert!(handshake.get("writes").is_none());
    respond(&server, stream_id, json!({ "streamToken": "dG9rZW4tMQ==" })).await;

    let request = expect_request(&server).await;
    assert_eq!(request["writes"].as_array().unwrap().len(), 1);
    respond(
        &server,
        stream_id,
        json!({
            "streamToken": "dG9rZW4tMg==",
            "commitTime": "1970-01-01T00:00:05Z",
            "writeResults": [{ "updateTime": "1970-01-01T00:00:05Z" }]
        }),
    )
    .await;

    ack.await.unwrap();
    let snapshot = client.read_document(key("rooms/eros")).await.unwrap();
    assert!(snapshot.exists());
    assert!(!snapshot.metadata().has_pending_writes);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_document_dropped_from_its_target_resolves_through_limbo() {
    let (client, server) = client();
    let (handler, snapshots) = recording_handler();
    let _registration = client
        .listen(rooms_query(), ListenOptions::default(), handler)
        .await
        .unwrap();

    let stream_id = sync_rooms_target(&server).await;
    wait_until(|| {
        snapshots
            .lock()
            .unwrap()
            .last()
            .map(|snapshot| !snapshot.metadata().from_cache && snapshot.len() == 1)
            .unwrap_or(false)
    })
    .await;

    // The server drops the document from the target without saying why.
    respond(
        &server,
        stream_id,
        json!({
            "documentRemove": {
                "document": "projects/p/databases/(default)/documents/rooms/eros",
                "removedTargetIds": [2]
            }
        }),
    )
    .await;
    respond(
        &server,
        stream_id,
        json!({
            "targetChange": {
                "targetChangeType": "NO_CHANGE",
                "targetIds": [],
                "readTime": "1970-01-01T00:00:03Z"
            }
        }),
    )
    .await;

    // The orphaned key gets its own document listen.
    let limbo_request = expect_request(&server).await;
    assert_eq!(limbo_request["addTarget"]["targetId"], 1);
    assert_eq!(
        limbo_request["addTarget"]["documents"]["documents"][0],
        "projects/p/databases/(default)/documents/rooms/eros"
    );
    respond(
        &server,
        stream_id,
        json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [1] } }),
    )
    .await;
    respond(
        &server,
        stream_id,
        json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [1] } }),
    )
    .await;
    respond(
        &server,
        stream_id,
        json!({
            "targetChange": {
                "targetChangeType": "NO_CHANGE",
                "targetIds": [],
                "readTime": "1970-01-01T00:00:04Z"
            }
        }),
    )
    .await;

    // A current limbo target without the document means it is gone.
    wait_until(|| {
        snapshots
            .lock()
            .unwrap()
            .last()
            .map(|snapshot| snapshot.is_empty())
            .unwrap_or(false)
    })
    .await;
    let snapshots = snapshots.lock().unwrap();
    let last = snapshots.last().unwrap();
    assert!(!last.metadata().from_cache);
    assert_eq!(last.len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn an_existence_filter_mismatch_forces_a_fresh_listen() {
    let (client, server) = client();
    let (handler, snapshots) = recording_handler();
    let _registration = client
        .listen(rooms_query(), ListenOptions::default(), handler)
        .await
        .unwrap();

    let stream_id = sync_rooms_target(&server).await;
    wait_until(|| !snapshots.lock().unwrap().is_empty()).await;

    // The server counts two documents where the client holds one.
    respond(
        &server,
        stream_id,
        json!({ "filter": { "targetId": 2, "count": 2 } }),
    )
    .await;
    respond(
        &server,
        stream_id,
        json!({
            "targetChange": {
                "targetChangeType": "NO_CHANGE",
                "targetIds": [],
                "readTime": "1970-01-01T00:00:03Z"
            }
        }),
    )
    .await;

    // The client discards its state for the target and listens again from
    // scratch, with no resume token.
    let remove = expect_request(&server).await;
    assert_eq!(remove["removeTarget"], 2);
    let re_add = expect_request(&server).await;
    assert_eq!(re_add["addTarget"]["targetId"], 2);
    assert!(re_add["addTarget"].get("resumeToken").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_writes_survive_a_restart_and_still_commit() {
    let persistence = Persistence::in_memory();
    let (client, _server) = client_with_persistence(persistence.clone());
    client.disable_network().await.unwrap();
    let _ack = client.write(vec![set_mutation("rooms/eros")]).await.unwrap();
    client.shutdown().await.unwrap();

    let (client, server) = client_with_persistence(persistence);
    let cached = client.read_document(key("rooms/eros")).await.unwrap();
    assert!(cached.exists());
    assert!(cached.metadata().has_pending_writes);

    // The startup credential pass finds the queued batch and drains it.
    let stream_id = expect_open(&server, "Write").await;
    let _handshake = expect_request(&server).await;
    respond(&server, stream_id, json!({ "streamToken": "dG9rZW4tMQ==" })).await;
    let request = expect_request(&server).await;
    assert_eq!(request["writes"].as_array().unwrap().len(), 1);
    respond(
        &server,
        stream_id,
        json!({
            "streamToken": "dG9rZW4tMg==",
            "commitTime": "1970-01-01T00:00:05Z",
            "writeResults": [{ "updateTime": "1970-01-01T00:00:05Z" }]
        }),
    )
    .await;

    client.wait_for_pending_writes().await.unwrap();
    let snapshot = client.read_document(key("rooms/eros")).await.unwrap();
    assert!(snapshot.exists());
    assert!(!snapshot.metadata().has_pending_writes);
}
