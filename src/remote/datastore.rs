use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::remote::connection::{
    MultiplexedConnection, MultiplexedStream, StreamTransport, LISTEN_SERVICE, WRITE_SERVICE,
};
use crate::remote::serializer::JsonProtoSerializer;

/// One open RPC stream: ordered byte payloads each way, closed explicitly or
/// by the peer.
#[async_trait]
pub trait StreamHandle: Send + Sync + 'static {
    async fn send(&self, payload: Vec<u8>) -> SyncResult<()>;
    /// Next inbound payload; `None` once the peer closed the stream.
    async fn next(&self) -> Option<SyncResult<Vec<u8>>>;
    fn close(&self);
}

#[async_trait]
impl StreamHandle for MultiplexedStream {
    async fn send(&self, payload: Vec<u8>) -> SyncResult<()> {
        MultiplexedStream::send(self, payload).await
    }

    async fn next(&self) -> Option<SyncResult<Vec<u8>>> {
        MultiplexedStream::next(self).await
    }

    fn close(&self) {
        MultiplexedStream::close(self);
    }
}

/// Backend access for the remote layer: opens authenticated listen and write
/// streams. The caller supplies a fresh credential per stream.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    fn serializer(&self) -> &JsonProtoSerializer;
    async fn open_listen_stream(
        &self,
        auth_token: Option<String>,
    ) -> SyncResult<Arc<dyn StreamHandle>>;
    async fn open_write_stream(
        &self,
        auth_token: Option<String>,
    ) -> SyncResult<Arc<dyn StreamHandle>>;
}

pub type DatastoreArc = Arc<dyn Datastore>;

/// Datastore over a multiplexed frame connection.
pub struct ConnectionDatastore {
    connection: MultiplexedConnection,
    serializer: JsonProtoSerializer,
}

impl ConnectionDatastore {
    pub fn new(transport: Arc<dyn StreamTransport>, serializer: JsonProtoSerializer) -> Self {
        Self {
            connection: MultiplexedConnection::new(transport),
            serializer,
        }
    }
}

#[async_trait]
impl Datastore for ConnectionDatastore {
    fn serializer(&self) -> &JsonProtoSerializer {
        &self.serializer
    }

    async fn open_listen_stream(
        &self,
        auth_token: Option<String>,
    ) -> SyncResult<Arc<dyn StreamHandle>> {
        let stream = self.connection.open_stream(LISTEN_SERVICE, auth_token)?;
        Ok(Arc::new(stream))
    }

    async fn open_write_stream(
        &self,
        auth_token: Option<String>,
    ) -> SyncResult<Arc<dyn StreamHandle>> {
        let stream = self.connection.open_stream(WRITE_SERVICE, auth_token)?;
        Ok(Arc::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DatabaseId;
    use crate::remote::connection::{FrameKind, InMemoryTransport};

    #[tokio::test]
    async fn streams_open_under_their_service_names() {
        let (client, server) = InMemoryTransport::pair();
        let datastore = ConnectionDatastore::new(
            client,
            JsonProtoSerializer::new(DatabaseId::new("p", "(default)")),
        );

        let _listen = datastore.open_listen_stream(None).await.unwrap();
        let _write = datastore
            .open_write_stream(Some("token".to_string()))
            .await
            .unwrap();

        for expected in [LISTEN_SERVICE, WRITE_SERVICE] {
            let frame = server.next().await.unwrap();
            match frame.kind() {
                FrameKind::Open { service, .. } => assert_eq!(service, expected),
                other => panic!("expected open frame, got {other:?}"),
            }
        }
    }
}
