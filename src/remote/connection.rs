use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use crate::error::{internal_error, unavailable, SyncError, SyncResult};
use crate::runtime;

/// RPC name carried on open frames for the watch channel.
pub const LISTEN_SERVICE: &str = "Listen";
/// RPC name carried on open frames for the write channel.
pub const WRITE_SERVICE: &str = "Write";

/// Identifies one logical stream on a shared connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Payload of a transport frame.
#[derive(Clone, Debug)]
pub enum FrameKind {
    /// Starts a logical stream for `service`, authenticated by `auth_token`.
    Open {
        service: String,
        auth_token: Option<String>,
    },
    Data(Vec<u8>),
    Close,
    Error(SyncError),
}

/// One frame exchanged over a [`StreamTransport`].
#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn open(
        stream_id: StreamId,
        service: impl Into<String>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open {
                service: service.into(),
                auth_token,
            },
        }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: SyncError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }

    pub fn into_kind(self) -> FrameKind {
        self.kind
    }
}

/// Bidirectional, ordered frame pipe. Implementations carry frames for many
/// logical streams at once.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> SyncResult<()>;
    async fn next(&self) -> SyncResult<TransportFrame>;
}

type StreamMap = Arc<StdMutex<HashMap<StreamId, async_channel::Sender<FrameKind>>>>;

/// Runs many logical streams over one transport. Opening a stream assigns it
/// an id; inbound frames are routed to the matching stream's channel.
pub struct MultiplexedConnection {
    next_stream_id: AtomicU32,
    outbound: async_channel::Sender<TransportFrame>,
    streams: StreamMap,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound, outbound_rx) = async_channel::unbounded::<TransportFrame>();
        let streams: StreamMap = Arc::new(StdMutex::new(HashMap::new()));

        start_outbound_loop(Arc::clone(&transport), outbound_rx);
        start_inbound_loop(transport, Arc::clone(&streams));

        Self {
            next_stream_id: AtomicU32::new(1),
            outbound,
            streams,
        }
    }

    /// Opens a logical stream for `service`. The open frame carries the
    /// credential so the peer can authenticate the stream as a whole.
    pub fn open_stream(
        &self,
        service: &str,
        auth_token: Option<String>,
    ) -> SyncResult<MultiplexedStream> {
        let id = StreamId(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded::<FrameKind>();
        self.streams.lock().unwrap().insert(id, inbound_tx);

        self.outbound
            .try_send(TransportFrame::open(id, service, auth_token))
            .map_err(|_| unavailable("Connection is closed"))?;

        Ok(MultiplexedStream {
            id,
            outbound: self.outbound.clone(),
            inbound: inbound_rx,
            manager: MultiplexedConnectionHandle {
                outbound: self.outbound.clone(),
                streams: Arc::clone(&self.streams),
            },
        })
    }
}

fn start_outbound_loop(
    transport: Arc<dyn StreamTransport>,
    outbound_rx: async_channel::Receiver<TransportFrame>,
) {
    runtime::spawn_detached(async move {
        while let Ok(frame) = outbound_rx.recv().await {
            if let Err(err) = transport.send(frame).await {
                log::debug!("transport send failed, stopping outbound loop: {err}");
                break;
            }
        }
    });
}

fn start_inbound_loop(transport: Arc<dyn StreamTransport>, streams: StreamMap) {
    runtime::spawn_detached(async move {
        loop {
            let frame = match transport.next().await {
                Ok(frame) => frame,
                Err(err) => {
                    // The connection is gone; every open stream sees an error.
                    let senders: Vec<_> = streams.lock().unwrap().drain().collect();
                    for (_, sender) in senders {
                        let _ = sender.try_send(FrameKind::Error(err.clone()));
                    }
                    return;
                }
            };

            let id = frame.stream_id();
            let terminal = matches!(frame.kind(), FrameKind::Close | FrameKind::Error(_));
            let sender = {
                let mut map = streams.lock().unwrap();
                if terminal {
                    map.remove(&id)
                } else {
                    map.get(&id).cloned()
                }
            };
            match sender {
                Some(sender) => {
                    let _ = sender.try_send(frame.into_kind());
                }
                None => {
                    log::debug!("dropping frame for unknown stream {}", id.value());
                }
            }
        }
    });
}

#[derive(Clone)]
struct MultiplexedConnectionHandle {
    outbound: async_channel::Sender<TransportFrame>,
    streams: StreamMap,
}

impl MultiplexedConnectionHandle {
    fn close_stream(&self, id: StreamId) {
        let removed = self.streams.lock().unwrap().remove(&id);
        if removed.is_some() {
            let _ = self.outbound.try_send(TransportFrame::close(id));
        }
    }
}

/// One logical stream: ordered byte payloads in each direction.
pub struct MultiplexedStream {
    id: StreamId,
    outbound: async_channel::Sender<TransportFrame>,
    inbound: async_channel::Receiver<FrameKind>,
    manager: MultiplexedConnectionHandle,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> SyncResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|_| internal_error("Connection is closed"))
    }

    /// Next inbound payload; `None` once the peer closed the stream.
    pub async fn next(&self) -> Option<SyncResult<Vec<u8>>> {
        loop {
            match self.inbound.recv().await {
                Ok(FrameKind::Data(payload)) => return Some(Ok(payload)),
                Ok(FrameKind::Close) => return None,
                Ok(FrameKind::Error(err)) => return Some(Err(err)),
                // Open frames are connection bookkeeping, not payloads.
                Ok(FrameKind::Open { .. }) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn close(&self) {
        self.manager.close_stream(self.id);
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        self.manager.close_stream(self.id);
    }
}

/// Loopback transport: two cross-wired ends sharing in-process channels.
/// Tests drive the server end frame by frame.
pub struct InMemoryTransport {
    inbound: async_channel::Receiver<TransportFrame>,
    outbound: async_channel::Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<InMemoryTransport>, Arc<InMemoryTransport>) {
        let (client_tx, server_rx) = async_channel::unbounded();
        let (server_tx, client_rx) = async_channel::unbounded();
        let client = Arc::new(InMemoryTransport {
            inbound: client_rx,
            outbound: client_tx,
        });
        let server = Arc::new(InMemoryTransport {
            inbound: server_rx,
            outbound: server_tx,
        });
        (client, server)
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> SyncResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| unavailable("Transport peer is gone"))
    }

    async fn next(&self) -> SyncResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|_| unavailable("Transport peer is gone"))
    }
}
