//! WebSocket transport
//!
//! Client and server halves of the peer protocol. Each frame is one CBOR
//! encoded [`PeerRequest`] or [`PeerResponse`]; every request gets exactly
//! one response.
//!
//! ## Protocol
//!
//! 1. Connect via WebSocket
//! 2. Send `hello` with our peer ID and the collection to replicate
//! 3. Receive `welcome` with the server's peer ID
//! 4. Exchange `push`/`ack` and `pull`/`changes` pairs
//!
//! ## Usage
//!
//! ```ignore
//! let transport = WebSocketTransport::connect(url, "expenses", &peer_id, timeout).await?;
//! let replicator = Replicator::new(store, Arc::new(transport), config);
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::message::{
    decode, decode_records, encode, encode_records, PeerId, PeerRequest, PeerResponse,
};
use super::transport::{Transport, TransportError};
use crate::collections::Collections;
use crate::models::{Ack, ChangeBatch};
use crate::store::DocumentStore;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client side of the peer protocol
pub struct WebSocketTransport {
    url: String,
    /// The server's peer ID, learned during the handshake
    peer_id: PeerId,
    stream: Mutex<ClientStream>,
    /// Set while a request awaits its response; still set means the
    /// response was never read and the stream is out of step
    broken: AtomicBool,
}

impl WebSocketTransport {
    /// Connect and perform the handshake for one collection
    pub async fn connect(
        url: &str,
        collection: &str,
        local_peer_id: &str,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        match tokio::time::timeout(timeout, Self::handshake(url, collection, local_peer_id)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn handshake(
        url: &str,
        collection: &str,
        local_peer_id: &str,
    ) -> Result<Self, TransportError> {
        debug!("Connecting to {}", url);
        let (mut stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connection(format!("{}: {}", url, e)))?;

        let hello = PeerRequest::Hello {
            peer_id: local_peer_id.to_string(),
            collection: collection.to_string(),
        };
        write_frame(&mut stream, &hello).await?;

        match read_frame::<_, PeerResponse>(&mut stream).await? {
            PeerResponse::Welcome { peer_id } => {
                info!(%url, peer = %peer_id, %collection, "Connected to peer");
                Ok(Self {
                    url: url.to_string(),
                    peer_id,
                    stream: Mutex::new(stream),
                    broken: AtomicBool::new(false),
                })
            }
            PeerResponse::Error { message } => Err(TransportError::Peer(message)),
            other => Err(TransportError::Peer(format!(
                "unexpected handshake response: {:?}",
                other
            ))),
        }
    }

    /// Server URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one request and wait for its response
    ///
    /// A request abandoned between write and read (timeout, cancellation)
    /// leaves the connection unusable; later requests fail with
    /// [`TransportError::Closed`].
    async fn request(&self, request: &PeerRequest) -> Result<PeerResponse, TransportError> {
        let mut stream = self.stream.lock().await;
        if self.broken.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.broken.store(true, Ordering::SeqCst);
        write_frame(&mut *stream, request).await?;
        let response = read_frame(&mut *stream).await?;
        self.broken.store(false, Ordering::SeqCst);

        match response {
            PeerResponse::Error { message } => Err(TransportError::Peer(message)),
            response => Ok(response),
        }
    }

    /// Close the connection
    pub async fn close(&self) {
        let mut stream = self.stream.lock().await;
        stream.close(None).await.ok();
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn send(&self, batch: ChangeBatch) -> Result<Ack, TransportError> {
        let request = PeerRequest::Push {
            records: encode_records(&batch)?,
            last_seq: batch.last_seq,
        };
        match self.request(&request).await? {
            PeerResponse::Ack {
                applied,
                duplicates,
            } => Ok(Ack {
                applied: applied as usize,
                duplicates: duplicates as usize,
            }),
            other => Err(TransportError::Peer(format!("expected ack, got {:?}", other))),
        }
    }

    async fn receive(&self, since: u64, limit: usize) -> Result<ChangeBatch, TransportError> {
        let request = PeerRequest::Pull {
            since,
            limit: limit as u64,
        };
        match self.request(&request).await? {
            PeerResponse::Changes { records, last_seq } => decode_records(records, last_seq),
            other => Err(TransportError::Peer(format!(
                "expected changes, got {:?}",
                other
            ))),
        }
    }
}

/// Accept peers on `listener` and answer them from `collections`
///
/// Runs until the listener fails. Each connection is served on its own task.
pub async fn serve_peer(
    listener: TcpListener,
    collections: Arc<Collections>,
    peer_id: PeerId,
) -> Result<(), TransportError> {
    let local_addr = listener
        .local_addr()
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    info!(addr = %local_addr, peer = %peer_id, "Serving peers");

    loop {
        let (socket, addr) = listener
            .accept()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let collections = Arc::clone(&collections);
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            match handle_connection(socket, addr, collections, peer_id).await {
                Ok(()) => debug!(%addr, "peer disconnected"),
                Err(e) => warn!(%addr, "peer connection ended: {}", e),
            }
        });
    }
}

async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    collections: Arc<Collections>,
    peer_id: PeerId,
) -> Result<(), TransportError> {
    let mut stream = accept_async(socket)
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    let (store, remote) = match read_frame::<_, PeerRequest>(&mut stream).await? {
        PeerRequest::Hello {
            peer_id: remote,
            collection,
        } => match collections.get(&collection) {
            Ok(store) => {
                info!(%addr, peer = %remote, %collection, "Peer connected");
                write_frame(&mut stream, &PeerResponse::Welcome { peer_id }).await?;
                (store, remote)
            }
            Err(e) => {
                write_frame(&mut stream, &PeerResponse::error(e.to_string())).await?;
                stream.close(None).await.ok();
                return Ok(());
            }
        },
        other => {
            let message = format!("expected hello, got {:?}", other);
            write_frame(&mut stream, &PeerResponse::error(message.clone())).await?;
            return Err(TransportError::Peer(message));
        }
    };

    loop {
        let request = match read_frame::<_, PeerRequest>(&mut stream).await {
            Ok(request) => request,
            Err(TransportError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        let response = answer(&store, &remote, request);
        write_frame(&mut stream, &response).await?;
    }
}

/// Answer one request from peer `remote` against a collection
///
/// Pushed revisions are recorded as coming from `remote` and are left out of
/// what it pulls.
fn answer(store: &DocumentStore, remote: &str, request: PeerRequest) -> PeerResponse {
    match request {
        PeerRequest::Push { records, last_seq } => {
            let result = decode_records(records, last_seq)
                .map_err(|e| e.to_string())
                .and_then(|batch| {
                    store
                        .import_changes_from(Some(remote), &batch.records)
                        .map_err(|e| e.to_string())
                });
            match result {
                Ok(ack) => PeerResponse::ack(ack),
                Err(message) => PeerResponse::error(message),
            }
        }
        PeerRequest::Pull { since, limit } => {
            let result = store
                .export_changes_for(Some(remote), since, limit as usize)
                .map_err(|e| e.to_string())
                .and_then(|batch| {
                    let last_seq = batch.last_seq;
                    encode_records(&batch)
                        .map(|records| PeerResponse::Changes { records, last_seq })
                        .map_err(|e| e.to_string())
                });
            result.unwrap_or_else(PeerResponse::error)
        }
        PeerRequest::Hello { .. } => PeerResponse::error("already connected"),
    }
}

async fn write_frame<S, T>(stream: &mut S, message: &T) -> Result<(), TransportError>
where
    S: Sink<Message, Error = WsError> + Unpin,
    T: serde::Serialize,
{
    stream
        .send(Message::Binary(encode(message)?))
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))
}

async fn read_frame<S, T>(stream: &mut S) -> Result<T, TransportError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    T: for<'de> serde::Deserialize<'de>,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => return decode(&data),
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(_)) => {
                // Ping/pong and text frames are not part of the protocol
            }
            Some(Err(WsError::ConnectionClosed)) => return Err(TransportError::Closed),
            Some(Err(e)) => return Err(TransportError::Connection(e.to_string())),
        }
    }
}
