//! Length-prefixed JSON frames over TCP.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document:
//! an [`Envelope`] on the request path, a [`ReplyEnvelope`] on the way back.
//! The client caches one connection per peer; `refresh` drops it so the next
//! call dials again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use caravan_id::ContainerName;
use caravan_wire::{Command, Envelope, MobilityError, Reply, ReplyEnvelope};

use super::Transport;

/// Upper bound on a single frame. Snapshots larger than this are refused.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serves inbound commands; implemented by the container node.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        origin: &ContainerName,
        command: Command,
    ) -> Result<Reply, MobilityError>;
}

// =============================================================================
// Address book
// =============================================================================

/// Name-to-address mapping for peer containers.
#[derive(Default)]
pub struct AddressBook {
    peers: std::sync::Mutex<HashMap<ContainerName, SocketAddr>>,
}

impl AddressBook {
    pub fn new(seed: Vec<(ContainerName, SocketAddr)>) -> Self {
        Self {
            peers: std::sync::Mutex::new(seed.into_iter().collect()),
        }
    }

    pub fn lookup(&self, name: &ContainerName) -> Option<SocketAddr> {
        self.lock().get(name).copied()
    }

    pub fn insert(&self, name: ContainerName, addr: SocketAddr) {
        self.lock().insert(name, addr);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ContainerName, SocketAddr>> {
        match self.peers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

type StreamSlot = Arc<tokio::sync::Mutex<Option<TcpStream>>>;

/// TCP client side of the transport. One cached connection per peer;
/// concurrent calls to the same peer are serialized on it.
pub struct TcpTransport {
    local: ContainerName,
    book: Arc<AddressBook>,
    call_timeout: Duration,
    streams: std::sync::Mutex<HashMap<ContainerName, StreamSlot>>,
}

impl TcpTransport {
    pub fn new(local: ContainerName, book: Arc<AddressBook>, call_timeout: Duration) -> Self {
        Self {
            local,
            book,
            call_timeout,
            streams: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, to: &ContainerName) -> StreamSlot {
        let mut streams = match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(streams.entry(to.clone()).or_default())
    }

    /// One request/reply exchange on the cached stream, dialing first if
    /// there is none.
    async fn exchange(
        &self,
        slot: &mut Option<TcpStream>,
        addr: SocketAddr,
        to: &ContainerName,
        envelope: &Envelope,
    ) -> Result<ReplyEnvelope, MobilityError> {
        if slot.is_none() {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| MobilityError::link(to, e))?;
            debug!(container = %to, %addr, "connected");
            *slot = Some(stream);
        }
        let stream = match slot.as_mut() {
            Some(s) => s,
            None => return Err(MobilityError::link(to, "no connection")),
        };

        let bytes = serde_json::to_vec(envelope).map_err(|e| MobilityError::Serialization {
            detail: e.to_string(),
        })?;
        write_frame(stream, &bytes)
            .await
            .map_err(|e| MobilityError::link(to, e))?;

        let reply_bytes = read_frame(stream)
            .await
            .map_err(|e| MobilityError::link(to, e))?;
        let reply: ReplyEnvelope =
            serde_json::from_slice(&reply_bytes).map_err(|e| MobilityError::link(to, e))?;
        if reply.request_id != envelope.request_id {
            return Err(MobilityError::link(to, "reply correlation id mismatch"));
        }
        Ok(reply)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, to: &ContainerName, command: Command) -> Result<Reply, MobilityError> {
        let addr = self
            .book
            .lookup(to)
            .ok_or_else(|| MobilityError::link(to, "unknown peer address"))?;
        let envelope = Envelope::new(self.local.clone(), command);

        let slot = self.slot(to);
        let mut stream = slot.lock().await;

        let outcome =
            tokio::time::timeout(self.call_timeout, self.exchange(&mut stream, addr, to, &envelope))
                .await;
        match outcome {
            Ok(Ok(reply)) => reply.result,
            Ok(Err(e)) => {
                // A failed exchange leaves the stream in an unknown framing
                // position; drop it.
                *stream = None;
                Err(e)
            }
            Err(_) => {
                *stream = None;
                Err(MobilityError::link(to, "call timed out"))
            }
        }
    }

    async fn refresh(&self, to: &ContainerName) {
        let slot = self.slot(to);
        let mut stream = slot.lock().await;
        *stream = None;
        debug!(container = %to, "cached connection dropped");
    }
}

// =============================================================================
// Server
// =============================================================================

/// Accept loop. Runs until the shutdown signal flips to true; each
/// connection is served on its own task.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn CommandHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "wire listener up");
    }
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("wire listener shutting down");
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        let handler = Arc::clone(&handler);
                        tokio::spawn(handle_connection(stream, handler));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, handler: Arc<dyn CommandHandler>) {
    loop {
        let bytes = match read_frame(&mut stream).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    debug!(error = %e, "connection closed");
                }
                return;
            }
        };
        let envelope: Envelope = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "undecodable request frame, dropping connection");
                return;
            }
        };

        let result = handler.handle(&envelope.origin, envelope.command).await;
        let reply = ReplyEnvelope {
            request_id: envelope.request_id,
            result,
        };
        let reply_bytes = match serde_json::to_vec(&reply) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "reply encoding failed, dropping connection");
                return;
            }
        };
        if let Err(e) = write_frame(&mut stream, &reply_bytes).await {
            debug!(error = %e, "reply write failed");
            return;
        }
    }
}

// =============================================================================
// Framing
// =============================================================================

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", bytes.len()),
        ));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

// =============================================================================
// Tests
// =============================================================================
