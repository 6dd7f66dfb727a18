//! Message transports.
//!
//! [`TcpTransport`] opens one connection per message: connect, write the frame,
//! shut down the write half. The listener reads each accepted connection to EOF,
//! decodes one frame and hands it to an inbox channel. [`LocalNetwork`] routes frames
//! between in-process nodes through the same codec, for tests and simulations.

use crate::error::ChainError;
use crate::network::message::{Message, MAX_MESSAGE_SIZE};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Capacity of an inbox channel.
pub const INBOX_CAPACITY: usize = 1024;

/// Channel that listeners deliver decoded messages into.
pub fn inbox() -> (Sender<Message>, Receiver<Message>) {
    channel(INBOX_CAPACITY)
}

/// Outbound half of a transport.
pub trait Transport: Send + Sync + 'static {
    /// Address this node announces to peers.
    fn local_addr(&self) -> String;

    /// Delivers `message` to `to`. An error means the peer is unreachable.
    fn send(&self, to: &str, message: &Message) -> impl Future<Output = Result<(), ChainError>> + Send;
}

pub struct TcpTransport {
    local_addr: String,
    io_timeout: Duration,
}

impl TcpTransport {
    pub fn new(local_addr: impl Into<String>, io_timeout: Duration) -> Self {
        TcpTransport {
            local_addr: local_addr.into(),
            io_timeout,
        }
    }

    pub async fn bind(bind_addr: &str) -> Result<TcpListener, ChainError> {
        TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ChainError::NetworkError(format!("Failed to bind {}: {}", bind_addr, e)))
    }

    /// Accept loop: one task per connection, each decoded frame goes to `inbox`.
    /// Returns only if the listener itself fails.
    pub async fn serve(listener: TcpListener, inbox: Sender<Message>, io_timeout: Duration) -> Result<(), ChainError> {
        loop {
            let (stream, remote) = listener
                .accept()
                .await
                .map_err(|e| ChainError::NetworkError(format!("Accept failed: {}", e)))?;
            let inbox = inbox.clone();
            tokio::spawn(async move {
                match timeout(io_timeout, read_frame(stream)).await {
                    Ok(Ok(message)) => {
                        debug!("Received {} from {} ({})", message.command(), message.addr_from, remote);
                        if inbox.send(message).await.is_err() {
                            error!("Inbox closed; dropping message from {}", remote);
                        }
                    }
                    Ok(Err(e)) => warn!("Dropping connection from {}: {}", remote, e),
                    Err(_) => warn!("Connection from {} timed out", remote),
                }
            });
        }
    }
}

async fn read_frame(stream: TcpStream) -> Result<Message, ChainError> {
    let mut buf = Vec::new();
    stream
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_to_end(&mut buf)
        .await?;
    Message::decode(&buf)
}

impl Transport for TcpTransport {
    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    async fn send(&self, to: &str, message: &Message) -> Result<(), ChainError> {
        let bytes = message.encode()?;
        let io = async {
            let mut stream = TcpStream::connect(to).await?;
            stream.write_all(&bytes).await?;
            stream.shutdown().await?;
            Ok::<(), std::io::Error>(())
        };
        match timeout(self.io_timeout, io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ChainError::NetworkError(format!("{}: {}", to, e))),
            Err(_) => Err(ChainError::NetworkError(format!("{}: timed out", to))),
        }
    }
}

/// In-process hub that routes frames between [`LocalTransport`]s by name.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    nodes: Arc<RwLock<HashMap<String, Sender<Message>>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `addr` and returns its transport and inbox.
    pub fn join(&self, addr: &str) -> (LocalTransport, Receiver<Message>) {
        let (tx, rx) = inbox();
        self.nodes.write().insert(addr.to_string(), tx);
        (
            LocalTransport {
                addr: addr.to_string(),
                network: self.clone(),
            },
            rx,
        )
    }

    /// Makes `addr` unreachable, as if its process had stopped.
    pub fn leave(&self, addr: &str) {
        self.nodes.write().remove(addr);
    }
}

pub struct LocalTransport {
    addr: String,
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn send(&self, to: &str, message: &Message) -> Result<(), ChainError> {
        // Round-trip through the wire codec so local runs exercise the same framing.
        let delivered = Message::decode(&message.encode()?)?;
        let inbox = self
            .network
            .nodes
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| ChainError::NetworkError(format!("{}: connection refused", to)))?;
        inbox
            .send(delivered)
            .await
            .map_err(|_| ChainError::NetworkError(format!("{}: inbox closed", to)))
    }
}
