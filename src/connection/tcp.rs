//! Point-to-point TCP connection.
//!
//! Each frame on the wire is a 4-byte little-endian length prefix followed
//! by one envelope record. A connection is created in either server role
//! (bind and accept exactly one peer) or client role (dial the peer).

use super::{Connection, ConnectionStatus, StatusCell};
use crate::defaults;
use crate::envelope::Envelope;
use crate::identifier::{ConnectionId, ProtocolId};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

const CONNECT_ATTEMPTS: usize = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

/// A connection carrying envelopes over a single TCP stream.
pub struct TcpConnection {
    id: ConnectionId,
    role: Role,
    address: SocketAddr,
    restricted: HashSet<ProtocolId>,
    status: StatusCell,
    reader: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

impl TcpConnection {
    /// Create a server-side connection that accepts exactly one peer on
    /// `address` when connected.
    pub fn server(id: ConnectionId, address: SocketAddr) -> Self {
        Self::with_role(id, address, Role::Server)
    }

    /// Create a client-side connection that dials `address` when
    /// connected.
    pub fn client(id: ConnectionId, address: SocketAddr) -> Self {
        Self::with_role(id, address, Role::Client)
    }

    fn with_role(id: ConnectionId, address: SocketAddr, role: Role) -> Self {
        Self {
            id,
            role,
            address,
            restricted: HashSet::new(),
            status: StatusCell::new(),
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    /// Limit the connection to the given protocols.
    pub fn restrict_to_protocols(mut self, protocols: HashSet<ProtocolId>) -> Self {
        self.restricted = protocols;
        self
    }

    async fn open_stream(&self) -> Result<TcpStream> {
        match self.role {
            Role::Server => {
                let listener = TcpListener::bind(self.address).await?;
                debug!(address = %self.address, "waiting for peer");
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "peer connected");
                Ok(stream)
            }
            Role::Client => {
                let mut last_error = None;
                for _ in 0..CONNECT_ATTEMPTS {
                    match TcpStream::connect(self.address).await {
                        Ok(stream) => return Ok(stream),
                        Err(err) => {
                            last_error = Some(err);
                            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                        }
                    }
                }
                Err(anyhow!(
                    "cannot reach {}: {}",
                    self.address,
                    last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string())
                ))
            }
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    fn restricted_to_protocols(&self) -> &HashSet<ProtocolId> {
        &self.restricted
    }

    async fn connect(&self) -> Result<()> {
        if self.status.is_connected() {
            debug!(id = %self.id, "tcp connection already established");
            return Ok(());
        }
        self.status.set(ConnectionStatus::Connecting);
        let stream = match self.open_stream().await {
            Ok(stream) => stream,
            Err(err) => {
                self.status.set(ConnectionStatus::Disconnected);
                return Err(err);
            }
        };
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        self.status.set(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.status.get() == ConnectionStatus::Disconnected {
            debug!(id = %self.id, "tcp connection already disconnected");
            return Ok(());
        }
        self.status.set(ConnectionStatus::Disconnecting);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        // An in-flight receive may hold the reader; it ends on its own
        // once the peer closes or its task is cancelled.
        if let Ok(mut guard) = self.reader.try_lock() {
            guard.take();
        }
        self.status.set(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow!("tcp connection is not connected"))?;
        let bytes = envelope.encode();
        writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Option<Envelope> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut()?;
        loop {
            match read_frame(reader).await {
                Ok(frame) => match Envelope::decode(&frame) {
                    Ok(envelope) => return Some(envelope),
                    // one bad frame does not end the stream
                    Err(err) => error!(%err, "dropping undecodable frame"),
                },
                Err(err) => {
                    debug!(id = %self.id, %err, "tcp stream ended");
                    return None;
                }
            }
        }
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > defaults::MAX_FRAME_SIZE {
        return Err(anyhow!("frame too large: {} bytes", len));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}
