//! In-process connection.
//!
//! A [`LocalNode`] routes envelopes between connections registered on it,
//! keyed by the receiver address. Useful for wiring several agents
//! together inside one process without touching the network.

use super::{Connection, ConnectionStatus, StatusCell};
use crate::envelope::Envelope;
use crate::identifier::{Address, ConnectionId, ProtocolId};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// In-process router shared by a set of [`LocalConnection`]s.
#[derive(Clone, Default)]
pub struct LocalNode {
    registry: Arc<Mutex<HashMap<Address, mpsc::UnboundedSender<Envelope>>>>,
}

impl LocalNode {
    /// Create an empty node.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, address: Address, tx: mpsc::UnboundedSender<Envelope>) {
        self.registry.lock().insert(address, tx);
    }

    fn deregister(&self, address: &str) {
        self.registry.lock().remove(address);
    }

    /// Deliver an envelope to the connection registered for its receiver.
    /// Unknown receivers drop the envelope with a warning.
    fn deliver(&self, envelope: Envelope) {
        let registry = self.registry.lock();
        match registry.get(&envelope.to) {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    warn!("local receiver is gone, dropping envelope");
                }
            }
            None => {
                warn!(to = %envelope.to, "no local connection for receiver, dropping envelope");
            }
        }
    }
}

/// A connection delivering envelopes through a [`LocalNode`].
pub struct LocalConnection {
    id: ConnectionId,
    address: Address,
    node: LocalNode,
    restricted: HashSet<ProtocolId>,
    status: StatusCell,
    incoming: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl LocalConnection {
    /// Create a connection for `address` on the given node.
    pub fn new(id: ConnectionId, address: impl Into<Address>, node: LocalNode) -> Self {
        Self {
            id,
            address: address.into(),
            node,
            restricted: HashSet::new(),
            status: StatusCell::new(),
            incoming: tokio::sync::Mutex::new(None),
        }
    }

    /// Limit the connection to the given protocols.
    pub fn restrict_to_protocols(mut self, protocols: HashSet<ProtocolId>) -> Self {
        self.restricted = protocols;
        self
    }
}

#[async_trait]
impl Connection for LocalConnection {
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
            debug!(id = %self.id, "local connection already established");
            return Ok(());
        }
        self.status.set(ConnectionStatus::Connecting);
        let (tx, rx) = mpsc::unbounded_channel();
        self.node.register(self.address.clone(), tx);
        *self.incoming.lock().await = Some(rx);
        self.status.set(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.status.get() == ConnectionStatus::Disconnected {
            debug!(id = %self.id, "local connection already disconnected");
            return Ok(());
        }
        self.status.set(ConnectionStatus::Disconnecting);
        self.node.deregister(&self.address);
        self.status.set(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.node.deliver(envelope);
        Ok(())
    }

    async fn receive(&self) -> Option<Envelope> {
        let mut guard = self.incoming.lock().await;
        let incoming = guard.as_mut()?;
        incoming.recv().await
    }
}
