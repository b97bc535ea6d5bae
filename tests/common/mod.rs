#![allow(dead_code)]

use agent_mailbox::connection::{Connection, ConnectionStatus, StatusCell};
use agent_mailbox::{ConnectionId, Envelope, ProtocolId};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Test connection that records every envelope sent through it and never
/// produces an incoming envelope.
pub struct RecordingConnection {
    id: ConnectionId,
    restricted: HashSet<ProtocolId>,
    status: StatusCell,
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingConnection {
    pub fn new(name: &str) -> Arc<Self> {
        let id: ConnectionId = format!("test/{}:0.1.0", name).parse().unwrap();
        Arc::new(Self {
            id,
            restricted: HashSet::new(),
            status: StatusCell::new(),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn restricted_to(name: &str, protocols: HashSet<ProtocolId>) -> Arc<Self> {
        let id: ConnectionId = format!("test/{}:0.1.0", name).parse().unwrap();
        Arc::new(Self {
            id,
            restricted: protocols,
            status: StatusCell::new(),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Connection for RecordingConnection {
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
        self.status.set(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.status.set(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.sent.lock().push(envelope);
        Ok(())
    }

    async fn receive(&self) -> Option<Envelope> {
        std::future::pending().await
    }
}

/// Test connection whose connect always fails.
pub struct FailingConnection {
    id: ConnectionId,
    restricted: HashSet<ProtocolId>,
    status: StatusCell,
}

impl FailingConnection {
    pub fn new(name: &str) -> Arc<Self> {
        let id: ConnectionId = format!("test/{}:0.1.0", name).parse().unwrap();
        Arc::new(Self {
            id,
            restricted: HashSet::new(),
            status: StatusCell::new(),
        })
    }
}

#[async_trait]
impl Connection for FailingConnection {
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
        Err(anyhow!("this connection never comes up"))
    }

    async fn disconnect(&self) -> Result<()> {
        self.status.set(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn send(&self, _envelope: Envelope) -> Result<()> {
        Err(anyhow!("this connection never came up"))
    }

    async fn receive(&self) -> Option<Envelope> {
        None
    }
}

pub fn protocol(name: &str) -> ProtocolId {
    format!("p/{}:0.1.0", name).parse().unwrap()
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
