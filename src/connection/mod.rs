//! # Connection Abstraction and Variants
//!
//! A connection is a transport that produces and consumes envelopes. All
//! variants implement the same [`Connection`] capability set, so the
//! multiplexer never branches on what kind of transport it is driving.
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌─────────────────────┐
//! │ Multiplexer  │───▶│  Connection  │───▶│ Specific transport  │
//! │ (routing and │    │    trait     │    │ (stub / local / tcp)│
//! │  lifecycle)  │    │ (capability) │    │                     │
//! └──────────────┘    └──────────────┘    └─────────────────────┘
//! ```
//!
//! Provided variants:
//!
//! - **Stub**: a file pipe; envelopes are appended to an input file by an
//!   external writer and sent envelopes land in an output file.
//! - **Local**: an in-process node routing envelopes between connections
//!   registered on it by address.
//! - **TCP**: a point-to-point network transport framing envelope records
//!   with a length prefix.

use crate::envelope::Envelope;
use crate::identifier::{ConnectionId, ProtocolId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;

pub mod local;
pub mod stub;
pub mod tcp;

pub use local::{LocalConnection, LocalNode};
pub use stub::StubConnection;
pub use tcp::TcpConnection;

/// Lifecycle state of a connection.
///
/// Transitions are monotonic within a single `connect()` or
/// `disconnect()` call:
///
/// ```text
/// Disconnected → Connecting → Connected → Disconnecting → Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Not connected; the initial and final state.
    #[default]
    Disconnected,
    /// `connect()` is in progress.
    Connecting,
    /// Ready to send and receive envelopes.
    Connected,
    /// `disconnect()` is in progress.
    Disconnecting,
}

impl ConnectionStatus {
    /// Whether the connection is ready for traffic.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Shared, thread-safe holder for a connection's status.
///
/// Connections hand out status snapshots through `&self`, so the state
/// lives behind a lock rather than in a plain field.
#[derive(Debug, Default)]
pub struct StatusCell(Mutex<ConnectionStatus>);

impl StatusCell {
    /// Create a cell in the `Disconnected` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current status.
    pub fn get(&self) -> ConnectionStatus {
        *self.0.lock()
    }

    /// Transition to a new status.
    pub fn set(&self, status: ConnectionStatus) {
        *self.0.lock() = status;
    }

    /// Shorthand for `get().is_connected()`.
    pub fn is_connected(&self) -> bool {
        self.get().is_connected()
    }
}

/// Capability set every transport provides to the multiplexer.
///
/// Implementations take `&self` throughout: the multiplexer drives send
/// and receive concurrently from different tasks, so any mutable state
/// belongs behind the connection's own synchronization.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The unique identifier of this connection.
    fn id(&self) -> &ConnectionId;

    /// Snapshot of the lifecycle state.
    fn status(&self) -> ConnectionStatus;

    /// Protocols this transport accepts. An empty set means any.
    fn restricted_to_protocols(&self) -> &HashSet<ProtocolId>;

    /// Bring the transport up. A no-op when already connected.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Tear the transport down. A no-op when already disconnected.
    async fn disconnect(&self) -> anyhow::Result<()>;

    /// Send one envelope. Transient transport errors surface here and are
    /// contained by the caller's send loop.
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()>;

    /// Produce the next envelope, or `None` once the stream has ended.
    /// The returned future must be safe to cancel.
    async fn receive(&self) -> Option<Envelope>;
}
