//! # Agent Mailbox
//!
//! An envelope multiplexing runtime for autonomous agents. The runtime
//! drives a set of heterogeneous message-carrying connections behind one
//! pair of in/out queues, routes outbound envelopes by protocol, and
//! serializes envelopes on a self-describing wire format.

pub mod connection;
pub mod envelope;
pub mod identifier;
pub mod mailbox;
pub mod multiplexer;
mod queue;
pub mod uri;

pub use connection::{Connection, ConnectionStatus};
pub use envelope::{DecodeError, Envelope, EnvelopeContext};
pub use identifier::{
    Address, ConnectionId, ProtocolId, PublicId, SkillId, ValidationError, Version,
};
pub use mailbox::{InBox, OutBox};
pub use multiplexer::{AsyncMultiplexer, ConnectionError, Multiplexer};
pub use queue::Empty;
pub use uri::Uri;

/// The current version of the runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default timing and sizing values
pub mod defaults {
    use std::time::Duration;

    /// Deadline applied to each internal disconnect step
    pub const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(60);

    /// Deadline for bridging a blocking caller onto the event-loop thread
    pub const SYNC_CALL_TIMEOUT: Duration = Duration::from_secs(240);

    /// Poll interval of the stub connection's input-file reader
    pub const STUB_POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// Upper bound for a single framed envelope on the wire
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
}
