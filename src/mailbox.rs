//! # InBox and OutBox Façades
//!
//! Directional views onto a multiplexer's queues. The inbox can only
//! consume envelopes, the outbox can only enqueue them; neither owns the
//! multiplexer's lifecycle.

use crate::envelope::Envelope;
use crate::identifier::{Address, ProtocolId};
use crate::multiplexer::{ConnectionError, Multiplexer};
use crate::queue::Empty;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A queue from which you can only consume envelopes.
pub struct InBox {
    multiplexer: Arc<Multiplexer>,
}

impl InBox {
    /// Create an inbox over the given multiplexer.
    pub fn new(multiplexer: Arc<Multiplexer>) -> Self {
        Self { multiplexer }
    }

    /// Whether there is no envelope waiting.
    pub fn empty(&self) -> bool {
        self.multiplexer.in_queue_empty()
    }

    /// Dequeue an envelope.
    ///
    /// With `block` false an empty queue raises [`Empty`] immediately;
    /// with `block` true the optional timeout is respected.
    pub fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Envelope, Empty> {
        debug!("checking for envelope on the in queue");
        let envelope = self.multiplexer.get(block, timeout)?;
        debug!(%envelope, "incoming envelope");
        Ok(envelope)
    }

    /// Dequeue an envelope without waiting, or `None` when there is none.
    pub fn get_nowait(&self) -> Option<Envelope> {
        self.get(false, None).ok()
    }

    /// Cooperative dequeue; raises [`Empty`] once the stream has ended.
    pub async fn async_get(&self) -> Result<Envelope, Empty> {
        debug!("checking for envelope on the in queue asynchronously");
        let envelope = self.multiplexer.async_get().await?;
        debug!(%envelope, "incoming envelope");
        Ok(envelope)
    }

    /// Cooperative wait for a waiting envelope without consuming it.
    pub async fn async_wait(&self) {
        self.multiplexer.async_wait().await;
    }
}

/// A queue onto which you can only enqueue envelopes.
pub struct OutBox {
    multiplexer: Arc<Multiplexer>,
}

impl OutBox {
    /// Create an outbox over the given multiplexer.
    pub fn new(multiplexer: Arc<Multiplexer>) -> Self {
        Self { multiplexer }
    }

    /// Whether there is no envelope pending.
    pub fn empty(&self) -> bool {
        self.multiplexer.out_queue_empty()
    }

    /// Enqueue an envelope for sending.
    pub fn put(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        debug!(%envelope, "putting envelope on the out queue");
        self.multiplexer.put(envelope)
    }

    /// Construct an envelope with an empty context and enqueue it.
    pub fn put_message(
        &self,
        to: impl Into<Address>,
        sender: impl Into<Address>,
        protocol_id: ProtocolId,
        message: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        self.put(Envelope::new(to, sender, protocol_id, message))
    }
}
