//! # Connection Multiplexer
//!
//! The multiplexer drives many connections at once behind one pair of
//! queues. Envelopes received on any connection drain into the in-queue;
//! envelopes put on the out-queue are routed to a connection and sent.
//!
//! ```text
//!                        ┌────────────────────────────┐
//!  OutBox.put ──────────▶│ out-queue ──▶ send loop    │──▶ Connection.send
//!                        │               (routing)    │
//!                        │                            │
//!  InBox.get  ◀──────────│ in-queue ◀── receive tasks │◀── Connection.receive
//!                        └────────────────────────────┘
//! ```
//!
//! Routing picks the first of: the envelope's context hint, the
//! protocol-keyed default routing table, the default connection. A
//! connection with a non-empty protocol whitelist silently drops
//! envelopes of other protocols (with a warning).
//!
//! Two layers are provided. [`AsyncMultiplexer`] is the cooperative core
//! and runs wherever its futures are polled. [`Multiplexer`] wraps it for
//! blocking callers: it owns one worker thread running a current-thread
//! runtime and bridges calls onto it with a submit-and-wait channel.

use crate::connection::{Connection, ConnectionStatus};
use crate::defaults;
use crate::envelope::Envelope;
use crate::identifier::{ConnectionId, ProtocolId};
use crate::queue::{Empty, InboundQueue};
use anyhow::anyhow;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Error raised by multiplexer lifecycle and routing operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The multiplexer needs at least one connection.
    #[error("list of connections cannot be empty")]
    NoConnections,
    /// The default connection index does not select a connection.
    #[error("default connection index {index} is out of range for {count} connections")]
    DefaultIndexOutOfRange {
        /// The offending index.
        index: usize,
        /// How many connections there are.
        count: usize,
    },
    /// Two connections share an id.
    #[error("connection ids must be unique, '{0}' appears twice")]
    DuplicateConnectionId(ConnectionId),
    /// Routing resolved to an id no connection carries.
    #[error("no connection registered with id '{0}'")]
    UnknownConnection(ConnectionId),
    /// At least one child connection failed to connect.
    #[error("failed to connect the multiplexer")]
    ConnectFailed,
    /// The multiplexer could not shut down cleanly.
    #[error("failed to disconnect the multiplexer")]
    DisconnectFailed,
    /// The operation needs a connected multiplexer.
    #[error("multiplexer is not connected")]
    NotConnected,
    /// A cross-thread call missed its deadline.
    #[error("'{0}' did not complete within the deadline")]
    Deadline(&'static str),
}

/// Shared state of a multiplexer, visible to its loop tasks.
struct Core {
    connections: Vec<Arc<dyn Connection>>,
    by_id: HashMap<ConnectionId, Arc<dyn Connection>>,
    default_connection: Arc<dyn Connection>,
    // swapped atomically as a whole, see set_default_routing
    default_routing: RwLock<Arc<HashMap<ProtocolId, ConnectionId>>>,
    in_queue: InboundQueue<Envelope>,
    out_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Option<Envelope>>>>,
    out_depth: AtomicUsize,
    connected: AtomicBool,
}

struct LoopHandles {
    receive: Option<JoinHandle<()>>,
    send: Option<JoinHandle<()>>,
}

/// Cooperative connection multiplexer.
pub struct AsyncMultiplexer {
    core: Arc<Core>,
    // lifecycle lock: serializes connect and disconnect, nothing else
    lifecycle: tokio::sync::Mutex<LoopHandles>,
}

impl AsyncMultiplexer {
    /// Create a multiplexer over the given connections.
    ///
    /// `default_connection_index` selects the connection used when
    /// neither a context hint nor default routing applies. Construction
    /// validates the connection set but does not connect anything.
    pub fn new(
        connections: Vec<Arc<dyn Connection>>,
        default_connection_index: usize,
    ) -> Result<Self, ConnectionError> {
        if connections.is_empty() {
            return Err(ConnectionError::NoConnections);
        }
        if default_connection_index >= connections.len() {
            return Err(ConnectionError::DefaultIndexOutOfRange {
                index: default_connection_index,
                count: connections.len(),
            });
        }
        let mut by_id: HashMap<ConnectionId, Arc<dyn Connection>> = HashMap::new();
        for connection in &connections {
            if by_id
                .insert(connection.id().clone(), connection.clone())
                .is_some()
            {
                return Err(ConnectionError::DuplicateConnectionId(
                    connection.id().clone(),
                ));
            }
        }
        let default_connection = connections[default_connection_index].clone();
        let core = Arc::new(Core {
            connections,
            by_id,
            default_connection,
            default_routing: RwLock::new(Arc::new(HashMap::new())),
            in_queue: InboundQueue::new(),
            out_tx: parking_lot::Mutex::new(None),
            out_depth: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
        });
        // the queues are live only between connect and disconnect
        core.in_queue.close();
        Ok(Self {
            core,
            lifecycle: tokio::sync::Mutex::new(LoopHandles {
                receive: None,
                send: None,
            }),
        })
    }

    /// The connections, in declared order.
    pub fn connections(&self) -> &[Arc<dyn Connection>] {
        &self.core.connections
    }

    /// Whether every child connection reports connected.
    pub fn is_connected(&self) -> bool {
        self.core
            .connections
            .iter()
            .all(|connection| connection.status().is_connected())
    }

    /// Snapshot of the default routing table.
    pub fn default_routing(&self) -> Arc<HashMap<ProtocolId, ConnectionId>> {
        self.core.default_routing.read().clone()
    }

    /// Replace the default routing table atomically. In-flight sends see
    /// either the old or the new table, never a mix.
    pub fn set_default_routing(&self, routing: HashMap<ProtocolId, ConnectionId>) {
        *self.core.default_routing.write() = Arc::new(routing);
    }

    /// Connect all children and start the loop tasks.
    ///
    /// Children connect sequentially in declared order. When one fails,
    /// the already-connected prefix is disconnected again and the whole
    /// operation fails.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut handles = self.lifecycle.lock().await;
        if self.core.connected.load(Ordering::SeqCst) {
            debug!("multiplexer already connected");
            return Ok(());
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.core.out_tx.lock() = Some(out_tx);
        self.core.out_depth.store(0, Ordering::SeqCst);
        self.core.in_queue.reopen();

        if let Err(err) = self.connect_all().await {
            error!(%err, "exception on connect");
            self.stop(&mut handles).await;
            return Err(ConnectionError::ConnectFailed);
        }

        self.core.connected.store(true, Ordering::SeqCst);
        handles.receive = Some(tokio::spawn(receive_loop(self.core.clone())));
        handles.send = Some(tokio::spawn(send_loop(self.core.clone(), out_rx)));
        debug!("multiplexer connected and running");
        Ok(())
    }

    /// Disconnect all children and stop the loop tasks.
    ///
    /// Safe to call when not connected: the loop tasks are still drained
    /// idempotently. Individual child failures are logged, not raised;
    /// only a stuck shutdown step raises.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        debug!("disconnect called");
        let mut handles = self.lifecycle.lock().await;
        if !self.core.connected.load(Ordering::SeqCst) {
            debug!("multiplexer already disconnected");
            self.stop(&mut handles).await;
            return Ok(());
        }
        if timeout(defaults::SHUTDOWN_STEP_TIMEOUT, self.disconnect_all())
            .await
            .is_err()
        {
            error!("timed out while disconnecting connections");
            return Err(ConnectionError::DisconnectFailed);
        }
        self.stop(&mut handles).await;
        self.core.connected.store(false, Ordering::SeqCst);
        debug!("multiplexer disconnected");
        Ok(())
    }

    async fn connect_all(&self) -> anyhow::Result<()> {
        debug!("bringing multiplexer connections up");
        let mut brought_up: Vec<Arc<dyn Connection>> = Vec::new();
        for connection in &self.core.connections {
            match connect_one(connection).await {
                Ok(()) => brought_up.push(connection.clone()),
                Err(err) => {
                    error!(id = %connection.id(), %err, "error while connecting");
                    for done in brought_up.iter().rev() {
                        if let Err(err) = done.disconnect().await {
                            error!(id = %done.id(), %err, "error while rolling back");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn disconnect_all(&self) {
        debug!("tearing multiplexer connections down");
        for connection in &self.core.connections {
            if let Err(err) = disconnect_one(connection).await {
                error!(id = %connection.id(), %err, "error while disconnecting");
            }
        }
    }

    /// Stop the loop tasks, sweep up stragglers and end the in-queue
    /// stream. Idempotent.
    async fn stop(&self, handles: &mut LoopHandles) {
        debug!("stopping multiplexer");
        if let Some(receive) = handles.receive.take() {
            receive.abort();
            let _ = receive.await; // cancellation is not an error
        }
        if let Some(mut send) = handles.send.take() {
            if !send.is_finished() {
                // wake the loop with the stop sentinel so it consumes it
                let sender = self.core.out_tx.lock().clone();
                if let Some(sender) = sender {
                    let _ = sender.send(None);
                }
                if timeout(defaults::SHUTDOWN_STEP_TIMEOUT, &mut send)
                    .await
                    .is_err()
                {
                    warn!("send loop ignored the stop sentinel, cancelling it");
                    send.abort();
                    let _ = send.await;
                }
            } else {
                let _ = send.await;
            }
        }
        // sweep connections a failed connect or partial shutdown left up
        for connection in &self.core.connections {
            if matches!(
                connection.status(),
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            ) {
                if let Err(err) = disconnect_one(connection).await {
                    error!(id = %connection.id(), %err, "error while disconnecting");
                }
            }
        }
        *self.core.out_tx.lock() = None;
        self.core.in_queue.close();
        debug!("multiplexer stopped");
    }

    /// Synchronous dequeue from the in-queue.
    ///
    /// With `block` false an empty queue raises [`Empty`] immediately;
    /// with `block` true the optional timeout is respected.
    pub fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Envelope, Empty> {
        self.core.in_queue.get(block, timeout)
    }

    /// Cooperative dequeue; raises [`Empty`] once the stream has ended.
    pub async fn async_get(&self) -> Result<Envelope, Empty> {
        self.core.in_queue.async_get().await
    }

    /// Cooperative wait for a non-empty in-queue without consuming.
    pub async fn async_wait(&self) {
        self.core.in_queue.async_wait().await;
    }

    /// Schedule an envelope for sending.
    pub async fn put(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        let sender = self
            .core
            .out_tx
            .lock()
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        self.core.out_depth.fetch_add(1, Ordering::SeqCst);
        if sender.send(Some(envelope)).is_err() {
            self.core.out_depth.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectionError::NotConnected);
        }
        Ok(())
    }

    /// Whether the in-queue holds no envelope.
    pub fn in_queue_empty(&self) -> bool {
        self.core.in_queue.is_empty()
    }

    /// Whether the out-queue holds no envelope.
    pub fn out_queue_empty(&self) -> bool {
        self.core.out_depth.load(Ordering::SeqCst) == 0
    }
}

async fn connect_one(connection: &Arc<dyn Connection>) -> anyhow::Result<()> {
    debug!(id = %connection.id(), "processing connection");
    if connection.status().is_connected() {
        debug!(id = %connection.id(), "connection already established");
        return Ok(());
    }
    connection.connect().await?;
    if !connection.status().is_connected() {
        return Err(anyhow!("connection did not reach the connected state"));
    }
    debug!(id = %connection.id(), "connection set up successfully");
    Ok(())
}

async fn disconnect_one(connection: &Arc<dyn Connection>) -> anyhow::Result<()> {
    debug!(id = %connection.id(), "processing connection");
    if !connection.status().is_connected() {
        debug!(id = %connection.id(), "connection already disconnected");
        return Ok(());
    }
    connection.disconnect().await?;
    debug!(id = %connection.id(), "connection disconnected successfully");
    Ok(())
}

/// Keep one receive task in flight per connected connection and drain
/// completions into the in-queue.
async fn receive_loop(core: Arc<Core>) {
    debug!("starting receive loop");
    let mut in_flight: JoinSet<(usize, Option<Envelope>)> = JoinSet::new();
    for (index, connection) in core.connections.iter().enumerate() {
        spawn_receive(&mut in_flight, index, connection.clone());
    }

    while core.connected.load(Ordering::SeqCst) {
        debug!("waiting for incoming envelopes");
        let Some(completed) = in_flight.join_next().await else {
            debug!("all receive streams ended");
            break;
        };
        match completed {
            Ok((index, Some(envelope))) => {
                core.in_queue.push(envelope);
                let connection = &core.connections[index];
                if connection.status().is_connected() {
                    spawn_receive(&mut in_flight, index, connection.clone());
                }
            }
            Ok((index, None)) => {
                // drained; this connection gets no new receive task
                debug!(id = %core.connections[index].id(), "receive stream ended");
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => error!(%err, "receive task failed"),
        }
    }

    in_flight.abort_all();
    core.in_queue.close();
    debug!("receive loop terminated");
}

fn spawn_receive(
    in_flight: &mut JoinSet<(usize, Option<Envelope>)>,
    index: usize,
    connection: Arc<dyn Connection>,
) {
    in_flight.spawn(async move { (index, connection.receive().await) });
}

/// Drain the out-queue, routing each envelope to a connection.
async fn send_loop(core: Arc<Core>, mut out_queue: mpsc::UnboundedReceiver<Option<Envelope>>) {
    debug!("starting send loop");
    loop {
        debug!("waiting for outgoing envelopes");
        let Some(item) = out_queue.recv().await else {
            debug!("out queue dropped, quitting the send loop");
            return;
        };
        let Some(envelope) = item else {
            debug!("received stop sentinel, quitting the send loop");
            return;
        };
        core.out_depth.fetch_sub(1, Ordering::SeqCst);
        debug!(%envelope, "sending envelope");
        match route(&core, &envelope) {
            Ok(Some(connection)) => {
                if let Err(err) = connection.send(envelope).await {
                    // transport errors are contained, the loop survives
                    error!(%err, "error in the sending loop");
                }
            }
            Ok(None) => {} // dropped by the protocol whitelist
            Err(err) => error!(%err, "cannot route envelope"),
        }
    }
}

/// Pick the connection for an outbound envelope.
///
/// `Ok(None)` means the envelope is dropped by the chosen connection's
/// protocol whitelist.
fn route(core: &Core, envelope: &Envelope) -> Result<Option<Arc<dyn Connection>>, ConnectionError> {
    let mut connection_id = envelope.context.connection_id.clone();
    if connection_id.is_none() {
        let table = core.default_routing.read().clone();
        if let Some(target) = table.get(&envelope.protocol_id) {
            debug!(%target, "using default routing");
            connection_id = Some(target.clone());
        }
    }
    let connection = match connection_id {
        Some(id) => match core.by_id.get(&id) {
            Some(connection) => connection.clone(),
            None => return Err(ConnectionError::UnknownConnection(id)),
        },
        None => {
            debug!(id = %core.default_connection.id(), "using default connection");
            core.default_connection.clone()
        }
    };
    let restricted = connection.restricted_to_protocols();
    if !restricted.is_empty() && !restricted.contains(&envelope.protocol_id) {
        warn!(
            connection = %connection.id(),
            protocol = %envelope.protocol_id,
            "connection cannot handle protocol, dropping envelope"
        );
        return Ok(None);
    }
    Ok(Some(connection))
}

/// One OS thread running a current-thread runtime for the cooperative
/// core, plus the handle used to submit work onto it.
struct EventLoopRunner {
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EventLoopRunner {
    fn start() -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("agent-mailbox-loop".to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
            })?;
        Ok(Self {
            handle,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn handle(&self) -> Handle {
        self.handle.clone()
    }

    fn call<F, T>(&self, what: &'static str, future: F) -> Result<T, ConnectionError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        submit_and_wait(&self.handle, what, future)
    }

    fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Run a future on the event-loop thread and block until it resolves,
/// bounded by the cross-thread call deadline.
fn submit_and_wait<F, T>(handle: &Handle, what: &'static str, future: F) -> Result<T, ConnectionError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();
    handle.spawn(async move {
        let _ = tx.send(future.await);
    });
    rx.recv_timeout(defaults::SYNC_CALL_TIMEOUT)
        .map_err(|_| ConnectionError::Deadline(what))
}

struct FacadeState {
    runner: Option<EventLoopRunner>,
    connected: bool,
}

/// Blocking façade over [`AsyncMultiplexer`] for callers that are not
/// themselves cooperative.
///
/// The first `connect()` starts the event-loop thread; `disconnect()`
/// stops it again. Both are idempotent, and disconnecting without a prior
/// connect is a no-op.
pub struct Multiplexer {
    inner: Arc<AsyncMultiplexer>,
    state: parking_lot::Mutex<FacadeState>,
}

impl Multiplexer {
    /// Create a multiplexer over the given connections; see
    /// [`AsyncMultiplexer::new`].
    pub fn new(
        connections: Vec<Arc<dyn Connection>>,
        default_connection_index: usize,
    ) -> Result<Self, ConnectionError> {
        Ok(Self {
            inner: Arc::new(AsyncMultiplexer::new(
                connections,
                default_connection_index,
            )?),
            state: parking_lot::Mutex::new(FacadeState {
                runner: None,
                connected: false,
            }),
        })
    }

    /// Connect, blocking the caller until the cooperative connect ran on
    /// the event-loop thread.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if state.runner.is_none() {
            let runner = EventLoopRunner::start().map_err(|err| {
                error!(%err, "cannot start the event loop thread");
                ConnectionError::ConnectFailed
            })?;
            state.runner = Some(runner);
        }
        let runner = state.runner.as_ref().ok_or(ConnectionError::ConnectFailed)?;
        let inner = self.inner.clone();
        runner.call("connect", async move { inner.connect().await })??;
        state.connected = true;
        Ok(())
    }

    /// Disconnect and stop the event-loop thread.
    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        debug!("disconnect called");
        let mut state = self.state.lock();
        let Some(runner) = state.runner.take() else {
            return Ok(());
        };
        let mut result = Ok(());
        if state.connected {
            let inner = self.inner.clone();
            result = runner
                .call("disconnect", async move { inner.disconnect().await })
                .and_then(|inner_result| inner_result);
            state.connected = false;
        }
        runner.stop();
        debug!("event loop thread stopped");
        result
    }

    /// Schedule an envelope for sending, blocking until the cooperative
    /// enqueue ran.
    pub fn put(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        let handle = {
            let state = self.state.lock();
            state
                .runner
                .as_ref()
                .ok_or(ConnectionError::NotConnected)?
                .handle()
        };
        let inner = self.inner.clone();
        submit_and_wait(&handle, "put", async move { inner.put(envelope).await })?
    }

    /// Synchronous dequeue from the in-queue; see [`AsyncMultiplexer::get`].
    pub fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Envelope, Empty> {
        self.inner.get(block, timeout)
    }

    /// Cooperative dequeue; see [`AsyncMultiplexer::async_get`].
    pub async fn async_get(&self) -> Result<Envelope, Empty> {
        self.inner.async_get().await
    }

    /// Cooperative wait; see [`AsyncMultiplexer::async_wait`].
    pub async fn async_wait(&self) {
        self.inner.async_wait().await;
    }

    /// Whether every child connection reports connected.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// The connections, in declared order.
    pub fn connections(&self) -> &[Arc<dyn Connection>] {
        self.inner.connections()
    }

    /// Snapshot of the default routing table.
    pub fn default_routing(&self) -> Arc<HashMap<ProtocolId, ConnectionId>> {
        self.inner.default_routing()
    }

    /// Replace the default routing table atomically.
    pub fn set_default_routing(&self, routing: HashMap<ProtocolId, ConnectionId>) {
        self.inner.set_default_routing(routing);
    }

    /// Whether the in-queue holds no envelope.
    pub fn in_queue_empty(&self) -> bool {
        self.inner.in_queue_empty()
    }

    /// Whether the out-queue holds no envelope.
    pub fn out_queue_empty(&self) -> bool {
        self.inner.out_queue_empty()
    }
}
