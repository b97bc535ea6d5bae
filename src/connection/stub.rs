//! File-pipe connection.
//!
//! Envelopes appended to an input file by an external process are surfaced
//! through `receive()`, and sent envelopes are appended to an output file.
//! One record is `to,sender,protocol_id,message,` with a trailing comma as
//! the record terminator (the writer adds a newline after it). The message
//! field is raw payload bytes and may itself contain commas and newlines,
//! so the reader splits a chunk on at most four commas and treats
//! everything between the third comma and the terminator as payload.

use super::{Connection, ConnectionStatus, StatusCell};
use crate::defaults;
use crate::envelope::Envelope;
use crate::identifier::{ConnectionId, ProtocolId};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A connection backed by a pair of files.
pub struct StubConnection {
    id: ConnectionId,
    input_path: PathBuf,
    output_path: PathBuf,
    restricted: HashSet<ProtocolId>,
    status: StatusCell,
    incoming: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    output: tokio::sync::Mutex<Option<File>>,
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StubConnection {
    /// Create a stub connection reading from `input_path` and writing to
    /// `output_path`. Missing files are created on connect.
    pub fn new(id: ConnectionId, input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            input_path: input_path.into(),
            output_path: output_path.into(),
            restricted: HashSet::new(),
            status: StatusCell::new(),
            incoming: tokio::sync::Mutex::new(None),
            output: tokio::sync::Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
        }
    }

    /// Limit the connection to the given protocols.
    pub fn restrict_to_protocols(mut self, protocols: HashSet<ProtocolId>) -> Self {
        self.restricted = protocols;
        self
    }
}

#[async_trait]
impl Connection for StubConnection {
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
            debug!(id = %self.id, "stub connection already established");
            return Ok(());
        }
        self.status.set(ConnectionStatus::Connecting);

        // Touch the input file so the external writer and the reader task
        // agree on its existence.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.input_path)
            .await
            .with_context(|| format!("cannot create input file {}", self.input_path.display()))?;
        let output = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .await
            .with_context(|| format!("cannot open output file {}", self.output_path.display()))?;
        *self.output.lock().await = Some(output);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.incoming.lock().await = Some(rx);
        *self.reader.lock() = Some(tokio::spawn(watch_input(self.input_path.clone(), tx)));

        self.status.set(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.status.get() == ConnectionStatus::Disconnected {
            debug!(id = %self.id, "stub connection already disconnected");
            return Ok(());
        }
        self.status.set(ConnectionStatus::Disconnecting);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        *self.output.lock().await = None;
        self.status.set(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        let mut guard = self.output.lock().await;
        let output = guard
            .as_mut()
            .ok_or_else(|| anyhow!("stub connection is not connected"))?;
        output.write_all(&encode_record(&envelope)).await?;
        output.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Option<Envelope> {
        let mut guard = self.incoming.lock().await;
        let incoming = guard.as_mut()?;
        incoming.recv().await
    }
}

/// Poll the input file for appended bytes and surface complete records.
///
/// The terminator of the available chunk is its final comma; anything
/// after it other than a single newline keeps the chunk buffered until
/// the writer finishes the record.
async fn watch_input(path: PathBuf, tx: mpsc::UnboundedSender<Envelope>) {
    let mut offset: u64 = 0;
    let mut pending: Vec<u8> = Vec::new();
    loop {
        tokio::time::sleep(defaults::STUB_POLL_INTERVAL).await;
        match read_appended(&path, &mut offset).await {
            Ok(chunk) => pending.extend_from_slice(&chunk),
            Err(err) => {
                debug!(%err, path = %path.display(), "cannot read stub input");
                continue;
            }
        }
        if pending.is_empty() {
            continue;
        }

        let body = match pending.last() {
            Some(b'\n') => &pending[..pending.len() - 1],
            _ => &pending[..],
        };
        if body.last() != Some(&b',') {
            continue; // partial record, keep buffering
        }
        match decode_record(body) {
            Ok(envelope) => {
                if tx.send(envelope).is_err() {
                    return;
                }
            }
            Err(err) => error!(%err, "error when processing a record"),
        }
        pending.clear();
    }
}

async fn read_appended(path: &Path, offset: &mut u64) -> Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    if len < *offset {
        // input file was truncated, start over
        *offset = 0;
    }
    if len == *offset {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(*offset)).await?;
    let mut chunk = Vec::with_capacity((len - *offset) as usize);
    file.read_to_end(&mut chunk).await?;
    *offset += chunk.len() as u64;
    Ok(chunk)
}

fn encode_record(envelope: &Envelope) -> Vec<u8> {
    let mut record = Vec::with_capacity(envelope.message.len() + 64);
    record.extend_from_slice(envelope.to.as_bytes());
    record.push(b',');
    record.extend_from_slice(envelope.sender.as_bytes());
    record.push(b',');
    record.extend_from_slice(envelope.protocol_id.to_string().as_bytes());
    record.push(b',');
    record.extend_from_slice(&envelope.message);
    record.extend_from_slice(b",\n");
    record
}

/// Decode one `to,sender,protocol_id,message,` record, terminator included.
fn decode_record(record: &[u8]) -> Result<Envelope> {
    let body = record
        .strip_suffix(b",")
        .ok_or_else(|| anyhow!("record does not end with the ',' terminator"))?;
    let mut parts = body.splitn(4, |byte| *byte == b',');
    let to = text_field(parts.next(), "to")?;
    let sender = text_field(parts.next(), "sender")?;
    let protocol_id: ProtocolId = text_field(parts.next(), "protocol_id")?.parse()?;
    let message = parts
        .next()
        .ok_or_else(|| anyhow!("record has no message field"))?
        .to_vec();
    Ok(Envelope::new(to, sender, protocol_id, message))
}

fn text_field(part: Option<&[u8]>, name: &str) -> Result<String> {
    let bytes = part.ok_or_else(|| anyhow!("record has no {} field", name))?;
    Ok(std::str::from_utf8(bytes)
        .with_context(|| format!("{} field is not valid utf-8", name))?
        .to_string())
}
