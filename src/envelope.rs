//! # Envelope Data Model and Wire Format
//!
//! The envelope is the unit every connection carries: a routing header
//! (receiver, sender, protocol id), an opaque payload owned by that
//! protocol, and an optional context with local routing hints.
//!
//! On the wire an envelope is a proto3 record so that runtimes in other
//! languages can produce and consume it:
//!
//! | tag | field       | type   |
//! |-----|-------------|--------|
//! | 1   | to          | string |
//! | 2   | sender      | string |
//! | 3   | protocol_id | string |
//! | 4   | message     | bytes  |
//! | 5   | uri         | string |
//!
//! The `uri` field follows proto3 unset-field conventions: an absent
//! context URI is written as the empty string, and an empty string decodes
//! back to an envelope with an empty context. The context's
//! `connection_id` is a local routing hint and never leaves the process.

use crate::identifier::{Address, ConnectionId, ProtocolId, SkillId, ValidationError};
use crate::uri::Uri;
use prost::Message as _;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Error raised when envelope bytes cannot be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes are not a well-formed envelope record.
    #[error("malformed envelope record: {0}")]
    Record(#[from] prost::DecodeError),
    /// The protocol id field is not a canonical public id.
    #[error("malformed protocol id in envelope: {0}")]
    ProtocolId(ValidationError),
    /// The uri field is non-empty but not RFC3986 compliant.
    #[error("malformed uri in envelope: {0}")]
    Uri(ValidationError),
}

/// Wire representation of an envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
struct EnvelopeRecord {
    #[prost(string, tag = "1")]
    to: String,
    #[prost(string, tag = "2")]
    sender: String,
    #[prost(string, tag = "3")]
    protocol_id: String,
    #[prost(bytes = "vec", tag = "4")]
    message: Vec<u8>,
    #[prost(string, tag = "5")]
    uri: String,
}

/// Routing hints and annotations attached to an envelope.
///
/// `connection_id` pins the envelope to a specific connection when the
/// multiplexer routes it; `uri` annotates the envelope and doubles as a
/// skill reference when its path parses as a public id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnvelopeContext {
    /// Connection to route the outgoing envelope through, if any.
    pub connection_id: Option<ConnectionId>,
    /// URI sent along with the envelope, if any.
    pub uri: Option<Uri>,
}

impl EnvelopeContext {
    /// Create a context from its parts.
    pub fn new(connection_id: Option<ConnectionId>, uri: Option<Uri>) -> Self {
        Self { connection_id, uri }
    }
}

/// The top-level message unit for agent to agent communication.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Address of the receiver.
    pub to: Address,
    /// Address of the sender.
    pub sender: Address,
    /// Protocol the payload belongs to.
    pub protocol_id: ProtocolId,
    /// Opaque payload; never inspected by the runtime.
    pub message: Vec<u8>,
    /// Routing hints; defaults to the empty context.
    pub context: EnvelopeContext,
}

impl Envelope {
    /// Create an envelope with an empty context.
    pub fn new(
        to: impl Into<Address>,
        sender: impl Into<Address>,
        protocol_id: ProtocolId,
        message: Vec<u8>,
    ) -> Self {
        Self {
            to: to.into(),
            sender: sender.into(),
            protocol_id,
            message,
            context: EnvelopeContext::default(),
        }
    }

    /// Attach a context to the envelope.
    pub fn with_context(mut self, context: EnvelopeContext) -> Self {
        self.context = context;
        self
    }

    /// Derive the skill id from the context URI, if its path holds one.
    pub fn skill_id(&self) -> Option<SkillId> {
        let uri = self.context.uri.as_ref()?;
        match SkillId::from_uri_path(uri.path()) {
            Ok(skill_id) => Some(skill_id),
            Err(_) => {
                debug!(path = uri.path(), "uri path is not a valid skill id");
                None
            }
        }
    }

    /// Encode the envelope into its wire record.
    pub fn encode(&self) -> Vec<u8> {
        let record = EnvelopeRecord {
            to: self.to.clone(),
            sender: self.sender.clone(),
            protocol_id: self.protocol_id.to_string(),
            message: self.message.clone(),
            uri: self
                .context
                .uri
                .as_ref()
                .map_or_else(String::new, |uri| uri.raw().to_string()),
        };
        record.encode_to_vec()
    }

    /// Decode an envelope from its wire record.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let record = EnvelopeRecord::decode(bytes)?;
        let protocol_id = record
            .protocol_id
            .parse()
            .map_err(DecodeError::ProtocolId)?;
        let context = if record.uri.is_empty() {
            EnvelopeContext::default()
        } else {
            let uri = Uri::new(&record.uri).map_err(DecodeError::Uri)?;
            EnvelopeContext::new(None, Some(uri))
        };
        Ok(Self {
            to: record.to,
            sender: record.sender,
            protocol_id,
            message: record.message,
            context,
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope(to={}, sender={}, protocol_id={}, message={:?})",
            self.to, self.sender, self.protocol_id, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> ProtocolId {
        "fetchai/default:0.1.0".parse().unwrap()
    }

    #[test]
    fn round_trip_with_uri_context() {
        let context = EnvelopeContext::new(None, Some(Uri::new("http://x/y").unwrap()));
        let envelope = Envelope::new("A", "B", protocol(), b"hello".to_vec()).with_context(context);

        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn round_trip_without_context() {
        let envelope = Envelope::new("A", "B", protocol(), vec![0, 1, 2, 255]);
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn connection_id_hint_is_not_serialized() {
        let hint: ConnectionId = "local/stub:0.1.0".parse().unwrap();
        let context = EnvelopeContext::new(Some(hint), None);
        let envelope = Envelope::new("A", "B", protocol(), b"x".to_vec()).with_context(context);

        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded.context, EnvelopeContext::default());
        assert_eq!(decoded.to, envelope.to);
        assert_eq!(decoded.message, envelope.message);
    }

    #[test]
    fn malformed_bytes_are_rejected() {
        // A lone group-end tag is never a valid record.
        assert!(matches!(
            Envelope::decode(&[0x3c]),
            Err(DecodeError::Record(_))
        ));
    }

    #[test]
    fn malformed_uri_field_is_rejected() {
        let record = EnvelopeRecord {
            to: "A".into(),
            sender: "B".into(),
            protocol_id: protocol().to_string(),
            message: vec![],
            uri: "http://host:bad_port/x".into(),
        };
        assert!(matches!(
            Envelope::decode(&record.encode_to_vec()),
            Err(DecodeError::Uri(_))
        ));
    }

    #[test]
    fn skill_id_from_uri_path() {
        let context =
            EnvelopeContext::new(None, Some(Uri::new("http://x/author/skill/0.1.0").unwrap()));
        let envelope = Envelope::new("A", "B", protocol(), vec![]).with_context(context);
        assert_eq!(
            envelope.skill_id(),
            Some("author/skill:0.1.0".parse().unwrap())
        );

        let plain = Envelope::new("A", "B", protocol(), vec![]);
        assert_eq!(plain.skill_id(), None);
    }
}
