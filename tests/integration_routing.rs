mod common;

use agent_mailbox::{AsyncMultiplexer, Connection, Envelope, EnvelopeContext};
use common::{protocol, wait_until, RecordingConnection};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// An explicit context hint routes past the default connection.
#[tokio::test]
async fn context_hint_routes_to_named_connection() {
    let c1 = RecordingConnection::new("one");
    let c2 = RecordingConnection::new("two");
    let multiplexer = AsyncMultiplexer::new(
        vec![c1.clone() as Arc<dyn Connection>, c2.clone()],
        0,
    )
    .unwrap();
    multiplexer.connect().await.unwrap();

    let envelope = Envelope::new("a", "b", protocol("x"), b"payload".to_vec())
        .with_context(EnvelopeContext::new(Some(c2.id().clone()), None));
    multiplexer.put(envelope.clone()).await.unwrap();

    assert!(wait_until(|| !c2.sent().is_empty(), DELIVERY_TIMEOUT).await);
    assert_eq!(c2.sent(), vec![envelope]);
    assert!(c1.sent().is_empty());

    multiplexer.disconnect().await.unwrap();
}

/// The protocol-keyed default routing table is consulted when the
/// envelope carries no hint.
#[tokio::test]
async fn default_routing_table_routes_by_protocol() {
    let c1 = RecordingConnection::new("one");
    let c2 = RecordingConnection::new("two");
    let multiplexer = AsyncMultiplexer::new(
        vec![c1.clone() as Arc<dyn Connection>, c2.clone()],
        0,
    )
    .unwrap();
    multiplexer.set_default_routing(HashMap::from([(protocol("x"), c2.id().clone())]));
    multiplexer.connect().await.unwrap();

    let envelope = Envelope::new("a", "b", protocol("x"), b"payload".to_vec());
    multiplexer.put(envelope.clone()).await.unwrap();

    assert!(wait_until(|| !c2.sent().is_empty(), DELIVERY_TIMEOUT).await);
    assert_eq!(c2.sent(), vec![envelope]);
    assert!(c1.sent().is_empty());

    multiplexer.disconnect().await.unwrap();
}

/// Without hint or table entry, the default connection is used.
#[tokio::test]
async fn falls_back_to_default_connection() {
    let c1 = RecordingConnection::new("one");
    let c2 = RecordingConnection::new("two");
    let multiplexer = AsyncMultiplexer::new(
        vec![c1.clone() as Arc<dyn Connection>, c2.clone()],
        1,
    )
    .unwrap();
    multiplexer.connect().await.unwrap();

    let envelope = Envelope::new("a", "b", protocol("x"), b"payload".to_vec());
    multiplexer.put(envelope.clone()).await.unwrap();

    assert!(wait_until(|| !c2.sent().is_empty(), DELIVERY_TIMEOUT).await);
    assert_eq!(c2.sent(), vec![envelope]);
    assert!(c1.sent().is_empty());

    multiplexer.disconnect().await.unwrap();
}

/// A connection restricted to other protocols drops the envelope with a
/// warning and no error escapes to the caller.
#[tokio::test]
async fn protocol_whitelist_drops_foreign_envelope() {
    let c1 = RecordingConnection::new("one");
    let c2 = RecordingConnection::restricted_to("two", HashSet::from([protocol("y")]));
    let multiplexer = AsyncMultiplexer::new(
        vec![c1.clone() as Arc<dyn Connection>, c2.clone()],
        0,
    )
    .unwrap();
    multiplexer.connect().await.unwrap();

    let dropped = Envelope::new("a", "b", protocol("x"), b"dropped".to_vec())
        .with_context(EnvelopeContext::new(Some(c2.id().clone()), None));
    multiplexer.put(dropped).await.unwrap();

    let accepted = Envelope::new("a", "b", protocol("y"), b"accepted".to_vec())
        .with_context(EnvelopeContext::new(Some(c2.id().clone()), None));
    multiplexer.put(accepted.clone()).await.unwrap();

    // the whitelisted envelope arrives, the foreign one never does
    assert!(wait_until(|| !c2.sent().is_empty(), DELIVERY_TIMEOUT).await);
    assert_eq!(c2.sent(), vec![accepted]);
    assert!(c1.sent().is_empty());

    multiplexer.disconnect().await.unwrap();
}

/// Routing to an unknown connection id is logged and dropped; the send
/// loop keeps serving later envelopes.
#[tokio::test]
async fn unknown_connection_id_is_dropped_and_loop_survives() {
    let c1 = RecordingConnection::new("one");
    let multiplexer =
        AsyncMultiplexer::new(vec![c1.clone() as Arc<dyn Connection>], 0).unwrap();
    multiplexer.connect().await.unwrap();

    let stray = Envelope::new("a", "b", protocol("x"), b"stray".to_vec()).with_context(
        EnvelopeContext::new(Some("test/absent:0.1.0".parse().unwrap()), None),
    );
    multiplexer.put(stray).await.unwrap();

    let routed = Envelope::new("a", "b", protocol("x"), b"routed".to_vec());
    multiplexer.put(routed.clone()).await.unwrap();

    assert!(wait_until(|| !c1.sent().is_empty(), DELIVERY_TIMEOUT).await);
    assert_eq!(c1.sent(), vec![routed]);

    multiplexer.disconnect().await.unwrap();
}

/// Envelopes bound for the same connection keep their enqueue order.
#[tokio::test]
async fn order_is_preserved_per_connection() {
    let c1 = RecordingConnection::new("one");
    let multiplexer =
        AsyncMultiplexer::new(vec![c1.clone() as Arc<dyn Connection>], 0).unwrap();
    multiplexer.connect().await.unwrap();

    let envelopes: Vec<Envelope> = (0..10)
        .map(|i| Envelope::new("a", "b", protocol("x"), vec![i]))
        .collect();
    for envelope in &envelopes {
        multiplexer.put(envelope.clone()).await.unwrap();
    }

    assert!(wait_until(|| c1.sent().len() == envelopes.len(), DELIVERY_TIMEOUT).await);
    assert_eq!(c1.sent(), envelopes);

    multiplexer.disconnect().await.unwrap();
}
