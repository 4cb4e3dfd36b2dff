mod common;

use std::{net::TcpStream, sync::Arc, time::Duration};

use common::*;
use sturdy_common::{Descriptor, RpcError, RpcEvent, TlsStream, WireMessage, WireValue};
use sturdy_tub::{Connection, FingerprintCache, Negotiator, Tub, Value, GET_REFERENCE_BY_NAME};

/// Negotiates with `tub` by hand, returning the raw stream and the tub's side
/// of the connection.
fn raw_peer(tub: &Tub, descriptor: &Descriptor) -> (TlsStream, Connection) {
    let negotiator =
        Negotiator::new(identity("bob"), options(), Arc::new(FingerprintCache::new())).unwrap();
    let socket = TcpStream::connect((descriptor.host(), descriptor.port())).unwrap();
    let negotiated = negotiator.initiate(socket, descriptor).unwrap();
    negotiated
        .stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    assert!(wait_until(|| tub.connection_count() == 1));
    let connection = tub.connections().pop().unwrap();
    (negotiated.stream, connection)
}

fn expect_call(stream: &mut TlsStream) -> u64 {
    match stream.recv_message(1 << 20).unwrap() {
        WireMessage::Call { request_id, .. } => request_id,
        other => panic!("expected a call, got {other:?}"),
    }
}

fn lookup(connection: &Connection, name: &str) -> sturdy_tub::PendingResult {
    connection
        .bootstrap()
        .call_remote(GET_REFERENCE_BY_NAME, vec![Value::from(name)])
        .unwrap()
}

#[test]
fn test_duplicate_result_is_fatal() {
    let (alice, alice_events) = listening_tub("alice");
    let descriptor = publish(&alice, echo(), "echo");
    let (mut stream, connection) = raw_peer(&alice, &descriptor);

    let first = lookup(&connection, "one");
    let second = lookup(&connection, "two");
    let answered = expect_call(&mut stream);
    expect_call(&mut stream);

    let reply = WireMessage::Result {
        request_id: answered,
        value:      WireValue::Text("ok".into()),
    };
    stream.send_message(&reply, 1 << 20).unwrap();
    stream.send_message(&reply, 1 << 20).unwrap();

    assert_eq!(first.wait().unwrap(), Value::from("ok"));
    match second.wait() {
        Err(RpcError::ConnectionLost(reason)) => {
            assert!(reason.contains("protocol error"), "{reason}");
            assert!(reason.contains("duplicate result"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!connection.is_connected());
    assert_eq!(connection.pending_calls(), 0);
    assert_eq!(connection.capability_counts(), (0, 0));
    assert_eq!(
        alice_events.count(|e| matches!(e, RpcEvent::ConnectionClosed { abandoned: 1, .. })),
        1
    );
}

#[test]
fn test_result_for_unknown_request_is_fatal() {
    let (alice, _) = listening_tub("alice");
    let descriptor = publish(&alice, echo(), "echo");
    let (mut stream, connection) = raw_peer(&alice, &descriptor);

    let pending = lookup(&connection, "one");
    let issued = expect_call(&mut stream);
    stream
        .send_message(
            &WireMessage::Result {
                request_id: issued + 41,
                value:      WireValue::None,
            },
            1 << 20,
        )
        .unwrap();

    match pending.wait() {
        Err(RpcError::ConnectionLost(reason)) => {
            assert!(reason.contains("unknown request"), "{reason}")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(connection
        .disconnect_reason()
        .is_some_and(|reason| reason.starts_with("protocol error")));
}

#[test]
fn test_hello_after_negotiation_is_fatal() {
    let (alice, _) = listening_tub("alice");
    let descriptor = publish(&alice, echo(), "echo");
    let (mut stream, connection) = raw_peer(&alice, &descriptor);

    stream
        .send_message(&WireMessage::Hello { version: 1 }, 1 << 20)
        .unwrap();
    assert!(wait_until(|| !connection.is_connected()));
    assert!(connection
        .disconnect_reason()
        .is_some_and(|reason| reason.contains("unexpected hello")));
}
