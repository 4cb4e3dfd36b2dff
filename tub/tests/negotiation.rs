mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use common::*;
use sturdy_common::{Descriptor, Direction, RpcError, RpcEvent};
use sturdy_tub::{FnTarget, Referenceable, Value};

#[test]
fn test_connect_and_call() {
    let (alice, _) = listening_tub("alice");
    let (bob, bob_events) = quiet_tub("bob");
    let descriptor = publish(&alice, adder(), "adder");

    let adder = bob.get_reference(&descriptor).unwrap();
    assert_eq!(adder.interface_name(), "RIAdder");
    assert_eq!(adder.remote_fingerprint(), alice.fingerprint());
    assert_eq!(adder.descriptor(), Some(&descriptor));
    assert!(adder.is_connected());

    let sum = adder
        .call_remote_and_wait("add", vec![Value::from(2), Value::from(3)])
        .unwrap();
    assert_eq!(sum, Value::Int(5));

    assert_eq!(
        bob_events.count(|e| matches!(e, RpcEvent::ConnectionOpened { direction: Direction::Outbound, .. })),
        1
    );
    assert!(wait_until(|| alice.connection_count() == 1));
}

#[test]
fn test_descriptor_with_wrong_fingerprint_is_refused() {
    let (alice, alice_events) = listening_tub("alice");
    let (bob, _) = quiet_tub("bob");
    let carol = identity("carol");

    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = invoked.clone();
    let target: Arc<dyn Referenceable> = Arc::new(FnTarget::new(move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::None)
    }));
    let genuine = publish(&alice, target, "target");

    // alice's location, carol's fingerprint
    let forged = Descriptor::new(
        genuine.host(),
        genuine.port(),
        carol.fingerprint(Default::default()),
        ["target"],
    )
    .unwrap();

    match bob.get_reference(&forged) {
        Err(RpcError::IdentityMismatch(_)) => {}
        other => panic!("expected identity mismatch, got {other:?}"),
    }
    assert_eq!(bob.connection_count(), 0);

    assert!(wait_until(|| alice_events
        .count(|e| matches!(e, RpcEvent::NegotiationFailed { .. }))
        == 1));
    assert_eq!(alice.connection_count(), 0);
    assert_eq!(
        alice_events.count(|e| matches!(e, RpcEvent::ConnectionOpened { .. })),
        0
    );
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[test]
fn test_servers_with_bad_subjects_are_refused() {
    let (bob, _) = quiet_tub("bob");
    for name in ["wildcard", "twocn"] {
        let (server, _) = listening_tub(name);
        let descriptor = publish(&server, echo(), "echo");
        match bob.get_reference(&descriptor) {
            Err(RpcError::IdentityMismatch(_)) => {}
            other => panic!("{name}: expected identity mismatch, got {other:?}"),
        }
    }
    assert_eq!(bob.connection_count(), 0);
}

#[test]
fn test_clients_with_bad_subjects_are_refused() {
    let (alice, alice_events) = listening_tub("alice");
    let descriptor = publish(&alice, echo(), "echo");

    for name in ["wildcard", "twocn"] {
        let (client, _) = quiet_tub(name);
        assert!(client.get_reference(&descriptor).is_err(), "{name} got through");
    }

    assert!(wait_until(|| alice_events
        .count(|e| matches!(e, RpcEvent::NegotiationFailed { direction: Direction::Inbound, .. }))
        == 2));
    assert_eq!(alice.connection_count(), 0);
}

#[test]
fn test_connect_is_idempotent() {
    let (alice, _) = listening_tub("alice");
    let (bob, bob_events) = quiet_tub("bob");
    let adder_desc = publish(&alice, adder(), "adder");
    let echo_desc = publish(&alice, echo(), "echo");

    let first = bob.connect(&adder_desc).unwrap();
    let second = bob.connect(&echo_desc).unwrap();
    assert_eq!(first, second);

    let a = bob.get_reference(&adder_desc).unwrap();
    let e = bob.get_reference(&echo_desc).unwrap();
    assert_eq!(a.connection(), Some(first.clone()));
    assert_eq!(e.connection(), Some(first));
    assert_eq!(bob.connection_count(), 1);
    assert_eq!(
        bob_events.count(|e| matches!(e, RpcEvent::ConnectionOpened { .. })),
        1
    );
}

#[test]
fn test_inbound_connection_is_reused_for_outbound_connect() {
    let (alice, _) = listening_tub("alice");
    let (bob, _) = listening_tub("bob");
    let bob_echo = publish(&bob, echo(), "echo");
    let alice_echo = publish(&alice, echo(), "echo");

    alice.connect(&bob_echo).unwrap();
    assert!(wait_until(|| bob.connection_count() == 1));

    let reused = bob.connect(&alice_echo).unwrap();
    assert_eq!(reused.direction(), Direction::Inbound);
    assert_eq!(bob.connection_count(), 1);
    assert_eq!(alice.connection_count(), 1);
}

#[test]
fn test_connecting_to_self_is_rejected() {
    let (alice, _) = listening_tub("alice");
    let descriptor = publish(&alice, echo(), "echo");

    assert!(matches!(alice.connect(&descriptor), Err(RpcError::Config(_))));
    assert!(alice.lookup_local(&descriptor).is_ok());
}
