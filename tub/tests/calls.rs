mod common;

use std::sync::{Arc, Mutex};

use common::*;
use sturdy_common::{CallResolution, FailureKind, RpcError, RpcEvent};
use sturdy_tub::{FnTarget, Referenceable, Value};

#[test]
fn test_inbound_calls_run_in_arrival_order() {
    let (alice, _) = listening_tub("alice");
    let (bob, _) = quiet_tub("bob");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let recorder: Arc<dyn Referenceable> = Arc::new(FnTarget::new(move |_, args, _| {
        let n = args.first().and_then(Value::as_int).unwrap_or(-1);
        log.lock().unwrap().push(n);
        Ok(Value::Int(n))
    }));
    let recorder = bob
        .get_reference(&publish(&alice, recorder, "recorder"))
        .unwrap();

    let pending: Vec<_> = (0..50)
        .map(|n| recorder.call_remote("record", vec![Value::from(n)]).unwrap())
        .collect();
    for (n, call) in pending.into_iter().enumerate() {
        assert_eq!(call.wait().unwrap(), Value::Int(n as i64));
    }
    assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<i64>>());
}

#[test]
fn test_interface_violations() {
    let (alice, _) = listening_tub("alice");
    let (bob, bob_events) = quiet_tub("bob");
    let adder = bob.get_reference(&publish(&alice, adder(), "adder")).unwrap();

    // refused locally from the granted metadata, nothing is sent
    match adder.call_remote("subtract", vec![Value::from(1), Value::from(2)]) {
        Err(RpcError::Violation(msg)) => assert!(msg.contains("does not offer subtract"), "{msg}"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(bob_events.count(|e| matches!(e, RpcEvent::CallIssued { .. })), 1);

    // argument constraints are enforced by the target's tub
    match adder.call_remote_and_wait("add", vec![Value::from("two"), Value::from(2)]) {
        Err(RpcError::Remote(failure)) => {
            assert_eq!(failure.kind, FailureKind::Violation);
            assert!(failure.message.contains("argument 'a'"), "{}", failure.message);
        }
        other => panic!("unexpected {other:?}"),
    }

    // the connection survives ordinary call failures
    assert_eq!(
        adder.call_remote_and_wait("add", vec![Value::from(20), Value::from(22)]).unwrap(),
        Value::Int(42)
    );
}

#[test]
fn test_application_failures_are_rejections() {
    let (alice, _) = listening_tub("alice");
    let (bob, bob_events) = quiet_tub("bob");
    let failing: Arc<dyn Referenceable> = Arc::new(FnTarget::new(|method, _, _| {
        Err(sturdy_common::RemoteFailure::application(format!("{method} exploded")))
    }));
    let failing = bob.get_reference(&publish(&alice, failing, "failing")).unwrap();

    match failing.call_remote_and_wait("anything", vec![]) {
        Err(RpcError::Remote(failure)) => {
            assert_eq!(failure.kind, FailureKind::Application);
            assert_eq!(failure.message, "anything exploded");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        bob_events.count(|e| matches!(
            e,
            RpcEvent::CallResolved {
                resolution: CallResolution::Rejected,
                ..
            }
        )),
        1
    );
}

#[test]
fn test_unknown_name_reveals_only_a_hint() {
    let (alice, _) = listening_tub("alice");
    let (bob, _) = quiet_tub("bob");
    let descriptor = publish(&alice, echo(), "echo");

    let missing = descriptor.with_path(["secretname"]).unwrap();
    match bob.get_reference(&missing) {
        Err(RpcError::Remote(failure)) => {
            assert_eq!(failure.kind, FailureKind::UnknownCapability);
            assert!(failure.message.contains("'se'"), "{}", failure.message);
            assert!(!failure.message.contains("secretname"));
        }
        other => panic!("unexpected {other:?}"),
    }

    // the bootstrap object offers nothing else
    let connection = bob.connect(&descriptor).unwrap();
    assert!(matches!(
        connection.bootstrap().call_remote("shutdown", vec![]),
        Err(RpcError::Violation(_))
    ));
}

#[test]
fn test_local_object_round_trips_as_itself() {
    let (alice, _) = listening_tub("alice");
    let (bob, _) = quiet_tub("bob");
    let echo = bob.get_reference(&publish(&alice, echo(), "echo")).unwrap();

    let mine: Arc<dyn Referenceable> = Arc::new(FnTarget::new(|_, _, _| Ok(Value::from("pong"))));
    let returned = echo
        .call_remote_and_wait("echo", vec![Value::Local(mine.clone())])
        .unwrap();
    assert_eq!(returned, Value::Local(mine));
}

#[test]
fn test_peer_can_call_back_into_granted_object() {
    let (alice, _) = listening_tub("alice");
    let (bob, _) = quiet_tub("bob");

    let caller: Arc<dyn Referenceable> = Arc::new(FnTarget::new(|_, args, _| {
        let callback = args
            .into_iter()
            .next()
            .and_then(Value::into_remote)
            .ok_or_else(|| sturdy_common::RemoteFailure::application("expected a reference"))?;
        callback
            .call_remote_and_wait("ping", vec![])
            .map_err(|e| e.to_failure())
    }));
    let caller = bob.get_reference(&publish(&alice, caller, "caller")).unwrap();

    let pong: Arc<dyn Referenceable> = Arc::new(FnTarget::new(|_, _, _| Ok(Value::from("pong"))));
    let result = caller
        .call_remote_and_wait("call", vec![Value::Local(pong)])
        .unwrap();
    assert_eq!(result, Value::from("pong"));
}

#[test]
fn test_dropping_last_reference_releases_export() {
    let (alice, _) = listening_tub("alice");
    let (bob, _) = quiet_tub("bob");
    let descriptor = publish(&alice, echo(), "echo");

    let first = bob.get_reference(&descriptor).unwrap();
    let second = bob.get_reference(&descriptor).unwrap();
    // a repeated grant reuses the live handle
    assert_eq!(first, second);

    assert!(wait_until(|| alice.connection_count() == 1));
    let served = alice.connections().pop().unwrap();
    assert_eq!(served.capability_counts(), (1, 0));
    let client = bob.connect(&descriptor).unwrap();
    assert_eq!(client.capability_counts(), (0, 1));

    drop(first);
    drop(second);
    assert!(wait_until(|| served.capability_counts() == (0, 0)));
    assert_eq!(client.capability_counts(), (0, 0));
    assert!(client.is_connected());

    // the name still resolves, under a fresh id
    let again = bob.get_reference(&descriptor).unwrap();
    assert!(again.id() > 1);
}

#[test]
fn test_references_cannot_cross_connections() {
    let (alice, _) = listening_tub("alice");
    let (carol, _) = listening_tub("carol");
    let (bob, _) = quiet_tub("bob");

    let alices = bob.get_reference(&publish(&alice, adder(), "adder")).unwrap();
    let carols = bob.get_reference(&publish(&carol, echo(), "echo")).unwrap();

    let nested = Value::List(vec![Value::from(1), Value::Remote(alices.clone())]);
    match carols.call_remote("echo", vec![nested]) {
        Err(RpcError::Violation(msg)) => assert!(msg.contains("another connection"), "{msg}"),
        other => panic!("unexpected {other:?}"),
    }

    // handing a reference back to its own tub is fine
    let echo_on_alice = bob.get_reference(&publish(&alice, echo(), "echo")).unwrap();
    let back = echo_on_alice
        .call_remote_and_wait("echo", vec![Value::Remote(alices.clone())])
        .unwrap();
    assert_eq!(back, Value::Remote(alices));
}

#[test]
fn test_large_payloads_up_to_the_frame_limit() {
    let (alice, _) = listening_tub("alice");
    let (bob, _) = quiet_tub("bob");
    let echo = bob.get_reference(&publish(&alice, echo(), "echo")).unwrap();

    // spans many TLS records in both directions
    let payload = Value::Bytes(vec![7; 600_000]);
    assert_eq!(echo.call_remote_and_wait("echo", vec![payload.clone()]).unwrap(), payload);

    // over the limit: refused before sending, the connection stays up
    match echo.call_remote("echo", vec![Value::Bytes(vec![0; 1_100_000])]) {
        Err(RpcError::Protocol(msg)) => assert!(msg.contains("too large"), "{msg}"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(echo.is_connected());
    assert_eq!(echo.call_remote_and_wait("echo", vec![Value::from(1)]).unwrap(), Value::Int(1));
}

#[test]
fn test_callback_runs_while_its_caller_waits() {
    let (alice, _) = listening_tub("alice");
    let (bob, _) = quiet_tub("bob");

    let ping: Arc<dyn Referenceable> = Arc::new(FnTarget::new(|_, _, _| Ok(Value::from("pong"))));
    let ping = bob.get_reference(&publish(&alice, ping, "ping")).unwrap();

    // alice -> bob: the relay waits on bob while bob calls back into alice
    let relay: Arc<dyn Referenceable> = Arc::new(FnTarget::new(|_, args, _| {
        let bounce = args
            .into_iter()
            .next()
            .and_then(Value::into_remote)
            .ok_or_else(|| sturdy_common::RemoteFailure::application("expected a reference"))?;
        bounce
            .call_remote_and_wait("bounce", vec![])
            .map_err(|e| e.to_failure())
    }));
    let relay = bob.get_reference(&publish(&alice, relay, "relay")).unwrap();

    let bounce: Arc<dyn Referenceable> = Arc::new(FnTarget::new(move |_, _, _| {
        ping.call_remote_and_wait("ping", vec![])
            .map_err(|e| e.to_failure())
    }));
    let pending = relay.call_remote("relay", vec![Value::Local(bounce)]).unwrap();
    assert_eq!(
        pending.wait_timeout(std::time::Duration::from_secs(5)).unwrap(),
        Value::from("pong")
    );
}
