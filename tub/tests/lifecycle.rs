mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::*;
use crossbeam_channel::unbounded;
use sturdy_common::{Descriptor, FailureKind, MemorySink, RemoteFailure, RpcError, RpcEvent};
use sturdy_tub::{FingerprintCache, FnTarget, Referenceable, Tub, Value};

#[test]
fn test_teardown_abandons_every_pending_call() {
    let (alice, _) = listening_tub("alice");
    let (bob, bob_events) = quiet_tub("bob");

    let (release, gate) = unbounded::<()>();
    let blocker: Arc<dyn Referenceable> = Arc::new(FnTarget::new(move |_, _, _| {
        let _ = gate.recv();
        Ok(Value::None)
    }));
    let descriptor = publish(&alice, blocker, "blocker");
    let blocker = bob.get_reference(&descriptor).unwrap();
    let connection = bob.connect(&descriptor).unwrap();

    let pending: Vec<_> = (0..5)
        .map(|_| blocker.call_remote("block", vec![]).unwrap())
        .collect();
    assert_eq!(connection.pending_calls(), 5);

    bob.shutdown(&connection);
    for call in pending {
        assert!(matches!(call.wait(), Err(RpcError::ConnectionLost(_))));
    }
    assert_eq!(
        bob_events.count(|e| matches!(e, RpcEvent::ConnectionClosed { abandoned: 5, .. })),
        1
    );
    assert_eq!(connection.pending_calls(), 0);
    assert_eq!(connection.capability_counts(), (0, 0));
    assert_eq!(bob.connection_count(), 0);

    assert!(!blocker.is_connected());
    assert!(matches!(
        blocker.call_remote("block", vec![]),
        Err(RpcError::ConnectionLost(_))
    ));

    drop(release);
    assert!(wait_until(|| alice.connection_count() == 0));
}

#[test]
fn test_disconnect_callbacks_run_once_in_order() {
    let (alice, _) = listening_tub("alice");
    let (bob, _) = quiet_tub("bob");
    let connection = bob.connect(&publish(&alice, echo(), "echo")).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let ids: Vec<_> = (1..=3)
        .map(|i| {
            let order = order.clone();
            connection.notify_on_disconnect(move |_| order.lock().unwrap().push(i))
        })
        .collect();
    assert!(connection.dont_notify(ids[1]));
    assert!(!connection.dont_notify(ids[1]));

    connection.close();
    connection.close();
    assert_eq!(*order.lock().unwrap(), vec![1, 3]);
    assert_eq!(
        connection.disconnect_reason().as_deref(),
        Some("connection closed locally")
    );

    // registering after the fact runs immediately
    let (tx, rx) = unbounded();
    connection.notify_on_disconnect(move |reason| {
        let _ = tx.send(reason.to_string());
    });
    assert_eq!(rx.try_recv().unwrap(), "connection closed locally");
}

#[test]
fn test_peer_shutdown_is_observed() {
    let (alice, _) = listening_tub("alice");
    let (bob, bob_events) = quiet_tub("bob");
    let echo = bob.get_reference(&publish(&alice, echo(), "echo")).unwrap();

    let (tx, rx) = unbounded();
    assert!(echo
        .notify_on_disconnect(move |reason| {
            let _ = tx.send(reason.to_string());
        })
        .is_some());

    alice.shutdown_all();
    let reason = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!reason.is_empty());
    assert!(!echo.is_connected());
    assert_eq!(bob.connection_count(), 0);
    assert_eq!(
        bob_events.count(|e| matches!(e, RpcEvent::ConnectionClosed { abandoned: 0, .. })),
        1
    );
}

#[test]
fn test_register_and_unregister() {
    let (alice, _) = listening_tub("alice");
    let (bob, _) = quiet_tub("bob");

    let object = echo();
    let named = alice.register(object.clone(), Some("svc/echo")).unwrap();
    assert_eq!(named.name(), "svc/echo");
    assert_eq!(named.fingerprint(), alice.fingerprint());
    assert_eq!(Descriptor::parse(&named.to_string()).unwrap(), named);
    // the same object keeps its descriptor
    assert_eq!(alice.register(object.clone(), None).unwrap(), named);

    let anonymous = echo();
    let unnamed = alice.register(anonymous.clone(), None).unwrap();
    assert_eq!(unnamed.name().len(), 32);
    assert_ne!(unnamed, named);

    let local = alice.lookup_local(&named).unwrap();
    assert_eq!(Value::Local(local), Value::Local(object));

    let held = bob.get_reference(&named).unwrap();
    assert!(alice.unregister_descriptor(&named));
    assert!(!alice.unregister_descriptor(&named));
    assert!(matches!(
        alice.lookup_local(&named),
        Err(RpcError::UnknownCapability(_))
    ));
    match bob.get_reference(&named) {
        Err(RpcError::Remote(failure)) => assert_eq!(failure.kind, FailureKind::UnknownCapability),
        other => panic!("unexpected {other:?}"),
    }
    // an existing reference outlives the name
    assert_eq!(
        held.call_remote_and_wait("echo", vec![Value::from("still here")]).unwrap(),
        Value::from("still here")
    );

    assert!(alice.unregister_object(&anonymous));
    assert!(alice.lookup_local(&unnamed).is_err());
}

#[test]
fn test_register_requires_location() {
    let (tub, _) = quiet_tub("carol");
    assert!(matches!(tub.register(echo(), None), Err(RpcError::Config(_))));
}

#[test]
fn test_failure_logging_options() {
    let alice_events = MemorySink::new();
    let alice = Tub::builder(identity("alice"))
        .with_options(options().with_log_local_failures(true))
        .with_event_sink(Arc::new(alice_events.clone()))
        .with_fingerprint_cache(Arc::new(FingerprintCache::new()))
        .build()
        .unwrap();
    let listener = alice.listen("127.0.0.1:0").unwrap();
    alice.set_location("127.0.0.1", listener.local_addr().port());

    let bob_events = MemorySink::new();
    let bob = Tub::builder(identity("bob"))
        .with_options(options().with_log_remote_failures(true))
        .with_event_sink(Arc::new(bob_events.clone()))
        .build()
        .unwrap();

    let failing: Arc<dyn Referenceable> =
        Arc::new(FnTarget::new(|_, _, _| Err(RemoteFailure::application("nope"))));
    let failing = bob.get_reference(&publish(&alice, failing, "failing")).unwrap();
    assert!(failing.call_remote_and_wait("explode", vec![]).is_err());

    let local = alice_events.count(|e| {
        matches!(e, RpcEvent::LocalFailure { method, failure, .. } if method == "explode" && failure.contains("nope"))
    });
    assert_eq!(local, 1);
    let remote = bob_events.count(|e| matches!(e, RpcEvent::RemoteFailure { method, .. } if method == "explode"));
    assert_eq!(remote, 1);

    listener.stop();
    assert!(!listener.is_running());
}

#[test]
fn test_fingerprint_cache_is_shared_only_on_request() {
    let alice = Tub::builder(identity("alice")).with_options(options()).build().unwrap();
    let bob = Tub::new(identity("bob"), options()).unwrap();
    assert!(!Arc::ptr_eq(&alice.fingerprint_cache(), &bob.fingerprint_cache()));

    let carol = Tub::builder(identity("carol"))
        .with_options(options())
        .with_fingerprint_cache(alice.fingerprint_cache())
        .build()
        .unwrap();
    assert!(Arc::ptr_eq(&alice.fingerprint_cache(), &carol.fingerprint_cache()));

    // verdicts land in the cache of the tub that verified the peer
    let listener = alice.listen("tcp:0:interface=127.0.0.1").unwrap();
    alice.set_location("127.0.0.1", listener.local_addr().port());
    let echo = bob.get_reference(&publish(&alice, echo(), "echo")).unwrap();
    assert_eq!(echo.call_remote_and_wait("echo", vec![Value::from(3)]).unwrap(), Value::Int(3));
    assert!(!bob.fingerprint_cache().is_empty());
    assert!(!carol.fingerprint_cache().is_empty());
}
