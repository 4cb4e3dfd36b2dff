#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use sturdy_common::{
    Constraint, Descriptor, MemorySink, MethodSchema, RemoteFailure, RemoteInterface, TubCertPath,
    TubOptions,
};
use sturdy_tub::{FingerprintCache, FnTarget, Referenceable, Tub, TubIdentity, Value};

pub fn identity(name: &str) -> TubIdentity {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    TubIdentity::load(&TubCertPath::in_dir(dir)).unwrap()
}

pub fn options() -> TubOptions {
    TubOptions::new().with_handshake_timeout(Duration::from_secs(5))
}

/// A tub with its own cache and event log. Not listening.
pub fn quiet_tub(name: &str) -> (Tub, MemorySink) {
    let sink = MemorySink::new();
    let tub = Tub::builder(identity(name))
        .with_options(options())
        .with_event_sink(Arc::new(sink.clone()))
        .with_fingerprint_cache(Arc::new(FingerprintCache::new()))
        .build()
        .unwrap();
    (tub, sink)
}

/// A tub listening on a loopback port, with its location set.
pub fn listening_tub(name: &str) -> (Tub, MemorySink) {
    let (tub, sink) = quiet_tub(name);
    let listener = tub.listen("tcp:0:interface=127.0.0.1").unwrap();
    tub.set_location("127.0.0.1", listener.local_addr().port());
    (tub, sink)
}

pub fn adder_interface() -> RemoteInterface {
    RemoteInterface::new("RIAdder").method(
        "add",
        MethodSchema::new()
            .arg("a", Constraint::int32())
            .arg("b", Constraint::int32())
            .returns(Constraint::int32()),
    )
}

pub fn adder() -> Arc<dyn Referenceable> {
    Arc::new(FnTarget::with_interface(adder_interface(), |_, args, _| {
        match (args.first().and_then(Value::as_int), args.get(1).and_then(Value::as_int)) {
            (Some(a), Some(b)) => Ok(Value::Int(a + b)),
            _ => Err(RemoteFailure::application("add takes two integers")),
        }
    }))
}

/// Returns its first argument.
pub fn echo() -> Arc<dyn Referenceable> {
    Arc::new(FnTarget::new(|_, args, _| {
        Ok(args.into_iter().next().unwrap_or(Value::None))
    }))
}

pub fn publish(tub: &Tub, object: Arc<dyn Referenceable>, name: &str) -> Descriptor {
    tub.register(object, Some(name)).unwrap()
}

/// Polls `cond` until it holds or five seconds pass.
pub fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
