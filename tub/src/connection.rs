//! A negotiated connection and the references that travel over it.
//!
//! Each connection runs two threads. The reader pulls ciphertext off the
//! socket, decodes frames in arrival order and routes them; it never blocks on
//! the session lock, so a peer that stops reading cannot wedge it. The
//! delivery worker starts inbound calls in arrival order and performs every
//! write that originates on the reader side. A handler that waits on an
//! outbound result keeps the worker draining its queue, so a callback from the
//! peer runs nested inside the waiting handler instead of queueing behind it.
//!
//! Lock discipline: the state lock (capability table, pending calls) and the
//! session lock are never held together, and no value that might own the last
//! handle to a capability is dropped while the state lock is held.

use std::{
    collections::BTreeMap,
    fmt,
    rc::Rc,
    io::{self, Read},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, TryLockError, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, Select, Sender, TryRecvError};
use sturdy_common::{
    config::TubOptions,
    descriptor::Descriptor,
    error::{FailureKind, RemoteFailure, RpcError},
    events::{CallResolution, ConnectionId, Direction, EventSink, RpcEvent},
    fingerprint::Fingerprint,
    schema::MethodSchema,
    tls_stream::{Absorbed, TlsSession},
    wire::{encode_frame, CapRef, CapabilityMetadata, FrameDecoder, WireMessage, WireValue},
};

use crate::{
    dispatcher::{install_pump, CallOutcome, PendingCalls, PendingResult, Pump},
    negotiator::Negotiated,
    referenceable::{CallContext, Referenceable},
    registry::Registry,
    table::{CapabilityTable, BOOTSTRAP_ID},
    value::Value,
};

/// The only method offered by the bootstrap object.
pub const GET_REFERENCE_BY_NAME: &str = "get_reference_by_name";

const BOOTSTRAP_INTERFACE: &str = "Bootstrap";
const NAME_HINT_LEN: usize = 2;
const READ_POLL: Duration = Duration::from_millis(20);
const READ_CHUNK: usize = 16 * 1024;

/// Handle returned by `notify_on_disconnect`, used to cancel the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierId(u64);

type DisconnectCallback = Box<dyn FnOnce(&str) + Send>;

struct ConnState {
    table:        CapabilityTable<RemoteRefInner>,
    pending:      PendingCalls,
    closed:       Option<String>,
    watchers:     Vec<(NotifierId, DisconnectCallback)>,
    next_watcher: u64,
}

enum Target {
    Bootstrap,
    Object(Arc<dyn Referenceable>),
}

enum Job {
    Call {
        request_id: u64,
        target:     Target,
        method:     String,
        args:       Vec<Value>,
    },
    /// A frame encoded elsewhere that must be written by the worker.
    Send(Vec<u8>),
}

pub(crate) struct ConnectionShared {
    id:               ConnectionId,
    peer:             Fingerprint,
    peer_certificate: Vec<u8>,
    remote:           Option<SocketAddr>,
    direction:        Direction,
    options:          TubOptions,
    events:           Arc<dyn EventSink>,
    registry:         Arc<Registry>,
    session:          Mutex<TlsSession>,
    /// Socket handle used to force a shutdown while a writer holds the
    /// session.
    control:          TcpStream,
    state:            Mutex<ConnState>,
    jobs:             Mutex<Option<Sender<Job>>>,
    closed:           AtomicBool,
}

/// One live, authenticated connection to a peer tub.
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Starts the reader and delivery threads for a negotiated transport.
    pub(crate) fn establish(
        negotiated: Negotiated,
        options: TubOptions,
        events: Arc<dyn EventSink>,
        registry: Arc<Registry>,
    ) -> Result<Self, RpcError> {
        let Negotiated {
            stream,
            peer,
            peer_certificate,
            remote,
            direction,
        } = negotiated;
        let (session, reader) = stream.into_session()?;
        let control = reader.try_clone()?;
        let (jobs_tx, jobs_rx) = unbounded();

        let shared = Arc::new(ConnectionShared {
            id: ConnectionId::new(),
            peer,
            peer_certificate,
            remote,
            direction,
            options,
            events,
            registry,
            session: Mutex::new(session),
            control,
            state: Mutex::new(ConnState {
                table:        CapabilityTable::new(),
                pending:      PendingCalls::new(),
                closed:       None,
                watchers:     Vec::new(),
                next_watcher: 1,
            }),
            jobs: Mutex::new(Some(jobs_tx)),
            closed: AtomicBool::new(false),
        });

        shared.emit(RpcEvent::ConnectionOpened {
            connection: shared.id,
            peer:       shared.peer.clone(),
            remote:     shared.remote,
            direction:  shared.direction,
        });

        let worker = shared.clone();
        if let Err(e) = thread::Builder::new()
            .name(format!("sturdy-worker-{}", shared.id))
            .spawn(move || worker.run_worker(jobs_rx))
        {
            shared.teardown(format!("failed to start delivery worker: {e}"));
            return Err(e.into());
        }

        let reader_shared = shared.clone();
        if let Err(e) = thread::Builder::new()
            .name(format!("sturdy-reader-{}", shared.id))
            .spawn(move || reader_shared.run_reader(reader))
        {
            shared.teardown(format!("failed to start reader: {e}"));
            return Err(e.into());
        }

        Ok(Self { shared })
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Fingerprint the peer was authenticated under.
    pub fn peer_fingerprint(&self) -> &Fingerprint {
        &self.shared.peer
    }

    /// Whether the peer's certificate hashes to `fingerprint`, whatever
    /// algorithm it uses.
    pub fn matches_fingerprint(&self, fingerprint: &Fingerprint) -> bool {
        Fingerprint::of_certificate(fingerprint.algorithm(), &self.shared.peer_certificate)
            == *fingerprint
    }

    pub(crate) fn peer_certificate(&self) -> &[u8] {
        &self.shared.peer_certificate
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.is_closed()
    }

    /// Why the connection closed, once it has.
    pub fn disconnect_reason(&self) -> Option<String> {
        self.shared.state().closed.clone()
    }

    /// Reference to the peer's bootstrap object (id 0).
    pub fn bootstrap(&self) -> RemoteReference {
        let metadata = CapabilityMetadata {
            interface: BOOTSTRAP_INTERFACE.to_string(),
            methods:   vec![GET_REFERENCE_BY_NAME.to_string()],
        };
        RemoteReference {
            inner:      Arc::new(RemoteRefInner::new(BOOTSTRAP_ID, metadata, &self.shared)),
            descriptor: None,
        }
    }

    /// Asks the peer's bootstrap object for the object registered as `name`.
    pub fn get_reference_by_name(&self, name: &str) -> Result<RemoteReference, RpcError> {
        let value = self
            .bootstrap()
            .call_remote_and_wait(GET_REFERENCE_BY_NAME, vec![Value::from(name)])?;
        value.into_remote().ok_or_else(|| {
            RpcError::Protocol(format!("{GET_REFERENCE_BY_NAME} did not return a reference"))
        })
    }

    /// Closes the transport. Pending calls are abandoned and every capability
    /// exchanged over this connection becomes unusable.
    pub fn close(&self) {
        self.shared.teardown("connection closed locally".to_string());
    }

    /// Runs `callback` once when the connection closes, in registration order
    /// with other callbacks. Runs it immediately if already closed.
    pub fn notify_on_disconnect<F>(&self, callback: F) -> NotifierId
    where
        F: FnOnce(&str) + Send + 'static,
    {
        self.shared.notify_on_disconnect(Box::new(callback))
    }

    /// Cancels a callback. Returns whether it was still registered.
    pub fn dont_notify(&self, id: NotifierId) -> bool {
        let mut state = self.shared.state();
        let before = state.watchers.len();
        state.watchers.retain(|(watcher, _)| *watcher != id);
        state.watchers.len() != before
    }

    /// Live `(exports, imports)` in this connection's capability table.
    pub fn capability_counts(&self) -> (usize, usize) {
        let state = self.shared.state();
        (state.table.export_count(), state.table.import_count())
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.state().pending.len()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id.to_string())
            .field("peer", &self.shared.peer)
            .field("direction", &self.shared.direction)
            .field("connected", &self.is_connected())
            .finish()
    }
}

pub(crate) struct RemoteRefInner {
    id:            u64,
    metadata:      CapabilityMetadata,
    connection:    Weak<ConnectionShared>,
    connection_id: ConnectionId,
    peer:          Fingerprint,
    remote:        Option<SocketAddr>,
}

impl RemoteRefInner {
    fn new(id: u64, metadata: CapabilityMetadata, shared: &Arc<ConnectionShared>) -> Self {
        Self {
            id,
            metadata,
            connection: Arc::downgrade(shared),
            connection_id: shared.id,
            peer: shared.peer.clone(),
            remote: shared.remote,
        }
    }
}

impl Drop for RemoteRefInner {
    fn drop(&mut self) {
        if self.id == BOOTSTRAP_ID {
            return;
        }
        if let Some(shared) = self.connection.upgrade() {
            shared.release_import(self.id, self as *const RemoteRefInner);
        }
    }
}

/// A capability held on a peer.
///
/// Holds only a weak link to its connection: once the connection closes,
/// every call fails with [`RpcError::ConnectionLost`]. Dropping the last
/// handle for a capability tells the peer it may release the object.
#[derive(Clone)]
pub struct RemoteReference {
    inner:      Arc<RemoteRefInner>,
    descriptor: Option<Arc<Descriptor>>,
}

impl RemoteReference {
    pub(crate) fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptor = Some(Arc::new(descriptor));
        self
    }

    /// Id of the capability in the peer's export table.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn metadata(&self) -> &CapabilityMetadata {
        &self.inner.metadata
    }

    pub fn interface_name(&self) -> &str {
        &self.inner.metadata.interface
    }

    /// The descriptor this reference was obtained through, if any.
    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_deref()
    }

    pub fn remote_fingerprint(&self) -> &Fingerprint {
        &self.inner.peer
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.remote
    }

    pub fn connection(&self) -> Option<Connection> {
        self.inner
            .connection
            .upgrade()
            .map(|shared| Connection { shared })
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .upgrade()
            .is_some_and(|shared| !shared.is_closed())
    }

    /// Sends a call and returns immediately.
    pub fn call_remote(&self, method: &str, args: Vec<Value>) -> Result<PendingResult, RpcError> {
        if !self.inner.metadata.offers(method) {
            return Err(RpcError::Violation(format!(
                "{}({}) does not offer {}",
                self.inner.metadata.interface,
                self.inner.metadata.methods.join(","),
                method
            )));
        }
        let shared = self
            .inner
            .connection
            .upgrade()
            .ok_or_else(|| RpcError::ConnectionLost("connection is gone".into()))?;
        shared.issue_call(self.inner.id, method, &args)
    }

    /// Sends a call and blocks until it resolves.
    pub fn call_remote_and_wait(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call_remote(method, args)?.wait()
    }

    /// Like [`Connection::notify_on_disconnect`]. Returns `None` if the
    /// connection is already gone, after running the callback.
    pub fn notify_on_disconnect<F>(&self, callback: F) -> Option<NotifierId>
    where
        F: FnOnce(&str) + Send + 'static,
    {
        match self.connection() {
            Some(connection) => Some(connection.notify_on_disconnect(callback)),
            None => {
                callback("connection is gone");
                None
            }
        }
    }

    pub fn dont_notify(&self, id: NotifierId) -> bool {
        self.connection()
            .is_some_and(|connection| connection.dont_notify(id))
    }
}

impl PartialEq for RemoteReference {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RemoteReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RemoteReference({}#{} on {})",
            self.inner.metadata.interface,
            self.inner.id,
            self.inner.peer.short()
        )
    }
}

/// Rejects values that must never cross this connection.
fn check_outbound(connection: ConnectionId, value: &Value) -> Result<(), RpcError> {
    match value {
        Value::Remote(reference) => {
            if reference.inner.connection_id != connection {
                return Err(RpcError::Violation(format!(
                    "{reference:?} belongs to another connection and cannot be sent here"
                )));
            }
            if reference.inner.id == BOOTSTRAP_ID {
                return Err(RpcError::Violation(
                    "the bootstrap reference cannot be passed as a value".into(),
                ));
            }
            Ok(())
        }
        Value::List(items) => items.iter().try_for_each(|v| check_outbound(connection, v)),
        Value::Map(map) => map.values().try_for_each(|v| check_outbound(connection, v)),
        _ => Ok(()),
    }
}

/// Wire form of a value with placeholder capability ids, for schema checks.
fn wire_shape(value: &Value) -> WireValue {
    match value {
        Value::None => WireValue::None,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Int(n) => WireValue::Int(*n),
        Value::Float(x) => WireValue::Float(*x),
        Value::Bytes(b) => WireValue::Bytes(b.clone()),
        Value::Text(s) => WireValue::Text(s.clone()),
        Value::List(items) => WireValue::List(items.iter().map(wire_shape).collect()),
        Value::Map(map) => WireValue::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), wire_shape(v)))
                .collect(),
        ),
        Value::Local(_) => WireValue::Capability(CapRef::Granted(0)),
        Value::Remote(reference) => WireValue::Capability(CapRef::Yours(reference.inner.id)),
    }
}

/// Converts an outbound value, exporting local objects. Each export queues
/// one grant that must be sent ahead of the value.
fn to_wire(
    table: &mut CapabilityTable<RemoteRefInner>,
    value: &Value,
    grants: &mut Vec<WireMessage>,
    exported: &mut Vec<u64>,
) -> WireValue {
    match value {
        Value::Local(object) => {
            let id = table.export(object);
            exported.push(id);
            grants.push(WireMessage::CapabilityGrant {
                id,
                metadata: object.metadata(),
            });
            WireValue::Capability(CapRef::Granted(id))
        }
        Value::Remote(reference) => WireValue::Capability(CapRef::Yours(reference.inner.id)),
        Value::List(items) => WireValue::List(
            items
                .iter()
                .map(|v| to_wire(table, v, grants, exported))
                .collect(),
        ),
        Value::Map(map) => {
            let mut out = BTreeMap::new();
            for (key, v) in map {
                out.insert(key.clone(), to_wire(table, v, grants, exported));
            }
            WireValue::Map(out)
        }
        other => wire_shape(other),
    }
}

/// Converts an inbound value. Every capability is converted even after a
/// failure so that staged grants are always claimed; the first failure is
/// recorded in `error`. Clones of every capability go to `keep` so that the
/// caller decides where the last handle is dropped.
fn from_wire(
    table: &mut CapabilityTable<RemoteRefInner>,
    wire: WireValue,
    keep: &mut Vec<Value>,
    error: &mut Option<RpcError>,
) -> Value {
    let fail = |e: RpcError, error: &mut Option<RpcError>| {
        if error.is_none() {
            *error = Some(e);
        }
        Value::None
    };
    match wire {
        WireValue::None => Value::None,
        WireValue::Bool(b) => Value::Bool(b),
        WireValue::Int(n) => Value::Int(n),
        WireValue::Float(x) => Value::Float(x),
        WireValue::Bytes(b) => Value::Bytes(b),
        WireValue::Text(s) => Value::Text(s),
        WireValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|w| from_wire(table, w, keep, error))
                .collect(),
        ),
        WireValue::Map(map) => {
            let mut out = BTreeMap::new();
            for (key, w) in map {
                out.insert(key, from_wire(table, w, keep, error));
            }
            Value::Map(out)
        }
        WireValue::Capability(CapRef::Granted(id)) => match table.take_granted(id) {
            Ok(inner) => {
                let value = Value::Remote(RemoteReference {
                    inner,
                    descriptor: None,
                });
                keep.push(value.clone());
                value
            }
            Err(e) => fail(e, error),
        },
        WireValue::Capability(CapRef::Yours(id)) => match table.resolve(id) {
            Ok(object) => {
                let value = Value::Local(object);
                keep.push(value.clone());
                value
            }
            Err(e) => fail(e, error),
        },
    }
}

impl ConnectionShared {
    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: RpcEvent) {
        self.events.emit(&event);
    }

    fn enqueue(&self, job: Job) {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = jobs.as_ref() {
            // the worker only goes away on teardown
            let _ = sender.send(job);
        }
    }

    /// Writes encoded frames; a failed write closes the connection.
    fn write(&self, bytes: &[u8]) -> Result<(), RpcError> {
        let result = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send_frame(bytes);
        if let Err(e) = &result {
            self.teardown(format!("write failed: {e}"));
        }
        result
    }

    fn notify_on_disconnect(&self, callback: DisconnectCallback) -> NotifierId {
        let mut state = self.state();
        let id = NotifierId(state.next_watcher);
        state.next_watcher += 1;
        match state.closed.clone() {
            Some(reason) => {
                drop(state);
                callback(&reason);
            }
            None => state.watchers.push((id, callback)),
        }
        id
    }

    /// Converts `values`, exporting local objects, and encodes the resulting
    /// grants followed by the message `build` makes of the converted values.
    fn encode_with_grants<F>(
        &self,
        table: &mut CapabilityTable<RemoteRefInner>,
        values: &[Value],
        build: F,
    ) -> Result<Vec<u8>, RpcError>
    where
        F: FnOnce(Vec<WireValue>) -> WireMessage,
    {
        let mut grants = Vec::new();
        let mut exported = Vec::new();
        let wire: Vec<WireValue> = values
            .iter()
            .map(|v| to_wire(table, v, &mut grants, &mut exported))
            .collect();
        let message = build(wire);

        let mut bytes = Vec::new();
        let encoded = grants
            .iter()
            .chain(std::iter::once(&message))
            .try_for_each(|m| {
                bytes.extend(encode_frame(m, self.options.max_frame_len)?);
                Ok::<(), RpcError>(())
            });
        if let Err(e) = encoded {
            // nothing was sent, so the grants never happened; the caller
            // still holds every exported object
            for id in exported {
                let _ = table.release(id, 1);
            }
            return Err(e);
        }
        Ok(bytes)
    }

    fn issue_call(&self, target: u64, method: &str, args: &[Value]) -> Result<PendingResult, RpcError> {
        for arg in args {
            check_outbound(self.id, arg)?;
        }

        let (request_id, pending, frames) = {
            let mut state = self.state();
            if let Some(reason) = &state.closed {
                return Err(RpcError::ConnectionLost(reason.clone()));
            }
            let (request_id, pending) = state.pending.issue(method);
            let encoded = self.encode_with_grants(&mut state.table, args, |args| WireMessage::Call {
                request_id,
                target,
                method: method.to_string(),
                args,
            });
            match encoded {
                Ok(frames) => (request_id, pending, frames),
                Err(e) => {
                    let _ = state.pending.claim(request_id);
                    return Err(e);
                }
            }
        };

        self.emit(RpcEvent::CallIssued {
            connection: self.id,
            request_id,
            target,
            method: method.to_string(),
        });
        // a failed write tears the connection down, which abandons this call
        if let Err(e) = self.write(&frames) {
            tracing::debug!(request_id, "Call not sent: {}", e);
        }
        Ok(pending)
    }

    fn release_import(&self, id: u64, handle: *const RemoteRefInner) {
        let count = {
            let mut state = self.state();
            if state.closed.is_some() {
                return;
            }
            state.table.forget_import(id, handle)
        };
        let Some(count) = count else { return };
        match encode_frame(&WireMessage::Release { id, count }, self.options.max_frame_len) {
            Ok(frame) => self.enqueue(Job::Send(frame)),
            Err(e) => tracing::warn!("Failed to encode release of {}: {}", id, e),
        }
    }

    /// Closes the connection once. Safe to call from any thread.
    pub(crate) fn teardown(&self, reason: String) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (cleared, slots, watchers) = {
            let mut state = self.state();
            state.closed = Some(reason.clone());
            (
                state.table.clear(),
                state.pending.drain(),
                std::mem::take(&mut state.watchers),
            )
        };

        // the worker exits once it has drained its queue
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).take();

        match self.session.try_lock() {
            Ok(mut session) => session.close(),
            Err(_) => {
                // a writer is stuck on the socket; shutting it down frees it
                let _ = self.control.shutdown(Shutdown::Both);
            }
        }

        let abandoned = slots.len();
        for slot in slots {
            self.emit(RpcEvent::CallResolved {
                connection: self.id,
                request_id: slot.request_id,
                resolution: CallResolution::Abandoned,
            });
            drop(slot.deliver(CallOutcome::Abandoned(reason.clone())));
        }
        self.emit(RpcEvent::ConnectionClosed {
            connection: self.id,
            reason: reason.clone(),
            abandoned,
        });
        drop(cleared);

        for (_, callback) in watchers {
            callback(&reason);
        }
    }

    fn run_reader(self: Arc<Self>, mut socket: TcpStream) {
        let reason = match self.read_frames(&mut socket) {
            Ok(()) => "peer closed the connection".to_string(),
            Err(e) => {
                if !self.is_closed() {
                    tracing::warn!(connection = %self.id, "Connection failed: {}", e);
                }
                e.to_string()
            }
        };
        self.teardown(reason);
    }

    fn read_frames(self: &Arc<Self>, socket: &mut TcpStream) -> Result<(), RpcError> {
        let mut decoder = FrameDecoder::new(self.options.max_frame_len);

        // frames that arrived together with the peer's hello
        let buffered = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take_buffered_plaintext()?;
        if self.ingest(&mut decoder, buffered)? {
            return Ok(());
        }

        socket.set_read_timeout(Some(READ_POLL))?;
        let mut backlog = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if self.is_closed() {
                return Ok(());
            }
            match socket.read(&mut chunk) {
                Ok(0) => {
                    // ciphertext held back while a writer had the session may
                    // still carry results and the peer's close_notify
                    if !backlog.is_empty() {
                        let absorbed = self
                            .session
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .absorb(&backlog)?;
                        if self.ingest(&mut decoder, absorbed)? {
                            return Ok(());
                        }
                    }
                    return Err(RpcError::ConnectionLost(
                        "peer closed the connection without close_notify".into(),
                    ));
                }
                Ok(n) => backlog.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(RpcError::ConnectionLost(e.to_string())),
            }
            if backlog.is_empty() {
                continue;
            }

            let absorbed = match self.session.try_lock() {
                Ok(mut session) => session.absorb(&backlog)?,
                // a writer holds the session; keep draining the socket
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().absorb(&backlog)?,
            };
            backlog.clear();
            if self.ingest(&mut decoder, absorbed)? {
                return Ok(());
            }
        }
    }

    /// Feeds plaintext to the decoder and handles every complete frame.
    /// Returns whether the peer has closed its side.
    fn ingest(self: &Arc<Self>, decoder: &mut FrameDecoder, absorbed: Absorbed) -> Result<bool, RpcError> {
        decoder.push(&absorbed.plaintext);
        while let Some(message) = decoder.next_message()? {
            self.handle_message(message)?;
        }
        Ok(absorbed.peer_closed)
    }

    fn handle_message(self: &Arc<Self>, message: WireMessage) -> Result<(), RpcError> {
        match message {
            WireMessage::Hello { .. } => Err(RpcError::Protocol(
                "unexpected hello after negotiation".into(),
            )),
            WireMessage::Call {
                request_id,
                target,
                method,
                args,
            } => self.accept_call(request_id, target, method, args),
            WireMessage::Result { request_id, value } => self.accept_result(request_id, value),
            WireMessage::Error {
                request_id,
                failure,
            } => self.accept_error(request_id, failure),
            WireMessage::CapabilityGrant { id, metadata } => {
                let handle = self
                    .state()
                    .table
                    .record_grant(id, metadata, |metadata| {
                        Arc::new(RemoteRefInner::new(id, metadata.clone(), self))
                    });
                drop(handle);
                Ok(())
            }
            WireMessage::Release { id, count } => {
                let released = self.state().table.release(id, count);
                match released {
                    Ok(Some(object)) => {
                        tracing::debug!(connection = %self.id, id, "Peer released capability");
                        drop(object);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::debug!(connection = %self.id, "Ignoring release: {}", e),
                }
                Ok(())
            }
        }
    }

    fn accept_call(
        self: &Arc<Self>,
        request_id: u64,
        target: u64,
        method: String,
        args: Vec<WireValue>,
    ) -> Result<(), RpcError> {
        let mut keep = Vec::new();
        let mut conversion_error = None;
        let (resolved, converted) = {
            let mut state = self.state();
            if state.closed.is_some() {
                return Ok(());
            }
            let resolved = if target == BOOTSTRAP_ID {
                Ok(Target::Bootstrap)
            } else {
                state.table.resolve(target).map(Target::Object)
            };
            let converted: Vec<Value> = args
                .iter()
                .cloned()
                .map(|w| from_wire(&mut state.table, w, &mut keep, &mut conversion_error))
                .collect();
            (resolved, converted)
        };

        if let Some(e) = conversion_error {
            if e.is_connection_fatal() {
                return Err(e);
            }
            self.reject_inbound(request_id, &method, e.to_failure());
            return Ok(());
        }

        let target = match resolved {
            Ok(target) => target,
            Err(e) => {
                self.reject_inbound(request_id, &method, e.to_failure());
                return Ok(());
            }
        };

        if let Target::Object(object) = &target {
            if let Some(interface) = object.interface() {
                if let Err(e) = interface.check_call(&method, &args) {
                    self.reject_inbound(request_id, &method, e.to_failure());
                    return Ok(());
                }
            }
        }

        self.enqueue(Job::Call {
            request_id,
            target,
            method,
            args: converted,
        });
        drop(keep);
        Ok(())
    }

    /// Answers an inbound call with an error without running it.
    fn reject_inbound(&self, request_id: u64, method: &str, failure: RemoteFailure) {
        self.note_local_failure(request_id, method, &failure);
        match encode_frame(
            &WireMessage::Error {
                request_id,
                failure,
            },
            self.options.max_frame_len,
        ) {
            Ok(frame) => self.enqueue(Job::Send(frame)),
            Err(e) => tracing::warn!("Failed to encode error reply: {}", e),
        }
    }

    fn note_local_failure(&self, request_id: u64, method: &str, failure: &RemoteFailure) {
        if self.options.log_local_failures {
            self.emit(RpcEvent::LocalFailure {
                connection: self.id,
                request_id,
                method: method.to_string(),
                failure: failure.to_string(),
            });
        }
    }

    fn accept_result(&self, request_id: u64, value: WireValue) -> Result<(), RpcError> {
        let mut keep = Vec::new();
        let mut conversion_error = None;
        let (slot, value) = {
            let mut state = self.state();
            let slot = state.pending.claim(request_id)?;
            let value = from_wire(&mut state.table, value, &mut keep, &mut conversion_error);
            (slot, value)
        };

        let (outcome, fatal) = match conversion_error {
            None => (CallOutcome::Fulfilled(value), None),
            Some(e) if e.is_connection_fatal() => (CallOutcome::Abandoned(e.to_string()), Some(e)),
            Some(e) => (CallOutcome::Rejected(e.to_failure()), None),
        };
        self.emit(RpcEvent::CallResolved {
            connection: self.id,
            request_id,
            resolution: outcome.resolution(),
        });
        drop(slot.deliver(outcome));
        drop(keep);
        fatal.map_or(Ok(()), Err)
    }

    fn accept_error(&self, request_id: u64, failure: RemoteFailure) -> Result<(), RpcError> {
        let slot = self.state().pending.claim(request_id)?;
        if self.options.log_remote_failures {
            self.emit(RpcEvent::RemoteFailure {
                connection: self.id,
                request_id,
                method: slot.method.clone(),
                failure: failure.to_string(),
            });
        }
        self.emit(RpcEvent::CallResolved {
            connection: self.id,
            request_id,
            resolution: CallResolution::Rejected,
        });
        drop(slot.deliver(CallOutcome::Rejected(failure)));
        Ok(())
    }

    fn run_worker(self: Arc<Self>, jobs: Receiver<Job>) {
        install_pump(Rc::new(WorkerPump {
            shared: Arc::downgrade(&self),
            jobs:   jobs.clone(),
        }));
        for job in jobs.iter() {
            self.run_job(job);
        }
        tracing::debug!(connection = %self.id, "Delivery worker stopped");
    }

    fn run_job(&self, job: Job) {
        if self.is_closed() {
            return;
        }
        match job {
            Job::Send(frame) => {
                if let Err(e) = self.write(&frame) {
                    tracing::debug!(connection = %self.id, "Queued frame not sent: {}", e);
                }
            }
            Job::Call {
                request_id,
                target,
                method,
                args,
            } => self.deliver(request_id, target, &method, args),
        }
    }

    fn deliver(&self, request_id: u64, target: Target, method: &str, args: Vec<Value>) {
        let ctx = CallContext {
            connection: self.id,
            peer: self.peer.clone(),
            request_id,
        };
        let (result, schema) = match &target {
            Target::Bootstrap => (self.bootstrap_call(method, args), None),
            Target::Object(object) => (
                object.invoke(method, args, &ctx),
                object.interface().and_then(|i| i.schema(method).ok()),
            ),
        };

        let frame = match result.and_then(|value| self.encode_result(request_id, &value, schema)) {
            Ok(frame) => frame,
            Err(failure) => {
                self.note_local_failure(request_id, method, &failure);
                match encode_frame(
                    &WireMessage::Error {
                        request_id,
                        failure,
                    },
                    self.options.max_frame_len,
                ) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Failed to encode error reply: {}", e);
                        return;
                    }
                }
            }
        };
        if let Err(e) = self.write(&frame) {
            tracing::debug!(connection = %self.id, request_id, "Reply not sent: {}", e);
        }
    }

    fn encode_result(
        &self,
        request_id: u64,
        value: &Value,
        schema: Option<&MethodSchema>,
    ) -> Result<Vec<u8>, RemoteFailure> {
        if let Some(schema) = schema {
            schema
                .check_response(&wire_shape(value))
                .map_err(|e| e.to_failure())?;
        }
        check_outbound(self.id, value).map_err(|e| e.to_failure())?;

        let mut state = self.state();
        if let Some(reason) = &state.closed {
            return Err(RpcError::ConnectionLost(reason.clone()).to_failure());
        }
        self.encode_with_grants(&mut state.table, std::slice::from_ref(value), |mut wire| {
            WireMessage::Result {
                request_id,
                value: wire.pop().unwrap_or(WireValue::None),
            }
        })
        .map_err(|e| e.to_failure())
    }

    fn bootstrap_call(&self, method: &str, args: Vec<Value>) -> Result<Value, RemoteFailure> {
        if method != GET_REFERENCE_BY_NAME {
            return Err(RemoteFailure::violation(format!(
                "{BOOTSTRAP_INTERFACE}({GET_REFERENCE_BY_NAME}) does not offer {method}"
            )));
        }
        let name = match args.as_slice() {
            [Value::Text(name)] => name,
            _ => {
                return Err(RemoteFailure::violation(format!(
                    "{GET_REFERENCE_BY_NAME} takes exactly one string argument"
                )))
            }
        };
        match self.registry.lookup(name) {
            Some(object) => Ok(Value::Local(object)),
            None => {
                let hint: String = name.chars().take(NAME_HINT_LEN).collect();
                tracing::debug!(connection = %self.id, "Lookup of unknown name starting with '{}'", hint);
                Err(RemoteFailure {
                    kind:    FailureKind::UnknownCapability,
                    message: format!("unable to find reference for name starting with '{hint}'"),
                })
            }
        }
    }
}

/// Runs a connection's queued jobs on its worker thread while a handler there
/// waits on an outbound result.
struct WorkerPump {
    shared: Weak<ConnectionShared>,
    jobs:   Receiver<Job>,
}

impl Pump for WorkerPump {
    fn pump_until(&self, result: &Receiver<CallOutcome>, deadline: Option<Instant>) {
        loop {
            let mut select = Select::new();
            let result_ready = select.recv(result);
            select.recv(&self.jobs);
            let ready = match deadline {
                Some(deadline) => match select.ready_deadline(deadline) {
                    Ok(index) => index,
                    Err(_) => return,
                },
                None => select.ready(),
            };
            if ready == result_ready {
                return;
            }
            match self.jobs.try_recv() {
                Ok(job) => match self.shared.upgrade() {
                    Some(shared) => shared.run_job(job),
                    None => return,
                },
                Err(TryRecvError::Empty) => {}
                // teardown resolves every pending call of this connection
                Err(TryRecvError::Disconnected) => return,
            }
        }
    }
}
