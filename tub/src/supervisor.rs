//! The tub: one identity, its live connections, listeners and published
//! objects.

use std::{
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, RwLock, Weak,
    },
    thread,
    time::Duration,
};

use sturdy_common::{
    config::{BindSpec, TubOptions},
    descriptor::Descriptor,
    error::RpcError,
    events::{Direction, EventSink, RpcEvent, TracingSink},
    fingerprint::{Fingerprint, HashAlgorithm},
};

use crate::{
    cache::FingerprintCache,
    connection::{Connection, RemoteReference},
    identity::TubIdentity,
    negotiator::Negotiator,
    referenceable::Referenceable,
    registry::Registry,
};

const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Builds a [`Tub`] with non-default collaborators.
pub struct TubBuilder {
    identity: TubIdentity,
    options:  TubOptions,
    events:   Option<Arc<dyn EventSink>>,
    cache:    Option<Arc<FingerprintCache>>,
}

impl TubBuilder {
    pub fn new(identity: TubIdentity) -> Self {
        Self {
            identity,
            options: TubOptions::default(),
            events: None,
            cache: None,
        }
    }

    pub fn with_options(mut self, options: TubOptions) -> Self {
        self.options = options;
        self
    }

    /// Where connection and call events go. Defaults to [`TracingSink`].
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Shares `cache` with other tubs. Without it the tub gets a cache of its
    /// own.
    pub fn with_fingerprint_cache(mut self, cache: Arc<FingerprintCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<Tub, RpcError> {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(FingerprintCache::new()));
        let events = self.events.unwrap_or_else(|| Arc::new(TracingSink));
        let fingerprint = self.identity.fingerprint(self.options.hash_algorithm);
        let negotiator = Negotiator::new(self.identity, self.options, cache)?;
        tracing::info!("Tub {} ready", fingerprint.short());

        Ok(Tub {
            inner: Arc::new(TubInner {
                negotiator,
                fingerprint,
                events,
                registry: Arc::new(Registry::new()),
                connections: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                location: RwLock::new(None),
            }),
        })
    }
}

struct TubInner {
    negotiator:  Negotiator,
    fingerprint: Fingerprint,
    events:      Arc<dyn EventSink>,
    registry:    Arc<Registry>,
    connections: Mutex<Vec<Connection>>,
    listeners:   Mutex<Vec<Arc<ListenerShared>>>,
    location:    RwLock<Option<(String, u16)>>,
}

/// A process-local RPC endpoint.
///
/// Cloning is cheap; clones share connections and registrations. Dropping the
/// last clone stops every listener and closes every connection.
#[derive(Clone)]
pub struct Tub {
    inner: Arc<TubInner>,
}

impl Tub {
    pub fn new(identity: TubIdentity, options: TubOptions) -> Result<Self, RpcError> {
        TubBuilder::new(identity).with_options(options).build()
    }

    pub fn builder(identity: TubIdentity) -> TubBuilder {
        TubBuilder::new(identity)
    }

    /// Our certificate fingerprint under the configured algorithm.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.inner.fingerprint
    }

    pub fn options(&self) -> &TubOptions {
        self.inner.negotiator.options()
    }

    /// The subject-identity verdicts this tub consults; pass it to
    /// [`TubBuilder::with_fingerprint_cache`] to share it.
    pub fn fingerprint_cache(&self) -> Arc<FingerprintCache> {
        self.inner.negotiator.cache().clone()
    }

    /// Returns the live connection to the descriptor's peer, dialing and
    /// negotiating one if there is none.
    pub fn connect(&self, descriptor: &Descriptor) -> Result<Connection, RpcError> {
        self.inner.connect(descriptor)
    }

    /// Starts accepting inbound connections on `spec` (`host:port` or
    /// `tcp:PORT[:interface=HOST]`).
    pub fn listen(&self, spec: &str) -> Result<Listener, RpcError> {
        let bind = BindSpec::parse(spec)?;
        let socket = TcpListener::bind(bind.socket_addr()?)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let shared = Arc::new(ListenerShared {
            local_addr,
            stop: AtomicBool::new(false),
        });
        let tub = Arc::downgrade(&self.inner);
        let accept_shared = shared.clone();
        thread::Builder::new()
            .name(format!("sturdy-listen-{}", local_addr.port()))
            .spawn(move || accept_loop(socket, tub, accept_shared))?;

        tracing::info!("✓ Tub {} listening on {}", self.inner.fingerprint.short(), local_addr);
        self.inner.listeners().push(shared.clone());
        Ok(Listener { shared })
    }

    /// Sets the host and port written into descriptors from [`register`].
    ///
    /// [`register`]: Self::register
    pub fn set_location<H: Into<String>>(&self, host: H, port: u16) {
        let mut location = self.inner.location.write().unwrap_or_else(|e| e.into_inner());
        *location = Some((host.into(), port));
    }

    pub fn location(&self) -> Option<(String, u16)> {
        self.inner
            .location
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Publishes `object` and returns a descriptor peers can dial to reach
    /// it. Without a name an unguessable one is chosen; publishing the same
    /// object again returns the same descriptor.
    pub fn register(
        &self,
        object: Arc<dyn Referenceable>,
        name: Option<&str>,
    ) -> Result<Descriptor, RpcError> {
        let (host, port) = self.location().ok_or_else(|| {
            RpcError::Config("set_location must be called before registering objects".into())
        })?;
        let name = self.inner.registry.register(object, name)?;
        Descriptor::new(host, port, self.inner.fingerprint.clone(), name.split('/'))
    }

    /// Withdraws a published name. Returns whether it was registered here.
    pub fn unregister_descriptor(&self, descriptor: &Descriptor) -> bool {
        if !self.is_local(descriptor) {
            return false;
        }
        self.inner.registry.unregister_name(&descriptor.name()).is_some()
    }

    pub fn unregister_object(&self, object: &Arc<dyn Referenceable>) -> bool {
        self.inner.registry.unregister_object(object).is_some()
    }

    /// Resolves a descriptor that names an object published by this tub.
    pub fn lookup_local(&self, descriptor: &Descriptor) -> Result<Arc<dyn Referenceable>, RpcError> {
        if !self.is_local(descriptor) {
            return Err(RpcError::Config(format!(
                "descriptor belongs to {}, not this tub",
                descriptor.fingerprint().short()
            )));
        }
        let name = descriptor.name();
        self.inner.registry.lookup(&name).ok_or_else(|| {
            RpcError::UnknownCapability(format!("no object registered as '{name}'"))
        })
    }

    /// Connects to the descriptor's peer and asks it for the named object.
    pub fn get_reference(&self, descriptor: &Descriptor) -> Result<RemoteReference, RpcError> {
        let connection = self.connect(descriptor)?;
        let reference = connection.get_reference_by_name(&descriptor.name())?;
        Ok(reference.with_descriptor(descriptor.clone()))
    }

    /// Closes one connection.
    pub fn shutdown(&self, connection: &Connection) {
        connection.close();
    }

    /// Stops every listener and closes every connection.
    pub fn shutdown_all(&self) {
        self.inner.shutdown_all();
    }

    /// Live connections, in the order they were adopted.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections()
            .iter()
            .filter(|c| c.is_connected())
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .connections()
            .iter()
            .filter(|c| c.is_connected())
            .count()
    }

    fn is_local(&self, descriptor: &Descriptor) -> bool {
        self.inner.is_own_fingerprint(descriptor.fingerprint())
    }
}

impl TubInner {
    fn connections(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Arc<ListenerShared>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_own_fingerprint(&self, fingerprint: &Fingerprint) -> bool {
        self.negotiator
            .identity()
            .fingerprint(fingerprint.algorithm())
            == *fingerprint
    }

    fn find_connection(&self, fingerprint: &Fingerprint) -> Option<Connection> {
        self.connections()
            .iter()
            .find(|c| c.is_connected() && c.matches_fingerprint(fingerprint))
            .cloned()
    }

    fn connect(self: &Arc<Self>, descriptor: &Descriptor) -> Result<Connection, RpcError> {
        if self.is_own_fingerprint(descriptor.fingerprint()) {
            return Err(RpcError::Config(
                "descriptor points at this tub; use lookup_local".into(),
            ));
        }
        if let Some(existing) = self.find_connection(descriptor.fingerprint()) {
            tracing::debug!("Reusing connection {} for {}", existing.id(), descriptor.location());
            return Ok(existing);
        }

        let (socket, remote) = self.dial(descriptor)?;
        let negotiated = match self.negotiator.initiate(socket, descriptor) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::warn!("✗ Negotiation with {} failed: {}", descriptor.location(), e);
                self.events.emit(&RpcEvent::NegotiationFailed {
                    remote:    Some(remote),
                    direction: Direction::Outbound,
                    error:     e.to_string(),
                });
                return Err(e);
            }
        };
        let connection = Connection::establish(
            negotiated,
            self.negotiator.options().clone(),
            self.events.clone(),
            self.registry.clone(),
        )?;
        Ok(self.adopt(connection))
    }

    fn dial(&self, descriptor: &Descriptor) -> Result<(TcpStream, SocketAddr), RpcError> {
        let timeout = self.negotiator.options().handshake_timeout;
        let mut last_error = None;
        for addr in (descriptor.host(), descriptor.port()).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(socket) => {
                    socket.set_nodelay(true)?;
                    tracing::info!("Connected to {}", addr);
                    return Ok((socket, addr));
                }
                Err(e) => {
                    tracing::debug!("Dial {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(match last_error {
            Some(e) => e.into(),
            None => RpcError::Config(format!("'{}' did not resolve", descriptor.host())),
        })
    }

    fn accept(self: Arc<Self>, socket: TcpStream, remote: SocketAddr) {
        if let Err(e) = socket.set_nonblocking(false).and_then(|()| socket.set_nodelay(true)) {
            tracing::error!("Failed to configure socket from {}: {}", remote, e);
            return;
        }
        tracing::info!("Authenticating peer {}...", remote);
        let negotiated = match self.negotiator.respond(socket) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::warn!("✗ Negotiation with {} failed: {}", remote, e);
                self.events.emit(&RpcEvent::NegotiationFailed {
                    remote:    Some(remote),
                    direction: Direction::Inbound,
                    error:     e.to_string(),
                });
                return;
            }
        };
        match Connection::establish(
            negotiated,
            self.negotiator.options().clone(),
            self.events.clone(),
            self.registry.clone(),
        ) {
            Ok(connection) => {
                self.adopt(connection);
            }
            Err(e) => tracing::error!("Failed to start connection from {}: {}", remote, e),
        }
    }

    /// Adds a new connection to the live set, resolving duplicates to the
    /// same peer. Returns the connection that survives.
    ///
    /// A second outbound connection defers to the first, a newer inbound one
    /// replaces the older, and when the two were dialed from opposite ends
    /// both tubs keep the one initiated by the tub whose certificate has the
    /// larger SHA-256 digest.
    fn adopt(self: &Arc<Self>, connection: Connection) -> Connection {
        let mut connections = self.connections();
        let existing = connections
            .iter()
            .position(|c| c.is_connected() && c.peer_certificate() == connection.peer_certificate());

        let Some(index) = existing else {
            connections.push(connection.clone());
            drop(connections);
            self.watch(&connection);
            return connection;
        };

        let keep_new = match (connections[index].direction(), connection.direction()) {
            (Direction::Outbound, Direction::Outbound) => false,
            (Direction::Inbound, Direction::Inbound) => true,
            (_, new_direction) => {
                let ours = self
                    .negotiator
                    .identity()
                    .fingerprint(HashAlgorithm::Sha256);
                let theirs =
                    Fingerprint::of_certificate(HashAlgorithm::Sha256, connection.peer_certificate());
                let we_win = ours.as_bytes() > theirs.as_bytes();
                (new_direction == Direction::Outbound) == we_win
            }
        };

        if keep_new {
            let replaced = std::mem::replace(&mut connections[index], connection.clone());
            drop(connections);
            tracing::info!("Replacing duplicate connection {} with {}", replaced.id(), connection.id());
            self.watch(&connection);
            replaced.close();
            connection
        } else {
            let kept = connections[index].clone();
            drop(connections);
            tracing::info!("Dropping duplicate connection {} in favour of {}", connection.id(), kept.id());
            connection.close();
            kept
        }
    }

    /// Removes `connection` from the live set once it closes.
    fn watch(self: &Arc<Self>, connection: &Connection) {
        let tub = Arc::downgrade(self);
        let id = connection.id();
        connection.notify_on_disconnect(move |_| {
            let Some(tub) = tub.upgrade() else { return };
            let removed = {
                let mut connections = tub.connections();
                connections
                    .iter()
                    .position(|c| c.id() == id)
                    .map(|index| connections.remove(index))
            };
            drop(removed);
        });
    }

    fn shutdown_all(&self) {
        for listener in self.listeners().drain(..) {
            listener.stop.store(true, Ordering::SeqCst);
        }
        let connections: Vec<Connection> = self.connections().clone();
        for connection in connections {
            connection.close();
        }
    }
}

impl Drop for TubInner {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

struct ListenerShared {
    local_addr: SocketAddr,
    stop:       AtomicBool,
}

/// Handle to a listening socket started by [`Tub::listen`].
///
/// Dropping the handle does not stop the listener; [`stop`](Self::stop) or
/// [`Tub::shutdown_all`] does.
#[derive(Clone)]
pub struct Listener {
    shared: Arc<ListenerShared>,
}

impl Listener {
    /// The bound address, with the real port when `0` was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stop.load(Ordering::SeqCst)
    }
}

fn accept_loop(socket: TcpListener, tub: Weak<TubInner>, shared: Arc<ListenerShared>) {
    while !shared.stop.load(Ordering::SeqCst) {
        match socket.accept() {
            Ok((stream, remote)) => {
                tracing::info!("New connection received from {}", remote);
                let Some(inner) = tub.upgrade() else { break };
                if let Err(e) = thread::Builder::new()
                    .name("sturdy-negotiate".into())
                    .spawn(move || inner.accept(stream, remote))
                {
                    tracing::error!("Failed to start negotiation thread: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // Sleep briefly to avoid busy waiting
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                tracing::error!("Connection error: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    tracing::info!("Listener on {} stopped", shared.local_addr);
}
