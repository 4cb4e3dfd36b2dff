//! Structured events emitted by the RPC core.
//!
//! The core only depends on [`EventSink`]; [`TracingSink`] forwards events to
//! `tracing`, and [`MemorySink`] keeps them for inspection in tests.

use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use uuid::Uuid;

use crate::fingerprint::Fingerprint;

/// Process-unique identifier of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the first group is plenty to tell connections apart in logs
        let full = self.0.simple().to_string();
        f.write_str(&full[..8])
    }
}

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}

/// Terminal state reached by an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResolution {
    Fulfilled,
    Rejected,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcEvent {
    ConnectionOpened {
        connection: ConnectionId,
        peer:       Fingerprint,
        remote:     Option<SocketAddr>,
        direction:  Direction,
    },
    ConnectionClosed {
        connection: ConnectionId,
        reason:     String,
        abandoned:  usize,
    },
    NegotiationFailed {
        remote:    Option<SocketAddr>,
        direction: Direction,
        error:     String,
    },
    CallIssued {
        connection: ConnectionId,
        request_id: u64,
        target:     u64,
        method:     String,
    },
    CallResolved {
        connection: ConnectionId,
        request_id: u64,
        resolution: CallResolution,
    },
    /// An inbound call we executed on behalf of the peer failed locally.
    LocalFailure {
        connection: ConnectionId,
        request_id: u64,
        method:     String,
        failure:    String,
    },
    /// An outbound call failed on the far end.
    RemoteFailure {
        connection: ConnectionId,
        request_id: u64,
        method:     String,
        failure:    String,
    },
}

/// Destination for [`RpcEvent`]s.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &RpcEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &RpcEvent) {
        match event {
            RpcEvent::ConnectionOpened {
                connection,
                peer,
                remote,
                direction,
            } => tracing::info!(
                %connection, %peer, ?remote, %direction,
                "✓ Connection established"
            ),
            RpcEvent::ConnectionClosed {
                connection,
                reason,
                abandoned,
            } => tracing::info!(%connection, abandoned, "Connection closed: {}", reason),
            RpcEvent::NegotiationFailed {
                remote,
                direction,
                error,
            } => tracing::warn!(?remote, %direction, "✗ Negotiation failed: {}", error),
            RpcEvent::CallIssued {
                connection,
                request_id,
                target,
                method,
            } => tracing::debug!(
                %connection, request_id, target_id = *target, method = %method,
                "Call issued"
            ),
            RpcEvent::CallResolved {
                connection,
                request_id,
                resolution,
            } => tracing::debug!(%connection, request_id, ?resolution, "Call resolved"),
            RpcEvent::LocalFailure {
                connection,
                request_id,
                method,
                failure,
            } => tracing::warn!(
                %connection, request_id, method = %method,
                "an inbound call that we executed on behalf of the peer failed: {}", failure
            ),
            RpcEvent::RemoteFailure {
                connection,
                request_id,
                method,
                failure,
            } => tracing::warn!(
                %connection, request_id, method = %method,
                "an outbound call failed on the far end: {}", failure
            ),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RpcEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RpcEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count<F: Fn(&RpcEvent) -> bool>(&self, pred: F) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &RpcEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Forwards each event to several sinks.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &RpcEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
