use std::{fmt, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by descriptor parsing, negotiation and the call path.
#[derive(Debug, Error)]
pub enum RpcError {
    /// A descriptor string could not be parsed.
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// The peer's identity did not match what we pinned, or broke the
    /// subject-identity rules. Never retried automatically.
    #[error("identity mismatch: {0}")]
    IdentityMismatch(String),

    /// The peer violated framing or correlation rules. Connection-fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No capability (or registered name) exists for the given identifier.
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    /// The capability existed but every reference to it has been released.
    #[error("capability {0} has been revoked")]
    CapabilityRevoked(u64),

    /// The transport closed while the operation was outstanding.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The remote side rejected the call.
    #[error("remote failure: {0}")]
    Remote(RemoteFailure),

    /// A call broke a method or argument constraint.
    #[error("constraint violation: {0}")]
    Violation(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

impl RpcError {
    /// Whether this error must tear down the connection it occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::IdentityMismatch(_)
                | RpcError::Protocol(_)
                | RpcError::ConnectionLost(_)
                | RpcError::Io(_)
                | RpcError::Tls(_)
        )
    }

    /// Converts a local failure into the payload sent back to a caller.
    pub fn to_failure(&self) -> RemoteFailure {
        let kind = match self {
            RpcError::UnknownCapability(_) => FailureKind::UnknownCapability,
            RpcError::CapabilityRevoked(_) => FailureKind::CapabilityRevoked,
            RpcError::Violation(_) => FailureKind::Violation,
            RpcError::Remote(failure) => return failure.clone(),
            _ => FailureKind::Application,
        };
        RemoteFailure {
            kind,
            message: self.to_string(),
        }
    }
}

/// Category of a failure carried in an `Error` wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Raised by the target object itself.
    Application,
    /// The call broke the target's interface schema.
    Violation,
    UnknownCapability,
    CapabilityRevoked,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Application => "application",
            FailureKind::Violation => "violation",
            FailureKind::UnknownCapability => "unknown-capability",
            FailureKind::CapabilityRevoked => "capability-revoked",
        };
        f.write_str(name)
    }
}

/// Application-defined error payload of a rejected call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteFailure {
    pub kind:    FailureKind,
    pub message: String,
}

impl RemoteFailure {
    pub fn application<S: Into<String>>(message: S) -> Self {
        Self {
            kind:    FailureKind::Application,
            message: message.into(),
        }
    }

    pub fn violation<S: Into<String>>(message: S) -> Self {
        Self {
            kind:    FailureKind::Violation,
            message: message.into(),
        }
    }
}
