//! Sturdy Common Library
//!
//! Shared building blocks for sturdy tubs: everything two peers must agree on
//! before and after their TLS handshake.
//!
//! - `pb://` descriptors and certificate fingerprints
//! - The framed wire protocol and its message types
//! - Remote interface schemas checked before delivery
//! - TLS stream wrappers for the negotiated connection
//! - Configuration, errors and structured events

/// Configuration structures and environment loading
pub mod config;

/// `pb://` descriptor parsing and rendering
pub mod descriptor;

/// Error types shared across the stack
pub mod error;

/// Structured connection and call events
pub mod events;

/// Certificate fingerprints
pub mod fingerprint;

/// Remote interface schemas
pub mod schema;

/// TLS stream wrapper for the negotiated connection
pub mod tls_stream;

/// Wire messages and framing
pub mod wire;

// Re-export commonly used types for convenience
pub use config::{BindSpec, TubCertPath, TubOptions};
pub use descriptor::{Descriptor, DESCRIPTOR_SCHEME};
pub use error::{FailureKind, RemoteFailure, RpcError};
pub use events::{
    CallResolution, ConnectionId, Direction, EventSink, FanoutSink, MemorySink, RpcEvent,
    TracingSink,
};
pub use fingerprint::{Fingerprint, HashAlgorithm};
pub use schema::{ArgSpec, Constraint, MethodSchema, RemoteInterface};
pub use tls_stream::{Absorbed, TlsSession, TlsStream};
pub use wire::{
    encode_frame, CapRef, CapabilityMetadata, FrameDecoder, WireMessage, WireValue,
    DEFAULT_MAX_FRAME_LEN, PROTOCOL_VERSION,
};
