//! Messages exchanged after negotiation, and their framing.
//!
//! Every frame is a 4-byte little-endian length followed by the bincode
//! encoding of one [`WireMessage`]. Frames are processed strictly in the
//! order they arrive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{RemoteFailure, RpcError};

/// Version carried in the `Hello` exchange.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default upper bound on a single frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Reference to a capability inside a [`WireValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapRef {
    /// An object exported by the sender; preceded by a `CapabilityGrant`.
    Granted(u64),
    /// One of the receiver's own exports, handed back to it.
    Yours(u64),
}

/// Serializable argument/result value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Capability(CapRef),
}

impl WireValue {
    /// Short type name used in violation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            WireValue::None => "none",
            WireValue::Bool(_) => "bool",
            WireValue::Int(_) => "int",
            WireValue::Float(_) => "float",
            WireValue::Bytes(_) => "bytes",
            WireValue::Text(_) => "text",
            WireValue::List(_) => "list",
            WireValue::Map(_) => "map",
            WireValue::Capability(_) => "capability",
        }
    }
}

/// What a peer learns about a capability when it is granted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityMetadata {
    /// Remote interface name, e.g. `RIMyTarget`.
    pub interface: String,
    /// Methods the interface offers. Empty means "not declared".
    pub methods:   Vec<String>,
}

impl CapabilityMetadata {
    /// Whether an outbound call to `method` may be sent.
    pub fn offers(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == method)
    }
}

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First message in each direction after the TLS handshake.
    Hello { version: u32 },
    Call {
        request_id: u64,
        target:     u64,
        method:     String,
        args:       Vec<WireValue>,
    },
    Result {
        request_id: u64,
        value:      WireValue,
    },
    Error {
        request_id: u64,
        failure:    RemoteFailure,
    },
    /// The sender exported `id` (once more) to the receiver.
    CapabilityGrant {
        id:       u64,
        metadata: CapabilityMetadata,
    },
    /// The receiver of `count` grants of `id` dropped all of them.
    Release { id: u64, count: u32 },
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Hello { .. } => "hello",
            WireMessage::Call { .. } => "call",
            WireMessage::Result { .. } => "result",
            WireMessage::Error { .. } => "error",
            WireMessage::CapabilityGrant { .. } => "grant",
            WireMessage::Release { .. } => "release",
        }
    }
}

/// Serializes one message into a length-prefixed frame.
pub fn encode_frame(msg: &WireMessage, max_len: usize) -> Result<Vec<u8>, RpcError> {
    let body = bincode::serialize(msg)
        .map_err(|e| RpcError::Protocol(format!("failed to serialize {}: {e}", msg.kind())))?;
    if body.len() > max_len {
        return Err(RpcError::Protocol(format!(
            "message too large: {} bytes (max {})",
            body.len(),
            max_len
        )));
    }
    let len = u32::try_from(body.len()).map_err(|_| {
        RpcError::Protocol(format!("message too large: {} bytes", body.len()))
    })?;
    let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental frame decoder fed with decrypted bytes in arrival order.
#[derive(Debug)]
pub struct FrameDecoder {
    buf:     Vec<u8>,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete message, or `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<WireMessage>, RpcError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut len_buf = [0u8; LEN_PREFIX];
        len_buf.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > self.max_len {
            return Err(RpcError::Protocol(format!(
                "message too large: {} bytes (max {})",
                len, self.max_len
            )));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let msg = bincode::deserialize(&self.buf[LEN_PREFIX..LEN_PREFIX + len])
            .map_err(|e| RpcError::Protocol(format!("failed to deserialize message: {e}")))?;
        self.buf.drain(..LEN_PREFIX + len);
        Ok(Some(msg))
    }
}
