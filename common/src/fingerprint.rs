use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::RpcError;

/// Hash algorithm used to fingerprint a peer certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Tag used in descriptor text.
    pub fn tag(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Hash of a peer's DER-encoded end-entity certificate.
///
/// Rendered as `<algorithm>:<lowercase hex>`, e.g. `sha256:9f86d0...`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    algorithm: HashAlgorithm,
    bytes:     Vec<u8>,
}

impl Fingerprint {
    /// Fingerprints a DER certificate.
    pub fn of_certificate(algorithm: HashAlgorithm, der: &[u8]) -> Self {
        Self {
            algorithm,
            bytes: algorithm.digest(der),
        }
    }

    /// Builds a fingerprint from raw digest bytes, checking the length.
    pub fn from_bytes(algorithm: HashAlgorithm, bytes: Vec<u8>) -> Result<Self, RpcError> {
        if bytes.len() != algorithm.digest_len() {
            return Err(RpcError::MalformedDescriptor(format!(
                "{} fingerprint must be {} bytes, got {}",
                algorithm,
                algorithm.digest_len(),
                bytes.len()
            )));
        }
        Ok(Self { algorithm, bytes })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// First few hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.bytes[..4.min(self.bytes.len())])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, hex::encode(&self.bytes))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl FromStr for Fingerprint {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, digits) = s
            .split_once(':')
            .ok_or_else(|| RpcError::MalformedDescriptor("fingerprint has no algorithm tag".into()))?;
        let algorithm = HashAlgorithm::from_tag(tag).ok_or_else(|| {
            RpcError::MalformedDescriptor(format!("unsupported hash algorithm '{tag}'"))
        })?;
        // uppercase would decode fine but not render back identically
        if !digits
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(RpcError::MalformedDescriptor(
                "fingerprint must be lowercase hex".into(),
            ));
        }
        let bytes = hex::decode(digits)
            .map_err(|e| RpcError::MalformedDescriptor(format!("bad fingerprint hex: {e}")))?;
        Self::from_bytes(algorithm, bytes)
    }
}
