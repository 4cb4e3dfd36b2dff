//! `pb://` descriptors: self-describing, non-secret references to a remote
//! capability.
//!
//! ```text
//! pb://sha256:<hex>@host:port/segment[/segment...]
//! ```
//!
//! Parsing is strict so that rendering a parsed descriptor always yields the
//! original text byte for byte.

use std::{fmt, net::Ipv6Addr, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::RpcError, fingerprint::Fingerprint};

/// URL scheme of every descriptor.
pub const DESCRIPTOR_SCHEME: &str = "pb://";

/// Parsed form of a `pb://` descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    host:        String,
    port:        u16,
    fingerprint: Fingerprint,
    path:        Vec<String>,
}

fn malformed<S: Into<String>>(reason: S) -> RpcError {
    RpcError::MalformedDescriptor(reason.into())
}

fn is_segment_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn is_host_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.')
}

fn parse_port(text: &str) -> Result<u16, RpcError> {
    if text.is_empty() {
        return Err(malformed("missing port"));
    }
    if !text.bytes().all(|b| b.is_ascii_digit()) || text.starts_with('0') {
        return Err(malformed(format!("invalid port '{text}'")));
    }
    text.parse::<u16>()
        .map_err(|_| malformed(format!("port '{text}' out of range")))
}

fn validate_segment(segment: &str) -> Result<(), RpcError> {
    if segment.is_empty() {
        return Err(malformed("empty path segment"));
    }
    if !segment.bytes().all(is_segment_byte) {
        return Err(malformed(format!("invalid path segment '{segment}'")));
    }
    Ok(())
}

fn validate_host(host: &str) -> Result<(), RpcError> {
    if host.contains(':') {
        return host
            .parse::<Ipv6Addr>()
            .map(|_| ())
            .map_err(|_| malformed(format!("invalid IPv6 host '{host}'")));
    }
    if host.is_empty() {
        return Err(malformed("missing host"));
    }
    if !host.bytes().all(is_host_byte) {
        return Err(malformed(format!("invalid host '{host}'")));
    }
    Ok(())
}

impl Descriptor {
    /// Builds a descriptor from parts, applying the same validation as
    /// [`Descriptor::parse`].
    pub fn new<H, I, S>(host: H, port: u16, fingerprint: Fingerprint, path: I) -> Result<Self, RpcError>
    where
        H: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let host = host.into();
        validate_host(&host)?;
        if port == 0 {
            return Err(malformed("port must be non-zero"));
        }
        let path: Vec<String> = path.into_iter().map(Into::into).collect();
        if path.is_empty() {
            return Err(malformed("missing object path"));
        }
        for segment in &path {
            validate_segment(segment)?;
        }
        Ok(Self {
            host,
            port,
            fingerprint,
            path,
        })
    }

    /// Parses descriptor text.
    pub fn parse(text: &str) -> Result<Self, RpcError> {
        let rest = text
            .strip_prefix(DESCRIPTOR_SCHEME)
            .ok_or_else(|| malformed("descriptor must start with pb://"))?;
        let (fp_text, rest) = rest
            .split_once('@')
            .ok_or_else(|| malformed("missing '@' after fingerprint"))?;
        if fp_text.is_empty() {
            return Err(malformed("missing fingerprint"));
        }
        let fingerprint: Fingerprint = fp_text.parse()?;

        let (location, path_text) = rest
            .split_once('/')
            .ok_or_else(|| malformed("missing object path"))?;

        let (host, port_text) = if let Some(bracketed) = location.strip_prefix('[') {
            let (inner, after) = bracketed
                .split_once(']')
                .ok_or_else(|| malformed("unterminated IPv6 host"))?;
            let port_text = after
                .strip_prefix(':')
                .ok_or_else(|| malformed("missing port"))?;
            if !inner.contains(':') {
                return Err(malformed("brackets are only valid around IPv6 hosts"));
            }
            (inner, port_text)
        } else {
            location
                .rsplit_once(':')
                .ok_or_else(|| malformed("missing port"))?
        };
        if host.contains(':') && !location.starts_with('[') {
            return Err(malformed("IPv6 hosts must be bracketed"));
        }
        let port = parse_port(port_text)?;

        Self::new(host, port, fingerprint, path_text.split('/'))
    }

    /// Renders the descriptor; the exact inverse of [`Descriptor::parse`].
    pub fn render(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!(
            "{}{}@{}:{}/{}",
            DESCRIPTOR_SCHEME,
            self.fingerprint,
            host,
            self.port,
            self.path.join("/")
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Registered object name: the path segments joined with `/`.
    pub fn name(&self) -> String {
        self.path.join("/")
    }

    /// `host:port` suitable for dialing.
    pub fn location(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Same peer and location, different object path.
    pub fn with_path<I, S>(&self, path: I) -> Result<Self, RpcError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(self.host.clone(), self.port, self.fingerprint.clone(), path)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for Descriptor {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
