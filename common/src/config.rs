use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{error::RpcError, fingerprint::HashAlgorithm, wire::DEFAULT_MAX_FRAME_LEN};

const CERTS_DIR_ENV: &str = "STURDY_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = "certs";

const HASH_ALGORITHM_ENV: &str = "STURDY_HASH_ALGORITHM";
const MAX_FRAME_LEN_ENV: &str = "STURDY_MAX_FRAME_LEN";
/// Frame lengths travel as a u32 prefix.
const FRAME_LEN_CEILING: usize = u32::MAX as usize;
const HANDSHAKE_TIMEOUT_ENV: &str = "STURDY_HANDSHAKE_TIMEOUT_SECS";
const LOG_LOCAL_FAILURES_ENV: &str = "STURDY_LOG_LOCAL_FAILURES";
const LOG_REMOTE_FAILURES_ENV: &str = "STURDY_LOG_REMOTE_FAILURES";

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn get_certs_dir() -> PathBuf {
    let dir = env::var(CERTS_DIR_ENV).unwrap_or(DEFAULT_CERTS_DIR.to_string());
    PathBuf::from(dir)
}

/// Certificate and key of a tub's TLS identity
#[derive(Debug, Clone)]
pub struct TubCertPath {
    /// Path to the (usually self-signed) certificate
    pub cert_path: PathBuf,
    /// Path to the private key
    pub key_path:  PathBuf,
}

impl TubCertPath {
    /// Creates TubCertPath with default certificate locations
    /// (`$STURDY_CERTS_DIR/tub.pem` and `tub.key.pem`).
    pub fn new() -> Self {
        Self::in_dir(get_certs_dir())
    }

    /// Expects `tub.pem` and `tub.key.pem` inside `dir`.
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let base = dir.as_ref();
        Self {
            cert_path: base.join("tub.pem"),
            key_path:  base.join("tub.key.pem"),
        }
    }
}

impl Default for TubCertPath {
    fn default() -> Self {
        Self::new()
    }
}

/// Protocol options shared by every connection of a tub
#[derive(Debug, Clone)]
pub struct TubOptions {
    /// Algorithm used to fingerprint our own certificate and inbound peers
    pub hash_algorithm:      HashAlgorithm,
    /// Largest accepted frame body
    pub max_frame_len:       usize,
    /// Upper bound on TCP connect + TLS handshake + hello
    pub handshake_timeout:   Duration,
    /// Log inbound calls that failed while we executed them
    pub log_local_failures:  bool,
    /// Log outbound calls that failed on the far end
    pub log_remote_failures: bool,
}

impl Default for TubOptions {
    fn default() -> Self {
        Self {
            hash_algorithm:      HashAlgorithm::default(),
            max_frame_len:       DEFAULT_MAX_FRAME_LEN,
            handshake_timeout:   DEFAULT_HANDSHAKE_TIMEOUT,
            log_local_failures:  false,
            log_remote_failures: false,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name).ok().map(|v| v.to_lowercase() == "true")
}

impl TubOptions {
    /// Creates options with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options from environment variables
    ///
    /// Reads STURDY_HASH_ALGORITHM, STURDY_MAX_FRAME_LEN,
    /// STURDY_HANDSHAKE_TIMEOUT_SECS, STURDY_LOG_LOCAL_FAILURES and
    /// STURDY_LOG_REMOTE_FAILURES. Unparseable values are reported rather
    /// than silently replaced by defaults.
    pub fn from_env() -> Result<Self, RpcError> {
        let mut options = Self::new();

        if let Ok(tag) = env::var(HASH_ALGORITHM_ENV) {
            options.hash_algorithm = HashAlgorithm::from_tag(tag.trim()).ok_or_else(|| {
                RpcError::Config(format!("{HASH_ALGORITHM_ENV}: unknown algorithm '{tag}'"))
            })?;
        }

        if let Ok(len) = env::var(MAX_FRAME_LEN_ENV) {
            let parsed: usize = len
                .trim()
                .parse()
                .map_err(|_| RpcError::Config(format!("{MAX_FRAME_LEN_ENV}: invalid length '{len}'")))?;
            options = options.with_max_frame_len(parsed);
        }

        if let Ok(secs) = env::var(HANDSHAKE_TIMEOUT_ENV) {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                RpcError::Config(format!("{HANDSHAKE_TIMEOUT_ENV}: invalid seconds '{secs}'"))
            })?;
            options.handshake_timeout = Duration::from_secs(secs);
        }

        if let Some(flag) = env_flag(LOG_LOCAL_FAILURES_ENV) {
            options.log_local_failures = flag;
        }
        if let Some(flag) = env_flag(LOG_REMOTE_FAILURES_ENV) {
            options.log_remote_failures = flag;
        }

        Ok(options)
    }

    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = algorithm;
        self
    }

    /// Capped at `u32::MAX`, the largest length a frame prefix can carry.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len.min(FRAME_LEN_CEILING);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_log_local_failures(mut self, enabled: bool) -> Self {
        self.log_local_failures = enabled;
        self
    }

    pub fn with_log_remote_failures(mut self, enabled: bool) -> Self {
        self.log_remote_failures = enabled;
        self
    }
}

/// Where a listener binds.
///
/// Accepts `host:port` or `tcp:PORT[:interface=HOST]`; the interface
/// defaults to all addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    pub host: String,
    pub port: u16,
}

impl BindSpec {
    pub fn parse(spec: &str) -> Result<Self, RpcError> {
        let invalid = || RpcError::Config(format!("invalid bind spec '{spec}'"));

        if let Some(rest) = spec.strip_prefix("tcp:") {
            // the interface value may itself contain ':' (IPv6)
            let (port, option) = match rest.split_once(':') {
                Some((port, option)) => (port, Some(option)),
                None => (rest, None),
            };
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            let host = match option.map(|option| option.split_once('=')) {
                None => "0.0.0.0",
                Some(Some(("interface", value))) => value.trim_start_matches('[').trim_end_matches(']'),
                Some(_) => return Err(invalid()),
            };
            if host.is_empty() {
                return Err(invalid());
            }
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        let (host, port) = spec.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Resolves to the first socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, RpcError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RpcError::Config(format!("bind host '{}' did not resolve", self.host)))
    }
}
