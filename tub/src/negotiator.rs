//! Mutually authenticated TLS negotiation with fingerprint pinning.
//!
//! Chains of trust are never consulted. An outbound connection is accepted
//! only if the server's end-entity certificate hashes to the fingerprint in
//! the descriptor being dialed; both directions additionally apply the
//! subject-identity rules in [`check_subject`]. All of this happens inside the
//! rustls verifiers, so a rejected peer never sees an application byte.

use std::{
    fmt,
    net::{SocketAddr, TcpStream},
    sync::Arc,
};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    server::danger::{ClientCertVerified, ClientCertVerifier},
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, DistinguishedName,
    OtherError, ServerConfig, ServerConnection, SignatureScheme,
};
use sturdy_common::{
    config::TubOptions,
    descriptor::Descriptor,
    error::RpcError,
    events::Direction,
    fingerprint::{Fingerprint, HashAlgorithm},
    tls_stream::TlsStream,
    wire::{WireMessage, PROTOCOL_VERSION},
};
use x509_parser::{extensions::GeneralName, parse_x509_certificate};

use crate::{
    cache::{FingerprintCache, TrustDecision},
    identity::TubIdentity,
};

/// SNI sent when the descriptor host is not a valid server name.
const FALLBACK_SERVER_NAME: &str = "sturdy.invalid";

/// Why a verifier refused a peer certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRejection {
    pub reason: String,
}

impl fmt::Display for IdentityRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for IdentityRejection {}

fn reject(reason: String) -> rustls::Error {
    rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(
        IdentityRejection { reason },
    ))))
}

/// Extracts the reason from a handshake aborted by one of our verifiers.
fn identity_rejection(err: &RpcError) -> Option<String> {
    match err {
        RpcError::Tls(rustls::Error::InvalidCertificate(CertificateError::Other(other))) => other
            .0
            .downcast_ref::<IdentityRejection>()
            .map(|rejection| rejection.reason.clone()),
        _ => None,
    }
}

/// Applies the subject-identity rules to a DER certificate.
///
/// The certificate must parse as X.509, carry at least one identity (common
/// name or SAN dNSName), have at most one common name, and use no wildcard
/// anywhere in its names.
pub fn check_subject(der: &[u8]) -> TrustDecision {
    let cert = match parse_x509_certificate(der) {
        Ok((_, cert)) => cert,
        Err(e) => return TrustDecision::Rejected(format!("certificate is not valid X.509: {e}")),
    };

    let mut common_names = Vec::new();
    for attr in cert.subject().iter_common_name() {
        match attr.as_str() {
            Ok(cn) => common_names.push(cn.to_string()),
            Err(_) => {
                return TrustDecision::Rejected("subject common name is not a string".into())
            }
        }
    }
    if common_names.len() > 1 {
        return TrustDecision::Rejected(format!(
            "certificate has {} subject common names",
            common_names.len()
        ));
    }
    if let Some(cn) = common_names.iter().find(|cn| cn.contains('*')) {
        return TrustDecision::Rejected(format!("wildcard common name '{cn}'"));
    }

    let mut san_count = 0;
    match cert.subject_alternative_name() {
        Ok(Some(san)) => {
            for name in &san.value.general_names {
                san_count += 1;
                if let GeneralName::DNSName(dns) = name {
                    if dns.contains('*') {
                        return TrustDecision::Rejected(format!("wildcard subjectAltName '{dns}'"));
                    }
                }
            }
        }
        Ok(None) => {}
        Err(e) => {
            return TrustDecision::Rejected(format!("unreadable subjectAltName extension: {e}"))
        }
    }

    if common_names.is_empty() && san_count == 0 {
        return TrustDecision::Rejected("certificate carries no subject identity".into());
    }
    TrustDecision::Accepted
}

fn enforce_subject(
    cache: &FingerprintCache,
    fingerprint: &Fingerprint,
    der: &[u8],
) -> Result<(), rustls::Error> {
    match cache.decide(fingerprint, || check_subject(der)) {
        TrustDecision::Accepted => Ok(()),
        TrustDecision::Rejected(reason) => Err(reject(reason)),
    }
}

/// Client-side verifier: the server must present exactly the pinned
/// certificate.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    expected: Fingerprint,
    cache:    Arc<FingerprintCache>,
    provider: Arc<CryptoProvider>,
}

impl PinnedServerVerifier {
    pub fn new(
        expected: Fingerprint,
        cache: Arc<FingerprintCache>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            expected,
            cache,
            provider,
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = Fingerprint::of_certificate(self.expected.algorithm(), end_entity);
        if actual != self.expected {
            tracing::warn!("✗ Server fingerprint mismatch: expected {}, got {}", self.expected, actual);
            return Err(reject(format!(
                "server presented {} but the descriptor pins {}",
                actual, self.expected
            )));
        }
        enforce_subject(&self.cache, &actual, end_entity)?;
        tracing::debug!("✓ Server certificate matches pinned fingerprint {}", actual.short());
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Server-side verifier: any client certificate is acceptable as long as it
/// passes the subject-identity rules. Its fingerprint becomes the peer's
/// identity.
#[derive(Debug)]
pub struct PeerCertVerifier {
    algorithm: HashAlgorithm,
    cache:     Arc<FingerprintCache>,
    provider:  Arc<CryptoProvider>,
}

impl PeerCertVerifier {
    pub fn new(
        algorithm: HashAlgorithm,
        cache: Arc<FingerprintCache>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            algorithm,
            cache,
            provider,
        }
    }
}

impl ClientCertVerifier for PeerCertVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let fingerprint = Fingerprint::of_certificate(self.algorithm, end_entity);
        enforce_subject(&self.cache, &fingerprint, end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A transport that passed negotiation and the hello exchange.
pub struct Negotiated {
    pub stream:           TlsStream,
    pub peer:             Fingerprint,
    /// DER of the peer's end-entity certificate.
    pub peer_certificate: Vec<u8>,
    pub remote:           Option<SocketAddr>,
    pub direction:        Direction,
}

/// Runs both sides of connection negotiation for one tub identity.
pub struct Negotiator {
    identity:      TubIdentity,
    options:       TubOptions,
    cache:         Arc<FingerprintCache>,
    provider:      Arc<CryptoProvider>,
    server_config: Arc<ServerConfig>,
}

impl Negotiator {
    pub fn new(
        identity: TubIdentity,
        options: TubOptions,
        cache: Arc<FingerprintCache>,
    ) -> Result<Self, RpcError> {
        // Install default crypto provider for rustls if not already installed
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let verifier = Arc::new(PeerCertVerifier::new(
            options.hash_algorithm,
            cache.clone(),
            provider.clone(),
        ));
        let server_config = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(identity.cert_chain(), identity.private_key())?;

        Ok(Self {
            identity,
            options,
            cache,
            provider,
            server_config: Arc::new(server_config),
        })
    }

    pub fn options(&self) -> &TubOptions {
        &self.options
    }

    /// Fingerprint of our own certificate under the configured algorithm.
    pub fn local_fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint(self.options.hash_algorithm)
    }

    pub fn identity(&self) -> &TubIdentity {
        &self.identity
    }

    pub fn cache(&self) -> &Arc<FingerprintCache> {
        &self.cache
    }

    fn client_config(&self, expected: &Fingerprint) -> Result<Arc<ClientConfig>, RpcError> {
        let verifier = Arc::new(PinnedServerVerifier::new(
            expected.clone(),
            self.cache.clone(),
            self.provider.clone(),
        ));
        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(self.identity.cert_chain(), self.identity.private_key())?;
        Ok(Arc::new(config))
    }

    /// Negotiates an outbound connection to the peer named by `descriptor`.
    pub fn initiate(&self, socket: TcpStream, descriptor: &Descriptor) -> Result<Negotiated, RpcError> {
        let remote = socket.peer_addr().ok();
        socket.set_read_timeout(Some(self.options.handshake_timeout))?;

        let server_name = ServerName::try_from(descriptor.host().to_string())
            .or_else(|_| ServerName::try_from(FALLBACK_SERVER_NAME))
            .map_err(|e| RpcError::Config(format!("invalid server name: {e}")))?;
        let config = self.client_config(descriptor.fingerprint())?;
        let tls = ClientConnection::new(config, server_name)?;

        let stream = TlsStream::from_client(socket, tls).map_err(classify)?;
        tracing::info!("✓ TLS connection established with pinned peer {}", descriptor.fingerprint().short());

        let peer = descriptor.fingerprint().clone();
        self.exchange_hello(stream, peer, remote, Direction::Outbound)
    }

    /// Negotiates an inbound connection accepted by a listener.
    pub fn respond(&self, socket: TcpStream) -> Result<Negotiated, RpcError> {
        let remote = socket.peer_addr().ok();
        socket.set_read_timeout(Some(self.options.handshake_timeout))?;

        let tls = ServerConnection::new(self.server_config.clone())?;
        let stream = TlsStream::from_server(socket, tls).map_err(classify)?;

        let peer = stream
            .peer_certificate()
            .map(|cert| Fingerprint::of_certificate(self.options.hash_algorithm, cert))
            .ok_or_else(|| RpcError::IdentityMismatch("peer presented no certificate".into()))?;
        tracing::info!("✓ TLS connection established with client certificate {}", peer.short());

        self.exchange_hello(stream, peer, remote, Direction::Inbound)
    }

    fn exchange_hello(
        &self,
        mut stream: TlsStream,
        peer: Fingerprint,
        remote: Option<SocketAddr>,
        direction: Direction,
    ) -> Result<Negotiated, RpcError> {
        let max_len = self.options.max_frame_len;
        stream.send_message(
            &WireMessage::Hello {
                version: PROTOCOL_VERSION,
            },
            max_len,
        )?;
        match stream.recv_message(max_len)? {
            WireMessage::Hello { version } if version == PROTOCOL_VERSION => {}
            WireMessage::Hello { version } => {
                return Err(RpcError::Protocol(format!(
                    "peer speaks protocol version {version}, we speak {PROTOCOL_VERSION}"
                )));
            }
            other => {
                return Err(RpcError::Protocol(format!(
                    "expected hello, got {}",
                    other.kind()
                )));
            }
        }
        stream.set_read_timeout(None)?;

        let peer_certificate = stream
            .peer_certificate()
            .map(|cert| cert.to_vec())
            .ok_or_else(|| RpcError::IdentityMismatch("peer presented no certificate".into()))?;
        Ok(Negotiated {
            stream,
            peer,
            peer_certificate,
            remote,
            direction,
        })
    }
}

fn classify(err: RpcError) -> RpcError {
    match identity_rejection(&err) {
        Some(reason) => RpcError::IdentityMismatch(reason),
        None => err,
    }
}
