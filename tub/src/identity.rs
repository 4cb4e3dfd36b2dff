use std::{fs, io::BufReader};

use anyhow::{anyhow, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use sturdy_common::{
    config::TubCertPath,
    fingerprint::{Fingerprint, HashAlgorithm},
};

/// The certificate and private key a tub presents during negotiation.
pub struct TubIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key:        PrivateKeyDer<'static>,
}

impl TubIdentity {
    /// Loads the identity from the PEM files named by `paths`.
    pub fn load(paths: &TubCertPath) -> Result<Self> {
        tracing::info!("Loading tub identity:");
        tracing::info!("  - Certificate: {:?}", paths.cert_path);
        tracing::info!("  - Key: {:?}", paths.key_path);

        let cert_pem = fs::read(&paths.cert_path)
            .with_context(|| format!("Failed to read certificate from {:?}", paths.cert_path))?;
        let key_pem = fs::read(&paths.key_path)
            .with_context(|| format!("Failed to read private key from {:?}", paths.key_path))?;

        Self::from_pem(&cert_pem, &key_pem)
            .with_context(|| format!("Invalid identity in {:?}", paths.cert_path))
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert_chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificate")?;
        if cert_chain.is_empty() {
            return Err(anyhow!("No certificate found"));
        }

        let key = private_key(&mut BufReader::new(key_pem))
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow!("No private key found"))?;

        Ok(Self { cert_chain, key })
    }

    /// Our end-entity certificate.
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert_chain[0]
    }

    /// The fingerprint peers must pin to reach this tub.
    pub fn fingerprint(&self, algorithm: HashAlgorithm) -> Fingerprint {
        Fingerprint::of_certificate(algorithm, self.certificate())
    }

    pub(crate) fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        self.cert_chain.clone()
    }

    pub(crate) fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

impl Clone for TubIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key:        self.key.clone_key(),
        }
    }
}

impl std::fmt::Debug for TubIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TubIdentity")
            .field("fingerprint", &self.fingerprint(HashAlgorithm::default()))
            .finish_non_exhaustive()
    }
}
