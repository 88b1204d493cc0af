//! TLS configuration shared by the secure adapters.
//!
//! Both listeners demand a client certificate chained to the configured trust
//! roots. The verified chain is what the node attestor later inspects.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};

use crate::TransportError;

/// Protocol versions accepted by TLS-over-TCP listeners.
pub static TCP_TLS_VERSIONS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Protocol versions accepted by QUIC (TLS 1.3 only).
pub static QUIC_TLS_VERSIONS: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// A certificate chain together with its private key.
pub struct TlsIdentity {
    /// Leaf first.
    pub chain: Vec<CertificateDer<'static>>,

    /// Key matching the leaf certificate.
    pub key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Build an identity from DER material.
    #[must_use]
    pub const fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { chain, key }
    }

    /// Load an identity from PEM encoded certificate and key files.
    ///
    /// # Errors
    ///
    /// Returns an error if either file is unreadable or holds no usable item.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TransportError> {
        Ok(Self {
            chain: load_certificates(cert_path)?,
            key: load_private_key(key_path)?,
        })
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Read every certificate in a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no certificate.
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Certificate(format!("{}: {e}", path.display())))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate(format!("{}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(TransportError::Certificate(format!(
            "{}: no certificates found",
            path.display()
        )));
    }

    Ok(certs)
}

/// Read the first private key in a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Certificate(format!("{}: {e}", path.display())))?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TransportError::Certificate(format!("{}: {e}", path.display())))?
        .ok_or_else(|| TransportError::Certificate(format!("{}: no private key found", path.display())))
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn root_store(trust_roots: &[CertificateDer<'static>]) -> Result<RootCertStore, TransportError> {
    let mut store = RootCertStore::empty();
    for root in trust_roots {
        store.add(root.clone())?;
    }
    Ok(store)
}

/// Server configuration that requires and verifies client certificates.
///
/// # Errors
///
/// Returns an error if the trust roots or server identity are unusable.
pub fn server_config(
    identity: &TlsIdentity,
    trust_roots: &[CertificateDer<'static>],
    versions: &[&'static SupportedProtocolVersion],
    alpn: &[&[u8]],
) -> Result<ServerConfig, TransportError> {
    let provider = crypto_provider();

    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(trust_roots)?), provider.clone())
            .build()
            .map_err(|e| TransportError::Tls(e.to_string()))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.chain.clone(), identity.key.clone_key())?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(config)
}

/// Client configuration presenting `identity` and trusting `trust_roots`.
///
/// # Errors
///
/// Returns an error if the trust roots or client identity are unusable.
pub fn client_config(
    identity: &TlsIdentity,
    trust_roots: &[CertificateDer<'static>],
    versions: &[&'static SupportedProtocolVersion],
    alpn: &[&[u8]],
) -> Result<ClientConfig, TransportError> {
    let mut config = ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(versions)?
        .with_root_certificates(root_store(trust_roots)?)
        .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(config)
}
