//! Node attestation for edge connections.
//!
//! A node proves its identity with a client certificate whose common name is
//! `system:node:<node id>`. The attestor checks that name against the node id
//! the peer claims in its handshake.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::AttestationError;

use std::fmt::{self, Display};

use edgehub_transport::PeerIdentity;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use tracing::debug;
use x509_parser::prelude::*;

/// Common name prefix identifying node client certificates.
pub const NODE_CN_PREFIX: &str = "system:node:";

/// Opaque identity of an edge node.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap a node name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Node name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Verifies that a peer is the node it claims to be.
///
/// When constructed with attestation disabled the claimed node id is accepted
/// without looking at the certificate. That mode exists for development
/// clusters and offers no authentication.
#[derive(Clone, Copy, Debug)]
pub struct NodeAttestor {
    enabled: bool,
}

impl NodeAttestor {
    /// Create an attestor. `enabled = false` trusts claimed identities.
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Whether certificate checks are performed.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Attest a peer from its handshake identity.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub fn attest(&self, peer: &PeerIdentity) -> Result<NodeId, AttestationError> {
        self.attest_chain(&peer.certificates, peer.claimed_node_id())
    }

    /// Attest a certificate chain (leaf first) against a claimed node id.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub fn attest_chain(
        &self,
        chain: &[CertificateDer<'_>],
        claimed: Option<&str>,
    ) -> Result<NodeId, AttestationError> {
        if !self.enabled {
            debug!("node attestation disabled, trusting claimed identity");
            return claimed
                .filter(|name| !name.is_empty())
                .map(NodeId::from)
                .ok_or(AttestationError::MissingNodeId);
        }

        let leaf = chain.first().ok_or(AttestationError::NoPeerCert)?;
        let certified = node_name_from_certificate(leaf)?;

        let claimed = claimed
            .filter(|name| !name.is_empty())
            .ok_or(AttestationError::MissingNodeId)?;

        if certified != claimed {
            return Err(AttestationError::IdentityMismatch {
                certified,
                claimed: claimed.to_string(),
            });
        }

        Ok(NodeId(certified))
    }
}

/// Derive the node name from a node certificate's common name.
///
/// # Errors
///
/// Fails if the certificate cannot be parsed, has no common name, or the
/// common name does not carry the node prefix followed by a name.
pub fn node_name_from_certificate(der: &CertificateDer<'_>) -> Result<String, AttestationError> {
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| AttestationError::MalformedCertificate(e.to_string()))?;

    let common_name = match cert.subject().iter_common_name().next() {
        Some(attr) => attr
            .as_str()
            .map_err(|e| AttestationError::MalformedCertificate(e.to_string()))?,
        None => return Err(AttestationError::EmptyCn),
    };

    if common_name.is_empty() {
        return Err(AttestationError::EmptyCn);
    }

    match common_name.strip_prefix(NODE_CN_PREFIX) {
        Some("") => Err(AttestationError::EmptyCn),
        Some(name) => Ok(name.to_string()),
        None => Err(AttestationError::BadCnPrefix(common_name.to_string())),
    }
}
