use thiserror::Error;

/// Reasons a handshake is refused by the node attestor.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum AttestationError {
    /// The peer presented no certificate.
    #[error("peer presented no certificate")]
    NoPeerCert,

    /// The leaf certificate could not be parsed.
    #[error("malformed peer certificate: {0}")]
    MalformedCertificate(String),

    /// The leaf certificate has no usable common name.
    #[error("peer certificate has an empty common name")]
    EmptyCn,

    /// The common name does not start with the node-user prefix.
    #[error("common name {0:?} lacks the node prefix")]
    BadCnPrefix(String),

    /// The peer did not claim a node identity.
    #[error("peer did not send a node id")]
    MissingNodeId,

    /// The certificate identity differs from the claimed node id.
    #[error("certificate names node {certified:?} but peer claimed {claimed:?}")]
    IdentityMismatch {
        /// Identity derived from the certificate.
        certified: String,
        /// Identity claimed in the handshake.
        claimed: String,
    },
}

impl AttestationError {
    /// Stable label used in metrics and logs.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::NoPeerCert => "no_peer_cert",
            Self::MalformedCertificate(_) => "malformed_certificate",
            Self::EmptyCn => "empty_cn",
            Self::BadCnPrefix(_) => "bad_cn_prefix",
            Self::MissingNodeId => "missing_node_id",
            Self::IdentityMismatch { .. } => "identity_mismatch",
        }
    }
}
