//! Throwaway certificate authority for tests and local development.
//!
//! Mints a CA, a `localhost` server certificate and node client certificates
//! whose common name follows the `system:node:<id>` convention.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Common name prefix carried by node certificates.
pub const NODE_CN_PREFIX: &str = "system:node:";

/// A leaf certificate chain and its key, as DER.
pub struct IssuedIdentity {
    /// Leaf certificate followed by the CA certificate.
    pub chain: Vec<CertificateDer<'static>>,

    /// PKCS#8 private key.
    pub key: PrivateKeyDer<'static>,

    /// PEM form of the leaf certificate.
    pub cert_pem: String,

    /// PEM form of the private key.
    pub key_pem: String,
}

/// PEM files written by [`TestPki::write_pem_files`].
#[derive(Clone, Debug)]
pub struct PemPaths {
    /// CA certificate.
    pub ca_cert: PathBuf,

    /// Server certificate.
    pub server_cert: PathBuf,

    /// Server private key.
    pub server_key: PathBuf,
}

/// In-memory certificate authority.
pub struct TestPki {
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl TestPki {
    /// Generate a fresh CA.
    ///
    /// # Panics
    ///
    /// Panics if key generation fails.
    #[must_use]
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().expect("generate ca key");

        let mut params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, "edgehub test ca");
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_cert = params.self_signed(&ca_key).expect("self-sign ca");

        Self { ca_cert, ca_key }
    }

    /// DER of the CA certificate, to be used as the trust root.
    #[must_use]
    pub fn ca_certificate(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Server certificate valid for `localhost` and `127.0.0.1`.
    ///
    /// # Panics
    ///
    /// Panics if signing fails.
    #[must_use]
    pub fn server_identity(&self) -> IssuedIdentity {
        let mut params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .expect("server params");
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, "edgehub");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        self.issue(params)
    }

    /// Client certificate for node `node_id` (CN `system:node:<node_id>`).
    #[must_use]
    pub fn node_identity(&self, node_id: &str) -> IssuedIdentity {
        self.client_identity(Some(&format!("{NODE_CN_PREFIX}{node_id}")))
    }

    /// Client certificate with an arbitrary common name, or none at all.
    ///
    /// # Panics
    ///
    /// Panics if signing fails.
    #[must_use]
    pub fn client_identity(&self, common_name: Option<&str>) -> IssuedIdentity {
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("client params");
        params.distinguished_name = DistinguishedName::new();
        if let Some(cn) = common_name {
            params.distinguished_name.push(DnType::CommonName, cn);
        }
        params
            .distinguished_name
            .push(DnType::OrganizationName, "system:nodes");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        self.issue(params)
    }

    /// Write the CA certificate and a fresh server identity as PEM files.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    pub fn write_pem_files(&self, dir: &Path) -> io::Result<PemPaths> {
        fs::create_dir_all(dir)?;
        let server = self.server_identity();

        let paths = PemPaths {
            ca_cert: dir.join("ca.pem"),
            server_cert: dir.join("server.pem"),
            server_key: dir.join("server-key.pem"),
        };

        fs::write(&paths.ca_cert, self.ca_cert.pem())?;
        fs::write(&paths.server_cert, server.cert_pem)?;
        fs::write(&paths.server_key, server.key_pem)?;

        Ok(paths)
    }

    fn issue(&self, params: CertificateParams) -> IssuedIdentity {
        let key = KeyPair::generate().expect("generate leaf key");
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .expect("sign leaf");

        IssuedIdentity {
            chain: vec![cert.der().clone(), self.ca_certificate()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }
}
