//! TLS interception core
//!
//! - `client_hello` — raw ClientHello inspection (SNI, key-algorithm preference)
//! - `issuer` — certificate-issuing collaborator interface + local CA
//! - `context_factory` — dynamic server/client rustls config cache

pub mod client_hello;
pub mod context_factory;
pub mod issuer;

pub use client_hello::{determine_preference, extract_sni, KeyAlgorithmPreference};
pub use context_factory::{AlpnProtocol, TlsContextFactory, TlsSetupError};
pub use issuer::{CertificateIssuer, IssuerError, LocalCertificateIssuer, TlsIdentity};

/// Key algorithm of a server identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
}

/// TLS protocol versions offered by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    Tls12And13,
    /// TLS 1.3 only
    Tls13Only,
}

impl Default for TlsVersion {
    fn default() -> Self {
        Self::Tls12And13
    }
}

impl TlsVersion {
    pub(crate) fn supported_versions(self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        match self {
            Self::Tls12And13 => vec![&rustls::version::TLS12, &rustls::version::TLS13],
            Self::Tls13Only => vec![&rustls::version::TLS13],
        }
    }
}
