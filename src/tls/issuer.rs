//! Certificate Issuance
//!
//! The proxy asks an external collaborator for a (key, certificate, chain)
//! identity whenever a new hostname must be impersonated. The collaborator
//! is modeled as the `CertificateIssuer` trait; `LocalCertificateIssuer`
//! is the built-in implementation, generating ECDSA P-256 leaves signed by
//! an in-memory CA.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rcgen::{Certificate, CertificateParams, DnType, IsCa, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;
use tracing::debug;

use crate::tls::KeyAlgorithm;

/// Issuance errors
#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("certificate generation failed: {0}")]
    CertGenerationFailed(String),

    #[error("issuer has no material for {0:?} keys")]
    UnsupportedAlgorithm(KeyAlgorithm),

    #[error("invalid hostname: {0}")]
    InvalidHostname(String),
}

/// A server identity: private key, leaf certificate and issuing chain,
/// bound to the hostnames it covers and to a key algorithm.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    /// PKCS#8 private key, DER.
    pub key_der: Vec<u8>,

    /// Leaf certificate, DER.
    pub certificate_der: Vec<u8>,

    /// Issuing chain (CA first), DER.
    pub chain_der: Vec<Vec<u8>>,

    /// Key algorithm of the leaf.
    pub key_algorithm: KeyAlgorithm,

    /// Hostnames/SANs this identity covers.
    pub hostnames: Vec<String>,
}

impl TlsIdentity {
    /// Full chain in rustls form: leaf first, then issuers.
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        let mut chain = vec![CertificateDer::from(self.certificate_der.clone())];
        chain.extend(self.chain_der.iter().cloned().map(CertificateDer::from));
        chain
    }

    /// Private key in rustls form.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    /// Whether this identity already covers the hostname.
    pub fn covers(&self, hostname: &str) -> bool {
        self.hostnames.iter().any(|h| h == hostname)
    }
}

/// External certificate-issuing collaborator.
pub trait CertificateIssuer: Send + Sync {
    /// Build (and persist, where the implementation persists anything) a
    /// private key and certificate covering the given hostnames.
    fn build_and_save(
        &self,
        hostnames: &[String],
        algorithm: KeyAlgorithm,
    ) -> Result<TlsIdentity, IssuerError>;

    /// True until the first identity has been issued.
    fn certificate_not_yet_created(&self) -> bool;

    /// CA certificate in PEM form, for clients that want to trust the proxy.
    fn ca_certificate_pem(&self) -> Option<String> {
        None
    }
}

/// In-memory CA issuing ECDSA P-256 leaf certificates.
///
/// RSA leaves are not generated here (ring cannot create RSA keys); an
/// issuer backed by loaded key material can serve them instead. Callers
/// fall back to the default EC identity when RSA is unavailable.
pub struct LocalCertificateIssuer {
    ca: Mutex<Certificate>,
    ca_der: Vec<u8>,
    ca_pem: String,
    issued_any: AtomicBool,
}

impl LocalCertificateIssuer {
    /// Generate a fresh CA.
    pub fn new() -> Result<Self, IssuerError> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "tapwire intercepting CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "tapwire");
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);

        let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| IssuerError::CertGenerationFailed(e.to_string()))?;
        params.key_pair = Some(key_pair);

        let ca = Certificate::from_params(params)
            .map_err(|e| IssuerError::CertGenerationFailed(e.to_string()))?;

        // Serialize once; ECDSA signatures are nondeterministic so repeated
        // serialization would yield byte-different (but equivalent) CAs.
        let ca_der = ca
            .serialize_der()
            .map_err(|e| IssuerError::CertGenerationFailed(e.to_string()))?;
        let ca_pem = ca
            .serialize_pem()
            .map_err(|e| IssuerError::CertGenerationFailed(e.to_string()))?;

        Ok(Self {
            ca: Mutex::new(ca),
            ca_der,
            ca_pem,
            issued_any: AtomicBool::new(false),
        })
    }

    /// Unique serial: timestamp in the high half, crypto RNG in the low.
    fn generate_serial_number(&self) -> u64 {
        use rand::Rng;
        let random_part: u32 = rand::thread_rng().gen();
        let timestamp_part = chrono::Utc::now().timestamp() as u32;
        ((timestamp_part as u64) << 32) | (random_part as u64)
    }
}

impl CertificateIssuer for LocalCertificateIssuer {
    fn build_and_save(
        &self,
        hostnames: &[String],
        algorithm: KeyAlgorithm,
    ) -> Result<TlsIdentity, IssuerError> {
        if algorithm == KeyAlgorithm::Rsa {
            return Err(IssuerError::UnsupportedAlgorithm(KeyAlgorithm::Rsa));
        }
        if hostnames.is_empty() {
            return Err(IssuerError::InvalidHostname("empty SAN list".to_string()));
        }

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, hostnames[0].clone());
        params.subject_alt_names = hostnames
            .iter()
            .map(|h| match h.parse::<IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(h.clone()),
            })
            .collect();

        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(90);
        params.serial_number = Some(self.generate_serial_number().into());

        let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| IssuerError::CertGenerationFailed(e.to_string()))?;
        params.key_pair = Some(key_pair);

        let leaf = Certificate::from_params(params)
            .map_err(|e| IssuerError::CertGenerationFailed(e.to_string()))?;

        let (leaf_der, key_der) = {
            let ca = self.ca.lock().expect("CA lock poisoned");
            let leaf_der = leaf
                .serialize_der_with_signer(&ca)
                .map_err(|e| IssuerError::CertGenerationFailed(e.to_string()))?;
            (leaf_der, leaf.serialize_private_key_der())
        };

        self.issued_any.store(true, Ordering::SeqCst);
        debug!(hostnames = ?hostnames, "Issued leaf certificate");

        Ok(TlsIdentity {
            key_der,
            certificate_der: leaf_der,
            chain_der: vec![self.ca_der.clone()],
            key_algorithm: KeyAlgorithm::Ec,
            hostnames: hostnames.to_vec(),
        })
    }

    fn certificate_not_yet_created(&self) -> bool {
        !self.issued_any.load(Ordering::SeqCst)
    }

    fn ca_certificate_pem(&self) -> Option<String> {
        Some(self.ca_pem.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_ec_identity_covering_requested_hostnames() {
        let issuer = LocalCertificateIssuer::new().unwrap();
        assert!(issuer.certificate_not_yet_created());

        let identity = issuer
            .build_and_save(
                &["example.com".to_string(), "alt.example.com".to_string()],
                KeyAlgorithm::Ec,
            )
            .unwrap();

        assert_eq!(identity.key_algorithm, KeyAlgorithm::Ec);
        assert!(identity.covers("example.com"));
        assert!(identity.covers("alt.example.com"));
        assert!(!identity.covers("other.example.com"));
        assert_eq!(identity.cert_chain().len(), 2);
        assert!(!issuer.certificate_not_yet_created());
    }

    #[test]
    fn rsa_issuance_is_reported_unsupported() {
        let issuer = LocalCertificateIssuer::new().unwrap();
        let err = issuer
            .build_and_save(&["example.com".to_string()], KeyAlgorithm::Rsa)
            .unwrap_err();
        assert!(matches!(err, IssuerError::UnsupportedAlgorithm(_)));
        // A failed issuance does not count as created material.
        assert!(issuer.certificate_not_yet_created());
    }

    #[test]
    fn ip_hostnames_become_ip_sans() {
        let issuer = LocalCertificateIssuer::new().unwrap();
        let identity = issuer
            .build_and_save(&["192.168.1.50".to_string()], KeyAlgorithm::Ec)
            .unwrap();
        assert!(identity.covers("192.168.1.50"));
    }

    #[test]
    fn empty_san_list_is_rejected() {
        let issuer = LocalCertificateIssuer::new().unwrap();
        assert!(issuer.build_and_save(&[], KeyAlgorithm::Ec).is_err());
    }

    #[test]
    fn ca_pem_is_exposed() {
        let issuer = LocalCertificateIssuer::new().unwrap();
        let pem = issuer.ca_certificate_pem().unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }
}
