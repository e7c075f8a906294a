//! Dynamic TLS Context Factory
//!
//! Produces the rustls configs used on both legs of an interception:
//!
//! - **Server configs** (proxy ← client, presenting a generated identity):
//!   one current `(ServerConfig, TlsIdentity)` pair per key algorithm,
//!   recomputed only when no pair exists yet or a rebuild was requested
//!   (a new SNI hostname was observed and dynamic SAN updates are on).
//! - **Client configs** (proxy → upstream): one per outbound application
//!   protocol, built once and reused. Upstream trust is an accept-all
//!   verifier: this proxy is a man-in-the-middle test tool, not a
//!   trust-verifying client.
//!
//! Any failure while building a config is fatal for that handshake
//! attempt and surfaced as `TlsSetupError`; it is not retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::tls::client_hello::KeyAlgorithmPreference;
use crate::tls::issuer::{CertificateIssuer, IssuerError, TlsIdentity};
use crate::tls::{KeyAlgorithm, TlsVersion};

/// TLS-setup errors: fatal for the handshake attempt that hit them.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("certificate issuance failed: {0}")]
    Issuance(#[from] IssuerError),

    #[error("TLS configuration rejected material: {0}")]
    Config(String),
}

/// Outbound application protocol, used to key the client-config cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlpnProtocol {
    Http1,
    H2,
}

impl AlpnProtocol {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Http1 => b"http/1.1",
            Self::H2 => b"h2",
        }
    }

    pub fn from_negotiated(alpn: Option<&[u8]>) -> Self {
        match alpn {
            Some(b"h2") => Self::H2,
            _ => Self::Http1,
        }
    }
}

struct ServerState {
    /// Current (config, identity) pair per key algorithm.
    current: HashMap<KeyAlgorithm, (Arc<ServerConfig>, Arc<TlsIdentity>)>,

    /// Accumulated SAN hostnames, in observation order.
    hostnames: Vec<String>,

    /// Set when a new SNI was observed and dynamic SAN updates are on;
    /// cleared immediately after the next recomputation.
    rebuild: bool,
}

/// Factory for server and client TLS contexts, backed by a pluggable
/// certificate issuer.
pub struct TlsContextFactory {
    issuer: Arc<dyn CertificateIssuer>,
    tls_version: TlsVersion,
    dynamic_san_update: bool,
    server: Mutex<ServerState>,
    clients: Mutex<HashMap<AlpnProtocol, Arc<ClientConfig>>>,
    build_count: AtomicUsize,
}

impl TlsContextFactory {
    pub fn new(
        issuer: Arc<dyn CertificateIssuer>,
        tls_version: TlsVersion,
        dynamic_san_update: bool,
    ) -> Self {
        Self {
            issuer,
            tls_version,
            dynamic_san_update,
            server: Mutex::new(ServerState {
                current: HashMap::new(),
                hostnames: vec!["localhost".to_string()],
                rebuild: false,
            }),
            clients: Mutex::new(HashMap::new()),
            build_count: AtomicUsize::new(0),
        }
    }

    /// Record a hostname seen via SNI or a CONNECT target. When the
    /// hostname is new and dynamic SAN updates are enabled, the next
    /// `server_config` call rebuilds the current contexts with the
    /// extended SAN list.
    pub fn observe_hostname(&self, hostname: &str) {
        if hostname.is_empty() {
            return;
        }
        let mut state = self.server.lock().expect("server TLS state lock poisoned");
        if state.hostnames.iter().any(|h| h == hostname) {
            return;
        }
        state.hostnames.push(hostname.to_string());
        if self.dynamic_san_update {
            debug!(hostname, "New SAN observed, scheduling server context rebuild");
            state.rebuild = true;
        }
    }

    /// Server-side preference derived from the material the issuer can
    /// produce. The local issuer is EC-only; issuers with RSA material
    /// shift this toward MIXED.
    pub fn server_preference(&self) -> KeyAlgorithmPreference {
        // The factory learns what the issuer supports lazily; before any
        // issuance it can only assume EC (the algorithm the built-in CA
        // speaks). An issuer with both families would be MIXED.
        KeyAlgorithmPreference::Ecc
    }

    /// Get the server config and identity for a handshake, honoring the
    /// effective key-algorithm preference. The check-then-build sequence
    /// runs under one lock so concurrent handshakes cannot race a rebuild.
    pub fn server_config(
        &self,
        preference: KeyAlgorithmPreference,
    ) -> Result<(Arc<ServerConfig>, Arc<TlsIdentity>), TlsSetupError> {
        let mut state = self.server.lock().expect("server TLS state lock poisoned");

        if state.rebuild {
            debug!("Rebuild flag set, discarding cached server contexts");
            state.current.clear();
            state.rebuild = false;
        }

        let algorithm = if preference == KeyAlgorithmPreference::Rsa {
            KeyAlgorithm::Rsa
        } else {
            KeyAlgorithm::Ec
        };

        if let Some((config, identity)) = state.current.get(&algorithm) {
            return Ok((Arc::clone(config), Arc::clone(identity)));
        }

        match self.build_server_pair(&state.hostnames, algorithm) {
            Ok((config, identity)) => {
                state
                    .current
                    .insert(algorithm, (Arc::clone(&config), Arc::clone(&identity)));
                Ok((config, identity))
            }
            Err(TlsSetupError::Issuance(IssuerError::UnsupportedAlgorithm(_)))
                if algorithm == KeyAlgorithm::Rsa =>
            {
                // No RSA material: fall back to the default EC identity.
                warn!("Issuer has no RSA material, falling back to EC identity");
                if let Some((config, identity)) = state.current.get(&KeyAlgorithm::Ec) {
                    return Ok((Arc::clone(config), Arc::clone(identity)));
                }
                let (config, identity) =
                    self.build_server_pair(&state.hostnames, KeyAlgorithm::Ec)?;
                state
                    .current
                    .insert(KeyAlgorithm::Ec, (Arc::clone(&config), Arc::clone(&identity)));
                Ok((config, identity))
            }
            Err(e) => Err(e),
        }
    }

    fn build_server_pair(
        &self,
        hostnames: &[String],
        algorithm: KeyAlgorithm,
    ) -> Result<(Arc<ServerConfig>, Arc<TlsIdentity>), TlsSetupError> {
        let identity = self.issuer.build_and_save(hostnames, algorithm)?;

        let versions = self.tls_version.supported_versions();
        let mut config = ServerConfig::builder_with_protocol_versions(&versions)
            .with_no_client_auth()
            .with_single_cert(identity.cert_chain(), identity.private_key())
            .map_err(|e| TlsSetupError::Config(e.to_string()))?;

        // rustls' default suite set already satisfies the HTTP/2 cipher
        // blacklist, so advertising h2 alongside http/1.1 is safe.
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        self.build_count.fetch_add(1, Ordering::SeqCst);
        info!(
            sans = identity.hostnames.len(),
            algorithm = ?algorithm,
            "Built server TLS context"
        );

        Ok((Arc::new(config), Arc::new(identity)))
    }

    /// Get the client config for an outbound leg, keyed by the protocol
    /// to advertise. Built once per protocol and reused.
    pub fn client_config(&self, protocol: AlpnProtocol) -> Arc<ClientConfig> {
        let mut clients = self.clients.lock().expect("client TLS cache lock poisoned");
        if let Some(config) = clients.get(&protocol) {
            return Arc::clone(config);
        }

        let versions = self.tls_version.supported_versions();
        let mut config = ClientConfig::builder_with_protocol_versions(&versions)
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier::new()))
            .with_no_client_auth();
        config.alpn_protocols = match protocol {
            AlpnProtocol::H2 => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            AlpnProtocol::Http1 => vec![b"http/1.1".to_vec()],
        };

        let config = Arc::new(config);
        clients.insert(protocol, Arc::clone(&config));
        debug!(protocol = ?protocol, "Built client TLS context");
        config
    }

    /// Number of server context builds so far.
    pub fn server_context_builds(&self) -> usize {
        self.build_count.load(Ordering::SeqCst)
    }
}

/// Accept-all server certificate verifier for the upstream leg.
#[derive(Debug)]
struct AcceptAllVerifier {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAllVerifier {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
