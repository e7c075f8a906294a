//! Tapwire - Intercepting TLS-Capable Proxy Engine
//!
//! Tapwire is an interactive intercepting proxy for testing: it accepts
//! TLS, HTTP/2 and plaintext HTTP on a single port, decrypts tunneled
//! traffic with on-the-fly certificates, answers requests from a list of
//! expectations, and forwards everything else upstream.
//!
//! ## Features
//!
//! - **Protocol/port unification**: TLS, HTTP/2 preface and plaintext
//!   HTTP detected from the first bytes of every connection
//! - **CONNECT tunnels**: Basic proxy authentication, loop-back tunnel
//!   legs so decrypted traffic reaches dispatch
//! - **Dynamic TLS interception**: per-hostname certificate issuance,
//!   ALPN negotiation, ClientHello key-algorithm analysis
//! - **Expectation dispatch**: first-match request matchers with
//!   respond / forward / close actions
//! - **Loop prevention**: instance-unique forwarded header plus
//!   per-source-port hop counting
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tapwire::{Config, ProxyServer};
//! use tapwire::dispatch::{Expectation, RequestMatcher, ResponseTemplate};
//! use http::StatusCode;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = ProxyServer::builder(Config::from_env()?)
//!         .with_expectation(Expectation::respond(
//!             RequestMatcher {
//!                 path: Some("/health".to_string()),
//!                 ..Default::default()
//!             },
//!             ResponseTemplate::new(StatusCode::OK).with_body("ok"),
//!         ))
//!         .bind()
//!         .await?;
//!     server.run().await
//! }
//! ```

// Core engine modules
pub mod config;
pub mod connection;
pub mod server;
pub mod unification;

// Tunneling
pub mod connect;
pub mod relay;

// TLS interception
pub mod tls;

// Dispatch and forwarding
pub mod dispatch;
pub mod forward;

// Observation seam
pub mod observe;

/// Configuration types
pub use config::{Config, ProxyAuthConfig, UpstreamProxyChain};

/// Connection tracking
pub use connection::{ConnectionContext, ConnectionRegistry, ConnectionStatus, TunnelTarget};

/// Dispatch engine
pub use dispatch::{
    Action, DispatchOutcome, Dispatcher, ExecutionMode, Expectation, RequestMatcher,
    ResponseTemplate,
};

/// TLS interception
pub use tls::{
    CertificateIssuer, KeyAlgorithm, KeyAlgorithmPreference, LocalCertificateIssuer,
    TlsContextFactory, TlsIdentity, TlsVersion,
};

/// Traffic observation
pub use observe::{NullObserver, TrafficObserver};

/// Server entry points
pub use server::{ProxyServer, ProxyServerBuilder, ProxyState};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "tapwire");
    }
}
