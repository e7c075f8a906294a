use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

use crate::connection::TunnelTarget;
use crate::tls::TlsVersion;

/// Basic credentials required on CONNECT requests.
#[derive(Debug, Clone)]
pub struct ProxyAuthConfig {
    pub username: String,
    pub password: String,
    pub realm: String,
}

/// Optional upstream proxy the forwarder chains through.
#[derive(Debug, Clone)]
pub struct UpstreamProxyChain {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Server configuration
    pub host: String,
    pub port: u16,

    // Timeouts
    pub connect_timeout: Duration,
    pub max_future_timeout: Duration,

    // TLS
    pub tls_version: TlsVersion,
    pub dynamic_san_update: bool,

    // CONNECT authentication (None = no auth required)
    pub proxy_auth: Option<ProxyAuthConfig>,

    // Loop prevention
    pub max_loop_hops: u32,
    pub hop_tracker_capacity: usize,

    // Upstream proxy chain
    pub upstream_proxy: Option<UpstreamProxyChain>,

    // Reverse mode: fixed remote target instead of loopback tunnels
    pub remote_target: Option<TunnelTarget>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1080,
            connect_timeout: Duration::from_secs(10),
            max_future_timeout: Duration::from_secs(60),
            tls_version: TlsVersion::default(),
            dynamic_san_update: true,
            proxy_auth: None,
            max_loop_hops: 4,
            hop_tracker_capacity: 4096,
            upstream_proxy: None,
            remote_target: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let host = env::var("TAPWIRE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("TAPWIRE_PORT")
            .unwrap_or_else(|_| "1080".to_string())
            .parse()
            .context("Invalid TAPWIRE_PORT")?;

        let connect_timeout_seconds: u64 = env::var("CONNECT_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("Invalid CONNECT_TIMEOUT_SECONDS")?;
        let max_future_timeout_seconds: u64 = env::var("MAX_FUTURE_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .context("Invalid MAX_FUTURE_TIMEOUT_SECONDS")?;

        let tls_protocols = env::var("TLS_PROTOCOLS").unwrap_or_else(|_| "1.2,1.3".to_string());
        let tls_version = match tls_protocols.as_str() {
            "1.2,1.3" | "1.3,1.2" => TlsVersion::Tls12And13,
            "1.3" => TlsVersion::Tls13Only,
            other => {
                return Err(anyhow::anyhow!(
                    "Invalid TLS_PROTOCOLS '{}'. Must be '1.2,1.3' or '1.3'",
                    other
                ));
            }
        };

        let dynamic_san_update = env::var("DYNAMIC_SAN_UPDATE")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .context("Invalid DYNAMIC_SAN_UPDATE")?;

        // Auth is enabled only when both credentials are present.
        let proxy_auth = match (
            env::var("PROXY_AUTH_USERNAME").ok(),
            env::var("PROXY_AUTH_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => {
                if username.is_empty() {
                    return Err(anyhow::anyhow!("PROXY_AUTH_USERNAME cannot be empty"));
                }
                Some(ProxyAuthConfig {
                    username,
                    password,
                    realm: env::var("PROXY_AUTH_REALM")
                        .unwrap_or_else(|_| "tapwire".to_string()),
                })
            }
            (None, None) => None,
            _ => {
                return Err(anyhow::anyhow!(
                    "PROXY_AUTH_USERNAME and PROXY_AUTH_PASSWORD must be set together"
                ));
            }
        };

        let max_loop_hops = env::var("MAX_LOOP_HOPS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .context("Invalid MAX_LOOP_HOPS")?;
        let hop_tracker_capacity = env::var("HOP_TRACKER_CAPACITY")
            .unwrap_or_else(|_| "4096".to_string())
            .parse()
            .context("Invalid HOP_TRACKER_CAPACITY")?;

        let upstream_proxy = match env::var("UPSTREAM_PROXY_HOST").ok() {
            Some(host) if !host.is_empty() => {
                let port = env::var("UPSTREAM_PROXY_PORT")
                    .unwrap_or_else(|_| "3128".to_string())
                    .parse()
                    .context("Invalid UPSTREAM_PROXY_PORT")?;
                Some(UpstreamProxyChain {
                    host,
                    port,
                    username: env::var("UPSTREAM_PROXY_USER").ok(),
                    password: env::var("UPSTREAM_PROXY_PASS").ok(),
                })
            }
            _ => None,
        };

        let remote_target = match env::var("REMOTE_TARGET").ok() {
            Some(authority) if !authority.is_empty() => Some(
                TunnelTarget::from_authority(&authority, 80)
                    .map_err(|e| anyhow::anyhow!("Invalid REMOTE_TARGET: {}", e))?,
            ),
            _ => None,
        };

        Ok(Config {
            host,
            port,
            connect_timeout: Duration::from_secs(connect_timeout_seconds),
            max_future_timeout: Duration::from_secs(max_future_timeout_seconds),
            tls_version,
            dynamic_san_update,
            proxy_auth,
            max_loop_hops,
            hop_tracker_capacity,
            upstream_proxy,
            remote_target,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
