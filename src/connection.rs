//! Connection registry and per-connection context
//!
//! The registry tracks every open socket and its lifecycle status; it is
//! one of the few pieces of state shared across connection tasks. The
//! `ConnectionContext` carries everything that used to be ad-hoc
//! per-channel attributes (proxying flag, tunnel target, hop count,
//! negotiated ALPN) as an explicit struct owned by the connection task.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::RwLock;

/// Lifecycle status of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    OpenTcp,
    TlsEstablished,
    Closed,
}

/// Shared registry of open connections, keyed by peer address.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<SocketAddr, ConnectionStatus>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly accepted connection.
    pub fn register(&self, peer: SocketAddr) {
        self.inner
            .write()
            .expect("connection registry lock poisoned")
            .insert(peer, ConnectionStatus::OpenTcp);
    }

    /// Update the status of a tracked connection. Unknown peers are
    /// ignored (the connection may already have been unregistered).
    pub fn set_status(&self, peer: SocketAddr, status: ConnectionStatus) {
        let mut map = self
            .inner
            .write()
            .expect("connection registry lock poisoned");
        if let Some(entry) = map.get_mut(&peer) {
            *entry = status;
        }
    }

    /// Remove a connection on close/unregister.
    pub fn remove(&self, peer: SocketAddr) {
        self.inner
            .write()
            .expect("connection registry lock poisoned")
            .remove(&peer);
    }

    pub fn status(&self, peer: SocketAddr) -> Option<ConnectionStatus> {
        self.inner
            .read()
            .expect("connection registry lock poisoned")
            .get(&peer)
            .copied()
    }

    pub fn open_count(&self) -> usize {
        self.inner
            .read()
            .expect("connection registry lock poisoned")
            .len()
    }
}

/// A CONNECT/tunnel target: host plus port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

impl TunnelTarget {
    /// Parse `host[:port]`, defaulting the port when absent. Splits on
    /// the last colon so bracketed IPv6 authorities work.
    pub fn from_authority(authority: &str, default_port: u16) -> Result<Self, String> {
        if authority.is_empty() {
            return Err("host cannot be empty".to_string());
        }

        let (host, port) = match authority.rsplit_once(':') {
            // A colon inside an unbracketed IPv6 literal is not a port
            // separator.
            Some((host, port_str)) if !port_str.contains(']') => {
                if host.is_empty() {
                    return Err("host cannot be empty".to_string());
                }
                if host.contains(':') && !host.starts_with('[') {
                    (authority, default_port)
                } else {
                    let port: u16 = port_str.parse().map_err(|_| {
                        format!("invalid port '{}': must be between 1 and 65535", port_str)
                    })?;
                    if port == 0 {
                        return Err("invalid port: must be between 1 and 65535".to_string());
                    }
                    (host, port)
                }
            }
            _ => (authority, default_port),
        };

        if host.is_empty() {
            return Err("host cannot be empty".to_string());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Hostname with any IPv6 brackets stripped, for SNI/SAN use.
    pub fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-connection transient state. Owned by the connection task; created
/// on accept and destroyed with the connection, never shared across
/// connections.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Remote peer of the inbound socket.
    pub peer_addr: SocketAddr,

    /// Local address the connection was accepted on (the listener).
    pub local_addr: SocketAddr,

    /// Set once the connection carries tunneled traffic.
    pub proxying: bool,

    /// SSL is expected on the downstream (client) leg.
    pub ssl_expected_downstream: bool,

    /// SSL is expected on the upstream (target) leg.
    pub ssl_expected_upstream: bool,

    /// Whether TLS interception actually happened on this leg.
    pub tls_intercepted: bool,

    /// Target recorded from a CONNECT authority or tunnel marker.
    pub tunnel_target: Option<TunnelTarget>,

    /// How many times traffic from this peer's source port has looped
    /// through this instance.
    pub hop_count: u32,

    /// ALPN protocol negotiated on the downstream leg, if any.
    pub negotiated_alpn: Option<Vec<u8>>,
}

impl ConnectionContext {
    pub fn new(peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            local_addr,
            proxying: false,
            ssl_expected_downstream: false,
            ssl_expected_upstream: false,
            tls_intercepted: false,
            tunnel_target: None,
            hop_count: 0,
            negotiated_alpn: None,
        }
    }
}
