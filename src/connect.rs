//! CONNECT handling with Basic proxy authentication
//!
//! Validates credentials (when configured), records the tunnel target on
//! the connection context, establishes the relay leg, and hands the
//! upgraded socket to the bridge. Authentication failures answer 407
//! with a `Proxy-Authenticate` challenge and leave the connection open
//! for a retry.

use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ProxyAuthConfig;
use crate::connection::{ConnectionContext, TunnelTarget};
use crate::relay::{bridge, establish, HttpConnectAdapter, ProtocolAdapter};
use crate::tls::TlsContextFactory;
use crate::unification::PrefixedStream;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Proxy-Authorization header")]
    MissingHeader,

    #[error("malformed Proxy-Authorization header")]
    InvalidFormat,

    #[error("invalid proxy credentials")]
    BadCredentials,
}

/// Check Basic credentials against the configured pair. `None` config
/// means the proxy is open.
pub fn authorize(headers: &HeaderMap, auth: Option<&ProxyAuthConfig>) -> Result<(), AuthError> {
    let auth = match auth {
        None => return Ok(()),
        Some(auth) => auth,
    };

    let header = headers
        .get(PROXY_AUTHORIZATION)
        .ok_or(AuthError::MissingHeader)?;
    let value = header.to_str().map_err(|_| AuthError::InvalidFormat)?;

    let encoded = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))
        .ok_or(AuthError::InvalidFormat)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::InvalidFormat)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidFormat)?;

    let (username, password) = decoded.split_once(':').ok_or(AuthError::InvalidFormat)?;
    if username == auth.username && password == auth.password {
        Ok(())
    } else {
        Err(AuthError::BadCredentials)
    }
}

/// 407 challenge for a failed/absent proxy authentication.
pub fn challenge(realm: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    let value = format!("Basic realm=\"{}\"", realm);
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(PROXY_AUTHENTICATE, value);
    }
    response
}

/// Handle one CONNECT request: authenticate, establish the relay leg
/// toward `connect_addr`, and on success bridge the upgraded socket.
pub async fn handle_connect(
    mut req: Request<Incoming>,
    ctx: &mut ConnectionContext,
    auth: Option<&ProxyAuthConfig>,
    tls_factory: &TlsContextFactory,
    connect_addr: String,
    connect_timeout: Duration,
) -> Response<Bytes> {
    if let Err(e) = authorize(req.headers(), auth) {
        let realm = auth.map(|a| a.realm.as_str()).unwrap_or("tapwire");
        info!(peer = %ctx.peer_addr, error = %e, "[CONNECT] Proxy authentication failed");
        return challenge(realm);
    }

    let authority = match req.uri().authority() {
        Some(authority) => authority.as_str().to_string(),
        None => {
            warn!(peer = %ctx.peer_addr, uri = %req.uri(), "[CONNECT] Missing authority");
            return bad_request("CONNECT requires an authority");
        }
    };

    let target = match TunnelTarget::from_authority(&authority, 443) {
        Ok(target) => target,
        Err(e) => {
            warn!(peer = %ctx.peer_addr, authority = %authority, error = %e, "[CONNECT] Bad authority");
            return bad_request(&e);
        }
    };

    // The connection now carries tunneled traffic; the target hostname
    // becomes a SAN candidate for the interception certificate.
    ctx.proxying = true;
    ctx.tunnel_target = Some(target.clone());
    tls_factory.observe_hostname(target.bare_host());

    let adapter = HttpConnectAdapter;
    let secure = target.port == 443;

    let tunnel = match establish(&connect_addr, &target, secure, connect_timeout).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            warn!(peer = %ctx.peer_addr, target = %target, error = %e, "[CONNECT] Tunnel setup failed");
            return adapter.failure_response(&e);
        }
    };

    info!(peer = %ctx.peer_addr, target = %target, "[CONNECT] Tunnel established");

    let peer = ctx.peer_addr;
    let label = format!("{} -> {}", peer, target);
    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let client = TokioIo::new(upgraded);
                let server = PrefixedStream::new(tunnel.early_payload, tunnel.stream);
                bridge(client, server, &label).await;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "[CONNECT] Upgrade failed");
            }
        }
    });

    adapter.success_response()
}

fn bad_request(reason: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}
