//! Upstream Forwarding Client
//!
//! Sends requests the dispatch engine could not answer locally to the
//! real upstream (optionally through a configured upstream proxy chain),
//! and keeps the per-source-port hop accounting used for proxy-loop
//! detection. Upstream certificates are deliberately not verified: the
//! proxy is a man-in-the-middle test tool.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use lru::LruCache;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::UpstreamProxyChain;

/// Upstream forwarding failures, categorized for distinct logging.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream connection refused: {0}")]
    Refused(String),

    #[error("upstream connection closed: {0}")]
    Closed(String),

    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("upstream error: {0}")]
    Upstream(String),
}

impl ForwardError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        let detail = e.to_string();
        if e.is_timeout() {
            return Self::Timeout;
        }
        // reqwest flattens rustls failures into the error chain; sniff
        // the rendered chain to keep the categories distinct.
        let mut chain = detail.clone();
        let mut source = std::error::Error::source(&e);
        while let Some(s) = source {
            chain.push_str(&s.to_string());
            source = s.source();
        }
        let lowered = chain.to_lowercase();
        if lowered.contains("tls") || lowered.contains("certificate") {
            Self::TlsHandshake(detail)
        } else if e.is_connect() {
            Self::Refused(detail)
        } else if lowered.contains("connection closed") || lowered.contains("reset") {
            Self::Closed(detail)
        } else {
            Self::Upstream(detail)
        }
    }
}

/// A forwarded upstream response, fully buffered.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Single-assignment result of one forwarded request: resolved exactly
/// once by the forwarding task, consumed exactly once by the writer.
pub struct ForwardResult {
    rx: oneshot::Receiver<Result<ForwardedResponse, ForwardError>>,
}

/// Resolver half of a `ForwardResult`.
pub struct ForwardResolver {
    tx: oneshot::Sender<Result<ForwardedResponse, ForwardError>>,
}

impl ForwardResult {
    pub fn channel() -> (ForwardResolver, ForwardResult) {
        let (tx, rx) = oneshot::channel();
        (ForwardResolver { tx }, ForwardResult { rx })
    }

    /// Await the result, bounded by the configured maximum. A dropped
    /// resolver (the forwarding task died) surfaces as a closed-upstream
    /// failure rather than leaking the waiter.
    pub async fn await_within(self, limit: Duration) -> Result<ForwardedResponse, ForwardError> {
        match tokio::time::timeout(limit, self.rx).await {
            Err(_) => Err(ForwardError::Timeout),
            Ok(Err(_)) => Err(ForwardError::Closed(
                "forwarding task ended without a result".to_string(),
            )),
            Ok(Ok(result)) => result,
        }
    }
}

impl ForwardResolver {
    pub fn resolve(self, result: Result<ForwardedResponse, ForwardError>) {
        // The receiver may have timed out and gone; that is not an error.
        let _ = self.tx.send(result);
    }
}

/// Per-source-port hop counter backing proxy-loop detection. Shared
/// across connection tasks; approximate by design.
pub struct HopTracker {
    counts: Mutex<LruCache<u16, u32>>,
}

impl HopTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(4096).unwrap());
        Self {
            counts: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record one more proxied pass for this source port and return the
    /// updated count.
    pub fn record(&self, source_port: u16) -> u32 {
        let mut counts = self.counts.lock().expect("hop tracker lock poisoned");
        let count = counts.get(&source_port).copied().unwrap_or(0) + 1;
        counts.put(source_port, count);
        count
    }

    pub fn count(&self, source_port: u16) -> u32 {
        let mut counts = self.counts.lock().expect("hop tracker lock poisoned");
        counts.get(&source_port).copied().unwrap_or(0)
    }
}

/// Upstream HTTP client wrapper.
pub struct Forwarder {
    client: reqwest::Client,
    pub hop_tracker: HopTracker,
}

impl Forwarder {
    /// Build the client: redirects off (the original client handles its
    /// own redirects), permissive TLS, optional upstream proxy chain.
    /// When a TLS client config is supplied (from the context factory),
    /// it replaces the permissive default wholesale.
    pub fn new(
        connect_timeout: Duration,
        upstream_proxy: Option<&UpstreamProxyChain>,
        hop_capacity: usize,
        tls: Option<rustls::ClientConfig>,
    ) -> Result<Self, ForwardError> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(connect_timeout);

        builder = match tls {
            Some(config) => builder.use_preconfigured_tls(config),
            None => builder.danger_accept_invalid_certs(true),
        };

        if let Some(chain) = upstream_proxy {
            let url = format!("http://{}:{}", chain.host, chain.port);
            let mut proxy = reqwest::Proxy::all(&url)
                .map_err(|e| ForwardError::Upstream(e.to_string()))?;
            if let (Some(user), Some(pass)) = (&chain.username, &chain.password) {
                proxy = proxy.basic_auth(user, pass);
            }
            debug!(proxy = %url, "Forwarding through upstream proxy chain");
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| ForwardError::Upstream(e.to_string()))?;

        Ok(Self {
            client,
            hop_tracker: HopTracker::new(hop_capacity),
        })
    }

    /// Send one request upstream and buffer the response.
    pub async fn send(
        &self,
        method: Method,
        url: String,
        headers: HeaderMap,
        body: Bytes,
        limit: Duration,
    ) -> Result<ForwardedResponse, ForwardError> {
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| ForwardError::Upstream(e.to_string()))?;

        let mut request = self.client.request(method, &url).timeout(limit).headers(headers);
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "Upstream request failed");
            ForwardError::from_reqwest(e)
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ForwardError::Closed(e.to_string()))?;

        debug!(url = %url, status = %status, bytes = body.len(), "Upstream response received");
        Ok(ForwardedResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_tracker_counts_per_port() {
        let tracker = HopTracker::new(16);
        assert_eq!(tracker.count(50000), 0);
        assert_eq!(tracker.record(50000), 1);
        assert_eq!(tracker.record(50000), 2);
        assert_eq!(tracker.record(50001), 1);
        assert_eq!(tracker.count(50000), 2);
    }

    #[test]
    fn hop_tracker_evicts_oldest_port() {
        let tracker = HopTracker::new(2);
        tracker.record(1);
        tracker.record(2);
        tracker.record(3);
        assert_eq!(tracker.count(1), 0);
        assert_eq!(tracker.count(2), 1);
        assert_eq!(tracker.count(3), 1);
    }

    #[tokio::test]
    async fn forward_result_resolves_once() {
        let (resolver, result) = ForwardResult::channel();
        resolver.resolve(Ok(ForwardedResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"ok"),
        }));
        let response = result.await_within(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"ok");
    }

    #[tokio::test]
    async fn dropped_resolver_surfaces_as_closed() {
        let (resolver, result) = ForwardResult::channel();
        drop(resolver);
        let err = result.await_within(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ForwardError::Closed(_)));
    }

    #[tokio::test]
    async fn unresolved_result_times_out() {
        let (_resolver, result) = ForwardResult::channel();
        let err = result.await_within(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ForwardError::Timeout));
    }
}
