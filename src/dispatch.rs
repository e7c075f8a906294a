//! Expectation-based request dispatch
//!
//! Every decrypted/plain request lands here: expectations are consulted
//! in insertion order (first match wins); unmatched requests on a
//! proxying connection are forwarded upstream, everything else is a 404.
//! The engine also owns proxy-loop prevention: an instance-unique value
//! in `x-tapwire-forwarded` catches single-instance loops, and the
//! per-source-port hop count catches multi-instance chains.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Response, StatusCode, Uri};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionContext, TunnelTarget};
use crate::forward::{ForwardError, ForwardResult, Forwarder};

/// Loop-prevention header stamped on every forwarded request.
pub const LOOP_HEADER: &str = "x-tapwire-forwarded";

/// Headers never forwarded upstream (RFC 7230 §6.1 hop-by-hop set, plus
/// proxy credentials).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Predicate over an incoming request. All populated fields must match.
#[derive(Debug, Clone, Default)]
pub struct RequestMatcher {
    pub method: Option<Method>,
    pub path: Option<String>,
    pub path_prefix: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl RequestMatcher {
    pub fn matches(&self, method: &Method, path: &str, headers: &HeaderMap) -> bool {
        if let Some(expected) = &self.method {
            if expected != method {
                return false;
            }
        }
        if let Some(expected) = &self.path {
            if expected != path {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        for (name, value) in &self.headers {
            match headers.get(name) {
                Some(actual) if actual.as_bytes() == value.as_bytes() => {}
                _ => return false,
            }
        }
        true
    }
}

/// Canned response returned for a matched expectation.
#[derive(Debug, Clone)]
pub struct ResponseTemplate {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ResponseTemplate {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Override applied when an expectation forwards instead of responding.
#[derive(Debug, Clone, Default)]
pub struct ForwardOverride {
    /// Replace the request target (host/port).
    pub target: Option<TunnelTarget>,
    /// Force the upstream scheme regardless of what the inbound leg used.
    pub secure: Option<bool>,
}

/// What to do when a matcher fires.
#[derive(Debug, Clone)]
pub enum Action {
    Respond(ResponseTemplate),
    Forward(ForwardOverride),
    CloseConnection,
}

/// Whether a forwarding action runs inline or on its own task. Both
/// produce the response before the writer continues; Async merely moves
/// the upstream I/O off the connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sync,
    Async,
}

#[derive(Debug, Clone)]
pub struct Expectation {
    pub matcher: RequestMatcher,
    pub action: Action,
    pub mode: ExecutionMode,
}

impl Expectation {
    pub fn respond(matcher: RequestMatcher, template: ResponseTemplate) -> Self {
        Self {
            matcher,
            action: Action::Respond(template),
            mode: ExecutionMode::Sync,
        }
    }

    pub fn forward(matcher: RequestMatcher, override_: ForwardOverride) -> Self {
        Self {
            matcher,
            action: Action::Forward(override_),
            mode: ExecutionMode::Sync,
        }
    }

    pub fn close(matcher: RequestMatcher) -> Self {
        Self {
            matcher,
            action: Action::CloseConnection,
            mode: ExecutionMode::Sync,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// One fully-buffered request ready for dispatch.
#[derive(Debug)]
pub struct DispatchRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Dispatch outcome: a response to write, or an instruction to drop the
/// connection without one.
#[derive(Debug)]
pub enum DispatchOutcome {
    Response(Response<Bytes>),
    Close,
}

pub struct Dispatcher {
    expectations: RwLock<Vec<Expectation>>,
    /// Instance-unique loop-header value.
    instance_value: String,
    forwarder: Arc<Forwarder>,
    max_loop_hops: u32,
    max_future_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        forwarder: Arc<Forwarder>,
        max_loop_hops: u32,
        max_future_timeout: Duration,
    ) -> Self {
        let instance_value = format!("{:016x}", rand::thread_rng().gen::<u64>());
        Self {
            expectations: RwLock::new(Vec::new()),
            instance_value,
            forwarder,
            max_loop_hops,
            max_future_timeout,
        }
    }

    pub fn add_expectation(&self, expectation: Expectation) {
        self.expectations
            .write()
            .expect("expectation list lock poisoned")
            .push(expectation);
    }

    pub fn clear_expectations(&self) {
        self.expectations
            .write()
            .expect("expectation list lock poisoned")
            .clear();
    }

    #[cfg(test)]
    pub(crate) fn instance_value(&self) -> &str {
        &self.instance_value
    }

    /// Dispatch one request. First matching expectation wins; unmatched
    /// proxied requests go upstream; everything else is a 404.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        ctx: &ConnectionContext,
    ) -> DispatchOutcome {
        let path = request.uri.path().to_string();

        let matched = {
            let expectations = self
                .expectations
                .read()
                .expect("expectation list lock poisoned");
            expectations
                .iter()
                .find(|e| e.matcher.matches(&request.method, &path, &request.headers))
                .cloned()
        };

        if let Some(expectation) = matched {
            debug!(method = %request.method, path = %path, "[DISPATCH] Expectation matched");
            return match expectation.action {
                Action::Respond(template) => {
                    DispatchOutcome::Response(render_template(&template))
                }
                Action::CloseConnection => {
                    info!(method = %request.method, path = %path, "[DISPATCH] Closing connection per expectation");
                    DispatchOutcome::Close
                }
                Action::Forward(override_) => {
                    self.forward(request, ctx, Some(override_), expectation.mode)
                        .await
                }
            };
        }

        if ctx.proxying {
            // A request carrying our own loop-header value has already
            // been through this instance once. Checked only on the
            // forwarding path: a matched expectation answers regardless.
            if let Some(value) = request.headers.get(LOOP_HEADER) {
                if value.as_bytes() == self.instance_value.as_bytes() {
                    warn!(
                        method = %request.method,
                        path = %path,
                        "[DISPATCH] Proxy loop detected (request revisited this instance)"
                    );
                    return DispatchOutcome::Response(not_found(
                        "proxy loop detected: request already passed through this instance",
                    ));
                }
            }
            if ctx.hop_count > self.max_loop_hops {
                warn!(
                    peer = %ctx.peer_addr,
                    hops = ctx.hop_count,
                    max = self.max_loop_hops,
                    "[DISPATCH] Proxy loop refused (hop count exceeded)"
                );
                return DispatchOutcome::Response(not_found(
                    "proxy loop detected: maximum hop count exceeded",
                ));
            }
            return self.forward(request, ctx, None, ExecutionMode::Sync).await;
        }

        debug!(method = %request.method, path = %path, "[DISPATCH] No expectation matched");
        DispatchOutcome::Response(not_found("no expectation matched the request"))
    }

    /// Forward the request upstream, stamping the loop header and
    /// stripping hop-by-hop headers on the way out.
    async fn forward(
        &self,
        request: DispatchRequest,
        ctx: &ConnectionContext,
        override_: Option<ForwardOverride>,
        mode: ExecutionMode,
    ) -> DispatchOutcome {
        let override_ = override_.unwrap_or_default();

        let target = override_
            .target
            .clone()
            .or_else(|| ctx.tunnel_target.clone())
            .or_else(|| target_from_request(&request));

        let target = match target {
            Some(t) => t,
            None => {
                warn!("[DISPATCH] Cannot forward: no upstream target on request or connection");
                return DispatchOutcome::Response(not_found(
                    "no upstream target available for forwarding",
                ));
            }
        };

        // The re-entered tunnel leg was decrypted here when TLS was
        // intercepted, so the upstream connection must re-encrypt.
        let secure = override_.secure.unwrap_or(ctx.tls_intercepted);
        let scheme = if secure { "https" } else { "http" };
        let path_and_query = request
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}://{}{}", scheme, target, path_and_query);

        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        if let Ok(value) = HeaderValue::from_str(&self.instance_value) {
            headers.insert(HeaderName::from_static(LOOP_HEADER), value);
        }

        let limit = self.max_future_timeout;
        let result = match mode {
            ExecutionMode::Sync => {
                self.forwarder
                    .send(request.method, url.clone(), headers, request.body, limit)
                    .await
            }
            ExecutionMode::Async => {
                let (resolver, pending) = ForwardResult::channel();
                let forwarder = Arc::clone(&self.forwarder);
                let method = request.method;
                let body = request.body;
                let url_task = url.clone();
                tokio::spawn(async move {
                    let outcome = forwarder.send(method, url_task, headers, body, limit).await;
                    resolver.resolve(outcome);
                });
                pending.await_within(limit).await
            }
        };

        match result {
            Ok(forwarded) => {
                let mut response = Response::builder().status(forwarded.status);
                if let Some(response_headers) = response.headers_mut() {
                    *response_headers = forwarded.headers;
                    // An echoed loop header means the upstream chain came
                    // back through another instance of this proxy.
                    if response_headers.remove(LOOP_HEADER).is_some() {
                        info!(url = %url, "[DISPATCH] Multi-hop proxy echo detected in response");
                    }
                    strip_hop_by_hop(response_headers);
                }
                match response.body(forwarded.body) {
                    Ok(response) => DispatchOutcome::Response(response),
                    Err(e) => {
                        warn!(error = %e, "[DISPATCH] Failed to assemble forwarded response");
                        DispatchOutcome::Response(not_found("invalid upstream response"))
                    }
                }
            }
            Err(e) => {
                self.log_forward_failure(&url, &e);
                DispatchOutcome::Response(not_found(&format!("upstream request failed: {}", e)))
            }
        }
    }

    fn log_forward_failure(&self, url: &str, error: &ForwardError) {
        match error {
            ForwardError::Refused(detail) => {
                warn!(url = %url, detail = %detail, "[DISPATCH] Upstream connection refused")
            }
            ForwardError::Closed(detail) => {
                warn!(url = %url, detail = %detail, "[DISPATCH] Upstream connection closed")
            }
            ForwardError::Timeout => {
                warn!(url = %url, "[DISPATCH] Upstream request timed out")
            }
            ForwardError::TlsHandshake(detail) => {
                warn!(url = %url, detail = %detail, "[DISPATCH] Upstream TLS handshake failed")
            }
            ForwardError::Upstream(detail) => {
                warn!(url = %url, detail = %detail, "[DISPATCH] Upstream error")
            }
        }
    }
}

/// Derive the upstream target from an absolute-form request URI.
fn target_from_request(request: &DispatchRequest) -> Option<TunnelTarget> {
    let authority = request
        .uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            request
                .headers
                .get(http::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })?;
    let default_port = match request.uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    };
    TunnelTarget::from_authority(&authority, default_port).ok()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn render_template(template: &ResponseTemplate) -> Response<Bytes> {
    let mut builder = Response::builder().status(template.status);
    for (name, value) in &template.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(template.body.clone())
        .unwrap_or_else(|_| not_found("invalid response template"))
}

/// Unmatched/failed requests answer 404 with a plain-text cause. The
/// loop header is never present on these responses.
fn not_found(reason: &str) -> Response<Bytes> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Bytes::from(reason.to_string()))
        .unwrap_or_else(|_| {
            let mut response = Response::new(Bytes::new());
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        })
}
