//! Listener and protocol-unified accept loop
//!
//! Every accepted socket runs through the same pipeline: sniff the first
//! bytes, classify (TLS / HTTP/2 preface / tunnel marker / plaintext
//! HTTP), install the matching codec over a replaying stream, and feed
//! requests into dispatch. Tunnel markers loop the stream back through
//! classification, which is how CONNECT tunnels re-enter the engine and
//! get their decrypted traffic intercepted.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use http::{Method, Response};
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connect;
use crate::connection::{ConnectionContext, ConnectionRegistry, ConnectionStatus};
use crate::dispatch::{DispatchOutcome, DispatchRequest, Dispatcher, Expectation};
use crate::forward::Forwarder;
use crate::observe::{NullObserver, TrafficObserver};
use crate::tls::{
    determine_preference, extract_sni, AlpnProtocol, CertificateIssuer, LocalCertificateIssuer,
    TlsContextFactory,
};
use crate::unification::{
    decode_marker, detect_protocol, read_marker_line, DetectedProtocol, PrefixedStream,
    MARKER_RESPONSE,
};

/// Object-safe transport the unification loop threads through codecs.
trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

type BoxedIo = Box<dyn AsyncIo>;

/// Shared engine state: everything connection tasks need beyond their
/// own context.
pub struct ProxyState {
    pub config: Config,
    pub registry: ConnectionRegistry,
    pub tls_factory: TlsContextFactory,
    pub dispatcher: Dispatcher,
    pub forwarder: Arc<Forwarder>,
    pub observer: Arc<dyn TrafficObserver>,
}

/// Builder for a `ProxyServer`. Defaults: built-in CA issuer, no
/// observer, no expectations.
pub struct ProxyServerBuilder {
    config: Config,
    issuer: Option<Arc<dyn CertificateIssuer>>,
    observer: Arc<dyn TrafficObserver>,
    expectations: Vec<Expectation>,
}

impl ProxyServerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            issuer: None,
            observer: Arc::new(NullObserver),
            expectations: Vec::new(),
        }
    }

    pub fn with_issuer(mut self, issuer: Arc<dyn CertificateIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TrafficObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_expectation(mut self, expectation: Expectation) -> Self {
        self.expectations.push(expectation);
        self
    }

    /// Bind the listener and assemble the engine.
    pub async fn bind(self) -> Result<ProxyServer> {
        let config = self.config;

        let issuer = match self.issuer {
            Some(issuer) => issuer,
            None => Arc::new(
                LocalCertificateIssuer::new().context("Failed to initialize built-in CA")?,
            ),
        };
        let tls_factory =
            TlsContextFactory::new(issuer, config.tls_version, config.dynamic_san_update);

        let upstream_tls = (*tls_factory.client_config(AlpnProtocol::Http1)).clone();
        let forwarder = Arc::new(
            Forwarder::new(
                config.connect_timeout,
                config.upstream_proxy.as_ref(),
                config.hop_tracker_capacity,
                Some(upstream_tls),
            )
            .context("Failed to build upstream forwarding client")?,
        );

        let dispatcher = Dispatcher::new(
            Arc::clone(&forwarder),
            config.max_loop_hops,
            config.max_future_timeout,
        );
        for expectation in self.expectations {
            dispatcher.add_expectation(expectation);
        }

        let listener = TcpListener::bind(config.bind_address())
            .await
            .with_context(|| format!("Failed to bind {}", config.bind_address()))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;

        info!(addr = %local_addr, "Proxy listening");

        Ok(ProxyServer {
            state: Arc::new(ProxyState {
                config,
                registry: ConnectionRegistry::new(),
                tls_factory,
                dispatcher,
                forwarder,
                observer: self.observer,
            }),
            listener,
            local_addr,
        })
    }
}

pub struct ProxyServer {
    state: Arc<ProxyState>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ProxyServer {
    pub fn builder(config: Config) -> ProxyServerBuilder {
        ProxyServerBuilder::new(config)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<ProxyState> {
        Arc::clone(&self.state)
    }

    /// Accept loop. Handler failures are contained per connection; the
    /// loop itself only ends on fatal listener errors.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            };

            let state = Arc::clone(&self.state);
            let local_addr = self.local_addr;
            state.registry.register(peer);
            state.observer.on_connection_open(peer);

            tokio::spawn(async move {
                if let Err(e) =
                    handle_stream(stream, peer, local_addr, Arc::clone(&state)).await
                {
                    debug!(peer = %peer, error = %e, "Connection ended with error");
                }
                state.registry.remove(peer);
                state.observer.on_connection_close(peer);
            });
        }
    }
}

/// Read until the prefix is classifiable (or EOF).
async fn sniff_prefix(io: &mut BoxedIo) -> io::Result<Vec<u8>> {
    let mut prefix = Vec::with_capacity(24);
    let mut buf = [0u8; 24];
    while prefix.len() < 4 {
        let n = io.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        prefix.extend_from_slice(&buf[..n]);
    }
    Ok(prefix)
}

async fn handle_stream(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    local_addr: SocketAddr,
    state: Arc<ProxyState>,
) -> Result<()> {
    let mut ctx = ConnectionContext::new(peer, local_addr);

    // Reverse mode: every connection proxies toward the fixed remote.
    if let Some(target) = &state.config.remote_target {
        ctx.proxying = true;
        ctx.tunnel_target = Some(target.clone());
    }

    let mut io: BoxedIo = Box::new(stream);

    // Unification loop: a tunnel marker strips one layer and re-classifies.
    loop {
        let prefix = sniff_prefix(&mut io).await?;
        if prefix.is_empty() {
            return Ok(());
        }

        match detect_protocol(&prefix) {
            DetectedProtocol::Tls => {
                return serve_tls(io, prefix, ctx, state).await;
            }
            DetectedProtocol::Http2Preface => {
                let io: BoxedIo = Box::new(PrefixedStream::new(prefix, io));
                return serve_h2(io, ctx, state).await;
            }
            DetectedProtocol::Http1 => {
                let io: BoxedIo = Box::new(PrefixedStream::new(prefix, io));
                return serve_http1(io, ctx, state).await;
            }
            DetectedProtocol::ProxiedMarker => {
                let mut initial = prefix;
                let mut line = read_marker_line(&mut io, &mut initial).await?;
                line.push(b'\n');
                let (target, secure) = decode_marker(&line)
                    .ok_or_else(|| anyhow::anyhow!("malformed tunnel marker"))?;

                debug!(peer = %peer, target = %target, secure, "[UNIFY] Tunnel re-entry");

                ctx.proxying = true;
                ctx.ssl_expected_downstream = secure;
                ctx.ssl_expected_upstream = secure;
                ctx.tunnel_target = Some(target.clone());
                ctx.hop_count = state.forwarder.hop_tracker.record(peer.port());
                state.tls_factory.observe_hostname(target.bare_host());

                io.write_all(MARKER_RESPONSE).await?;
                io.flush().await?;

                // Bytes past the marker belong to the tunneled protocol.
                io = Box::new(PrefixedStream::new(initial, io));
            }
        }
    }
}

/// Read the complete first TLS record so the ClientHello analyzer sees
/// all of it, then replay everything into the acceptor.
async fn read_client_hello_record(io: &mut BoxedIo, mut buf: Vec<u8>) -> io::Result<Vec<u8>> {
    let mut chunk = [0u8; 4096];
    while buf.len() < 5 {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside TLS record header",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let total = 5 + record_len;
    while buf.len() < total {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside ClientHello",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Ok(buf)
}

async fn serve_tls(
    mut io: BoxedIo,
    sniffed: Vec<u8>,
    mut ctx: ConnectionContext,
    state: Arc<ProxyState>,
) -> Result<()> {
    let hello = read_client_hello_record(&mut io, sniffed).await?;

    if let Some(sni) = extract_sni(&hello) {
        debug!(peer = %ctx.peer_addr, sni = %sni, "[TLS] SNI observed");
        state.tls_factory.observe_hostname(&sni);
    }

    let preference =
        determine_preference(&hello).combine(state.tls_factory.server_preference());
    let (config, identity) = state.tls_factory.server_config(preference)?;
    debug!(
        peer = %ctx.peer_addr,
        preference = %preference,
        algorithm = ?identity.key_algorithm,
        "[TLS] Intercepting with generated identity"
    );

    let acceptor = TlsAcceptor::from(config);
    let tls = acceptor
        .accept(PrefixedStream::new(hello, io))
        .await
        .context("TLS interception handshake failed")?;

    ctx.tls_intercepted = true;
    state
        .registry
        .set_status(ctx.peer_addr, ConnectionStatus::TlsEstablished);

    // TODO: reading ALPN immediately after the accept future resolves is
    // safe with tokio-rustls, but the equivalent read raced negotiation
    // in earlier event-loop ports of this engine; verify under load
    // before adding new call sites that read it off-task.
    let alpn = tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
    ctx.negotiated_alpn = alpn.clone();

    let io: BoxedIo = Box::new(tls);
    match alpn.as_deref() {
        Some(b"h2") => serve_h2(io, ctx, state).await,
        _ => serve_http1(io, ctx, state).await,
    }
}

/// Where a new tunnel leg should dial: the fixed remote in reverse mode,
/// otherwise this engine's own listener.
fn tunnel_dial_addr(state: &ProxyState, ctx: &ConnectionContext) -> String {
    match &state.config.remote_target {
        Some(target) => target.to_string(),
        None => ctx.local_addr.to_string(),
    }
}

async fn serve_http1(io: BoxedIo, ctx: ConnectionContext, state: Arc<ProxyState>) -> Result<()> {
    let ctx = Arc::new(tokio::sync::Mutex::new(ctx));
    let sequence = Arc::new(AtomicU64::new(0));

    let service = service_fn({
        let state = Arc::clone(&state);
        let ctx = Arc::clone(&ctx);
        let sequence = Arc::clone(&sequence);
        move |req: http::Request<hyper::body::Incoming>| {
            let state = Arc::clone(&state);
            let ctx = Arc::clone(&ctx);
            let sequence = Arc::clone(&sequence);
            async move {
                if req.method() == Method::CONNECT {
                    let mut ctx = ctx.lock().await;
                    let dial_addr = tunnel_dial_addr(&state, &ctx);
                    let response = connect::handle_connect(
                        req,
                        &mut ctx,
                        state.config.proxy_auth.as_ref(),
                        &state.tls_factory,
                        dial_addr,
                        state.config.connect_timeout,
                    )
                    .await;
                    return Ok(to_full(response));
                }

                let (parts, body) = req.into_parts();
                let body = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(e) => {
                        warn!(error = %e, "[HTTP1] Failed to read request body");
                        Bytes::new()
                    }
                };

                let request = DispatchRequest {
                    method: parts.method,
                    uri: parts.uri,
                    headers: parts.headers,
                    body,
                };

                let ctx_snapshot = ctx.lock().await.clone();
                observe_request(&state, &ctx_snapshot, &sequence, &request);

                match state.dispatcher.dispatch(request, &ctx_snapshot).await {
                    DispatchOutcome::Response(response) => {
                        observe_response(&state, &ctx_snapshot, &sequence, &response);
                        Ok(to_full(response))
                    }
                    DispatchOutcome::Close => Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "connection closed per expectation",
                    )),
                }
            }
        }
    });

    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
        .map_err(|e| anyhow::anyhow!("HTTP/1.1 connection error: {}", e))
}

async fn serve_h2(io: BoxedIo, ctx: ConnectionContext, state: Arc<ProxyState>) -> Result<()> {
    let mut connection = h2::server::handshake(io)
        .await
        .context("HTTP/2 handshake failed")?;

    let sequence = Arc::new(AtomicU64::new(0));

    while let Some(accepted) = connection.accept().await {
        let (request, mut respond) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                debug!(peer = %ctx.peer_addr, error = %e, "[H2] Stream error");
                break;
            }
        };

        let state = Arc::clone(&state);
        let ctx = ctx.clone();
        let sequence = Arc::clone(&sequence);
        tokio::spawn(async move {
            let (parts, mut body) = request.into_parts();

            let mut buf = BytesMut::new();
            while let Some(chunk) = body.data().await {
                match chunk {
                    Ok(data) => {
                        let _ = body.flow_control().release_capacity(data.len());
                        buf.extend_from_slice(&data);
                    }
                    Err(e) => {
                        debug!(error = %e, "[H2] Request body error");
                        break;
                    }
                }
            }

            let request = DispatchRequest {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                body: buf.freeze(),
            };
            observe_request(&state, &ctx, &sequence, &request);

            match state.dispatcher.dispatch(request, &ctx).await {
                DispatchOutcome::Response(response) => {
                    observe_response(&state, &ctx, &sequence, &response);
                    let (parts, body) = response.into_parts();
                    let head = Response::from_parts(parts, ());
                    match respond.send_response(head, body.is_empty()) {
                        Ok(mut stream) => {
                            if !body.is_empty() {
                                if let Err(e) = stream.send_data(body, true) {
                                    debug!(error = %e, "[H2] Response body send failed");
                                }
                            }
                        }
                        Err(e) => debug!(error = %e, "[H2] Response send failed"),
                    }
                }
                DispatchOutcome::Close => {
                    respond.send_reset(h2::Reason::CANCEL);
                }
            }
        });
    }

    Ok(())
}

fn observe_request(
    state: &ProxyState,
    ctx: &ConnectionContext,
    sequence: &AtomicU64,
    request: &DispatchRequest,
) {
    let raw = render_request(request);
    state.observer.on_message(
        &raw,
        ctx.peer_addr,
        ctx.local_addr,
        sequence.fetch_add(1, Ordering::SeqCst),
        true,
    );
}

fn observe_response(
    state: &ProxyState,
    ctx: &ConnectionContext,
    sequence: &AtomicU64,
    response: &Response<Bytes>,
) {
    let raw = render_response(response);
    state.observer.on_message(
        &raw,
        ctx.local_addr,
        ctx.peer_addr,
        sequence.fetch_add(1, Ordering::SeqCst),
        false,
    );
}

fn render_request(request: &DispatchRequest) -> Vec<u8> {
    let mut raw = format!("{} {} HTTP/1.1\r\n", request.method, request.uri).into_bytes();
    for (name, value) in &request.headers {
        raw.extend_from_slice(name.as_str().as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(&request.body);
    raw
}

fn render_response(response: &Response<Bytes>) -> Vec<u8> {
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or("")
    )
    .into_bytes();
    for (name, value) in response.headers() {
        raw.extend_from_slice(name.as_str().as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(response.body());
    raw
}

fn to_full(response: Response<Bytes>) -> Response<Full<Bytes>> {
    response.map(Full::new)
}
