//! CONNECT tunnel relay engine
//!
//! Explicit state machine for tunnel setup: Connecting (outbound TCP,
//! timeout-bounded), Handshaking (marker exchange with the unification
//! layer on the far side), then Established (bidirectional bridge) or
//! Failed (protocol-appropriate error response via `ProtocolAdapter`).
//!
//! In forward mode the outbound leg dials this engine's own listener, so
//! the tunnel re-enters unification and the decrypted stream reaches
//! dispatch. In reverse mode it dials the configured fixed remote.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use http::{Response, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::connection::TunnelTarget;
use crate::unification::{encode_marker, read_marker_line, MARKER_RESPONSE};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("tunnel connect failed: {0}")]
    ConnectFailed(#[source] io::Error),

    #[error("tunnel connect timed out")]
    ConnectTimeout,

    #[error("tunnel handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("tunnel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Maps relay outcomes onto the protocol the client is speaking. The
/// same engine serves HTTP CONNECT legs and raw-byte legs.
pub trait ProtocolAdapter {
    type Response;

    fn success_response(&self) -> Self::Response;
    fn failure_response(&self, error: &RelayError) -> Self::Response;
}

/// Adapter for HTTP/1.1 CONNECT: 200 on success, 502 on failure.
pub struct HttpConnectAdapter;

impl ProtocolAdapter for HttpConnectAdapter {
    type Response = Response<Bytes>;

    fn success_response(&self) -> Response<Bytes> {
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = StatusCode::OK;
        response
    }

    fn failure_response(&self, error: &RelayError) -> Response<Bytes> {
        let status = match error {
            RelayError::ConnectTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        let mut response = Response::new(Bytes::from(error.to_string()));
        *response.status_mut() = status;
        response
    }
}

/// An established tunnel leg: the outbound stream plus any bytes the far
/// side sent after its marker response (replayed by the caller).
#[derive(Debug)]
pub struct EstablishedTunnel {
    pub stream: TcpStream,
    pub early_payload: Vec<u8>,
}

/// Connecting + Handshaking states: dial `connect_addr`, send the tunnel
/// marker for `target`, and require the unification layer's response.
pub async fn establish(
    connect_addr: &str,
    target: &TunnelTarget,
    secure: bool,
    connect_timeout: Duration,
) -> Result<EstablishedTunnel, RelayError> {
    // Connecting
    let mut stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(connect_addr))
        .await
    {
        Err(_) => return Err(RelayError::ConnectTimeout),
        Ok(Err(e)) => return Err(RelayError::ConnectFailed(e)),
        Ok(Ok(stream)) => stream,
    };

    // Handshaking
    let marker = encode_marker(target, secure);
    stream.write_all(&marker).await?;
    stream.flush().await?;

    let mut early_payload = Vec::new();
    let line = read_marker_line(&mut stream, &mut early_payload)
        .await
        .map_err(|e| RelayError::HandshakeFailed(e.to_string()))?;

    let expected = &MARKER_RESPONSE[..MARKER_RESPONSE.len() - 1]; // sans newline
    if line != expected {
        return Err(RelayError::HandshakeFailed(format!(
            "unexpected tunnel handshake reply ({} bytes)",
            line.len()
        )));
    }

    debug!(target = %target, secure, "[RELAY] Tunnel handshake complete");
    Ok(EstablishedTunnel {
        stream,
        early_payload,
    })
}

/// Established state: copy bytes in both directions until either side
/// closes, then shut down the partner. Returns (client→server,
/// server→client) byte counts.
///
/// Each direction is a pull loop: read one chunk, write it fully, flush,
/// only then read again, so a slow consumer throttles the producer.
pub async fn bridge<C, S>(client: C, server: S, label: &str) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let upstream = pump(&mut client_read, &mut server_write, label, "client->server");
    let downstream = pump(&mut server_read, &mut client_write, label, "server->client");

    let (sent, received) = tokio::join!(upstream, downstream);
    info!(
        tunnel = %label,
        bytes_sent = sent,
        bytes_received = received,
        "[RELAY] Tunnel closed"
    );
    (sent, received)
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, label: &str, direction: &str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 16 * 1024];
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log_stream_end(&e, label, direction);
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            log_stream_end(&e, label, direction);
            break;
        }
        if let Err(e) = writer.flush().await {
            log_stream_end(&e, label, direction);
            break;
        }
        total += n as u64;
    }

    // One side finished: close the partner's write half so no half-open
    // tunnel lingers.
    let _ = writer.shutdown().await;
    total
}

fn log_stream_end(e: &io::Error, label: &str, direction: &str) {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => {
            debug!(tunnel = %label, direction, "[RELAY] Peer closed: {}", e);
        }
        _ => {
            warn!(tunnel = %label, direction, error = %e, "[RELAY] Tunnel stream error");
        }
    }
}
