//! Protocol/Port Unification
//!
//! Every accepted connection starts protocol-less: the first bytes decide
//! whether to install a TLS handshake, an HTTP/2 server, a tunnel-marker
//! exchange, or plaintext HTTP/1.1. Sniffed bytes are buffered and
//! replayed through `PrefixedStream`, so no byte is consumed before the
//! matching codec is in place. Leading bytes that match none of the known
//! forms are treated as plaintext HTTP and left to fail naturally in the
//! HTTP decoder.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::connection::TunnelTarget;

/// HTTP/2 connection preface (RFC 9113 §3.4).
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Tunnel-setup marker prefixes. Newline-terminated ASCII frames
/// understood only by this engine's unification layer.
pub const MARKER_SECURE_PREFIX: &str = "PROXIED_SECURE_";
pub const MARKER_PLAIN_PREFIX: &str = "PROXIED_";
pub const MARKER_RESPONSE: &[u8] = b"PROXIED_RESPONSE\n";

/// Longest accepted marker line (prefix + authority + newline).
pub const MAX_MARKER_LINE: usize = 512;

/// Outcome of first-bytes classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedProtocol {
    /// TLS handshake record.
    Tls,
    /// HTTP/2 connection preface.
    Http2Preface,
    /// Tunnel re-entry marker from a relay leg.
    ProxiedMarker,
    /// Anything else: plaintext HTTP/1.x (best effort).
    Http1,
}

/// Classify the first bytes of a connection.
pub fn detect_protocol(prefix: &[u8]) -> DetectedProtocol {
    if prefix.len() >= 3 && prefix[0] == 0x16 && prefix[1] == 0x03 {
        return DetectedProtocol::Tls;
    }
    if starts_with_prefix_of(prefix, H2_PREFACE) && prefix.len() >= 4 {
        return DetectedProtocol::Http2Preface;
    }
    if starts_with_prefix_of(prefix, MARKER_PLAIN_PREFIX.as_bytes()) && prefix.len() >= 4 {
        return DetectedProtocol::ProxiedMarker;
    }
    DetectedProtocol::Http1
}

/// True when `bytes` begins with as much of `pattern` as it contains
/// (never true for empty input).
fn starts_with_prefix_of(bytes: &[u8], pattern: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let n = bytes.len().min(pattern.len());
    bytes[..n] == pattern[..n]
}

/// Encode a tunnel-setup marker frame for the given target.
pub fn encode_marker(target: &TunnelTarget, secure: bool) -> Vec<u8> {
    let prefix = if secure {
        MARKER_SECURE_PREFIX
    } else {
        MARKER_PLAIN_PREFIX
    };
    format!("{}{}\n", prefix, target).into_bytes()
}

/// Decode a marker line (without requiring the trailing newline).
/// Returns the target and whether SSL is expected on the tunnel.
pub fn decode_marker(line: &[u8]) -> Option<(TunnelTarget, bool)> {
    let line = std::str::from_utf8(line).ok()?;
    let line = line.trim_end_matches(['\n', '\r']);

    // SECURE must be checked first: both share the PROXIED_ prefix.
    let (rest, secure) = if let Some(rest) = line.strip_prefix(MARKER_SECURE_PREFIX) {
        (rest, true)
    } else if let Some(rest) = line.strip_prefix(MARKER_PLAIN_PREFIX) {
        (rest, false)
    } else {
        return None;
    };

    let default_port = if secure { 443 } else { 80 };
    let target = TunnelTarget::from_authority(rest, default_port).ok()?;
    Some((target, secure))
}

/// Read a newline-terminated marker line, bounded by `MAX_MARKER_LINE`.
pub async fn read_marker_line<S>(stream: &mut S, initial: &mut Vec<u8>) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = initial.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = initial.drain(..=pos).collect();
            line.pop(); // newline
            return Ok(line);
        }
        if initial.len() > MAX_MARKER_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "marker line exceeds maximum length",
            ));
        }
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before marker line completed",
            ));
        }
        initial.extend_from_slice(&buf[..n]);
    }
}

/// A stream that replays buffered prefix bytes before reading from the
/// inner transport. Writes pass straight through.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    pub fn into_inner(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
