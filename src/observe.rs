//! Traffic observation seam
//!
//! The engine hands raw messages and connection lifecycle events to a
//! `TrafficObserver`; parsing and recording live behind the trait. The
//! default `NullObserver` drops everything.

use std::net::SocketAddr;

/// Receives proxied traffic and connection lifecycle events.
///
/// `sequence` is per-connection and monotonically increasing, so an
/// implementation can reconstruct message order without timestamps.
pub trait TrafficObserver: Send + Sync {
    /// One raw message (request or response bytes as seen on the wire).
    fn on_message(
        &self,
        raw: &[u8],
        sender: SocketAddr,
        receiver: SocketAddr,
        sequence: u64,
        is_request: bool,
    );

    fn on_connection_open(&self, _peer: SocketAddr) {}

    fn on_connection_close(&self, _peer: SocketAddr) {}
}

/// Observer that ignores all traffic.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl TrafficObserver for NullObserver {
    fn on_message(
        &self,
        _raw: &[u8],
        _sender: SocketAddr,
        _receiver: SocketAddr,
        _sequence: u64,
        _is_request: bool,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingObserver {
        messages: AtomicU64,
    }

    impl TrafficObserver for CountingObserver {
        fn on_message(
            &self,
            _raw: &[u8],
            _sender: SocketAddr,
            _receiver: SocketAddr,
            _sequence: u64,
            _is_request: bool,
        ) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn observer_is_object_safe() {
        let observer: Box<dyn TrafficObserver> = Box::new(CountingObserver {
            messages: AtomicU64::new(0),
        });
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        observer.on_message(b"GET / HTTP/1.1\r\n\r\n", addr, addr, 0, true);
        observer.on_connection_open(addr);
        observer.on_connection_close(addr);
    }
}
