//! End-to-end tests over real loopback sockets: CONNECT authentication,
//! tunnel round-trips through the unification loop, TLS interception,
//! and expectation dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig};
use tokio_rustls::TlsConnector;

use tapwire::dispatch::{Expectation, RequestMatcher, ResponseTemplate};
use tapwire::{Config, ProxyAuthConfig, ProxyServer};

/// Spawn a proxy on an ephemeral loopback port and return its address.
async fn start_proxy(
    auth: Option<ProxyAuthConfig>,
    expectations: Vec<Expectation>,
) -> SocketAddr {
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        proxy_auth: auth,
        ..Config::default()
    };

    let mut builder = ProxyServer::builder(config);
    for expectation in expectations {
        builder = builder.with_expectation(expectation);
    }
    let server = builder.bind().await.expect("proxy failed to bind");
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    addr
}

/// Read one HTTP/1.1 response (headers plus Content-Length body) off a
/// raw stream.
async fn read_http_response<S: AsyncReadExt + Unpin>(stream: &mut S) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let deadline = Duration::from_secs(5);
    loop {
        if let Some(headers_end) = find_headers_end(&buf) {
            let headers = String::from_utf8_lossy(&buf[..headers_end]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= headers_end + 4 + content_length {
                break;
            }
        }
        match tokio::time::timeout(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }

    String::from_utf8_lossy(&buf).to_string()
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn accept_all_tls_config() -> Arc<ClientConfig> {
    #[derive(Debug)]
    struct NoVerifier;

    impl rustls::client::danger::ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[tokio::test]
async fn connect_without_credentials_gets_407_challenge() {
    let auth = ProxyAuthConfig {
        username: "alice".to_string(),
        password: "s3cret".to_string(),
        realm: "tapwire-test".to_string(),
    };
    let addr = start_proxy(Some(auth), vec![]).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let response = read_http_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 407"), "got: {}", response);
    // Header-name case is up to the serializer.
    assert!(
        response
            .to_lowercase()
            .contains("proxy-authenticate: basic realm=\"tapwire-test\""),
        "got: {}",
        response
    );
}

#[tokio::test]
async fn connect_with_credentials_establishes_tunnel() {
    let auth = ProxyAuthConfig {
        username: "alice".to_string(),
        password: "s3cret".to_string(),
        realm: "tapwire-test".to_string(),
    };
    let addr = start_proxy(
        Some(auth),
        vec![Expectation::respond(
            RequestMatcher::default(),
            ResponseTemplate::new(StatusCode::OK).with_body("tunneled"),
        )],
    )
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // alice:s3cret
    stream
        .write_all(
            b"CONNECT backend.test:80 HTTP/1.1\r\n\
              Host: backend.test:80\r\n\
              Proxy-Authorization: Basic YWxpY2U6czNjcmV0\r\n\r\n",
        )
        .await
        .unwrap();

    let response = read_http_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
}

#[tokio::test]
async fn plaintext_tunnel_request_reaches_dispatch() {
    let addr = start_proxy(
        None,
        vec![Expectation::respond(
            RequestMatcher {
                path: Some("/inside".to_string()),
                ..Default::default()
            },
            ResponseTemplate::new(StatusCode::OK).with_body("through the tunnel"),
        )],
    )
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"CONNECT backend.test:80 HTTP/1.1\r\nHost: backend.test:80\r\n\r\n")
        .await
        .unwrap();
    let response = read_http_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    // The tunnel is plain (port 80): send HTTP straight through it. The
    // leg loops back into the proxy and dispatch answers.
    stream
        .write_all(b"GET /inside HTTP/1.1\r\nHost: backend.test\r\n\r\n")
        .await
        .unwrap();
    let response = read_http_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("through the tunnel"), "got: {}", response);
}

#[tokio::test]
async fn tls_tunnel_is_intercepted_and_dispatched() {
    let addr = start_proxy(
        None,
        vec![Expectation::respond(
            RequestMatcher {
                path: Some("/secure".to_string()),
                ..Default::default()
            },
            ResponseTemplate::new(StatusCode::OK).with_body("decrypted"),
        )],
    )
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"CONNECT secure.test:443 HTTP/1.1\r\nHost: secure.test:443\r\n\r\n")
        .await
        .unwrap();
    let response = read_http_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    // TLS handshake through the tunnel: the proxy terminates it with a
    // generated certificate.
    let connector = TlsConnector::from(accept_all_tls_config());
    let server_name = ServerName::try_from("secure.test").unwrap();
    let mut tls = connector.connect(server_name, stream).await.unwrap();

    tls.write_all(b"GET /secure HTTP/1.1\r\nHost: secure.test\r\n\r\n")
        .await
        .unwrap();
    tls.flush().await.unwrap();

    let response = read_http_response(&mut tls).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("decrypted"), "got: {}", response);
}

#[tokio::test]
async fn unmatched_direct_request_gets_404() {
    let addr = start_proxy(None, vec![]).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /nothing HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let response = read_http_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);
    assert!(
        !response.to_lowercase().contains("x-tapwire-forwarded"),
        "404s must not carry the loop header: {}",
        response
    );
}

#[tokio::test]
async fn matched_direct_request_gets_template_response() {
    let addr = start_proxy(
        None,
        vec![Expectation::respond(
            RequestMatcher {
                path: Some("/health".to_string()),
                ..Default::default()
            },
            ResponseTemplate::new(StatusCode::OK)
                .with_header("x-served-by", "tapwire")
                .with_body("ok"),
        )],
    )
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let response = read_http_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("x-served-by: tapwire"), "got: {}", response);
    assert!(response.ends_with("ok"), "got: {}", response);
}

#[tokio::test]
async fn close_expectation_drops_connection_without_response() {
    let addr = start_proxy(
        None,
        vec![Expectation::close(RequestMatcher {
            path: Some("/drop".to_string()),
            ..Default::default()
        })],
    )
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /drop HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    // The proxy must close without writing a status line.
    let mut buf = Vec::new();
    let result =
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf)).await;
    match result {
        Ok(Ok(_)) => assert!(
            !buf.starts_with(b"HTTP/1.1 2") && !buf.starts_with(b"HTTP/1.1 404"),
            "expected no normal response, got: {}",
            String::from_utf8_lossy(&buf)
        ),
        Ok(Err(_)) => {} // reset is fine too
        Err(_) => panic!("connection was not closed"),
    }
}

#[tokio::test]
async fn forwarding_unmatched_tunnel_request_to_real_backend() {
    // A tiny plain-HTTP backend.
    let backend = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = backend.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-length: 7\r\n\r\nbackend",
                    )
                    .await;
            });
        }
    });

    // No expectations: tunneled requests fall through to forwarding.
    let addr = start_proxy(None, vec![]).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let connect = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        backend_addr.port(),
        backend_addr.port()
    );
    stream.write_all(connect.as_bytes()).await.unwrap();
    let response = read_http_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    stream
        .write_all(b"GET /upstream HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .await
        .unwrap();
    let response = read_http_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("backend"), "got: {}", response);
}
