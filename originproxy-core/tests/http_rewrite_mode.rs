//! End-to-end HTTP rewrite-mode coverage: a real TCP backend plays the
//! origin server, dispatch() drives the full sniff/route/rewrite path over
//! real sockets. Unit-level rewrite behavior lives in http_rewrite.rs's own
//! `#[cfg(test)]` module; this file exercises the same rules wired through
//! the dispatcher (spec.md §4.6 scenario S6, §4.9).

use std::sync::Arc;

use originproxy_config::Config;
use originproxy_core::dispatcher::{ListenerKind, SharedState, dispatch};
use originproxy_core::host::LineReaderPool;
use originproxy_core::pool::{BufferPool, DEFAULT_BUFFER_SIZE};
use originproxy_core::route::RouteTable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A backend that reads one request, asserts its Host/X-Forwarded-For
/// headers, then replies with a fixed response carrying a CSP header that
/// the rewriter is expected to strip.
async fn spawn_asserting_backend(expected_host: &'static str) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = socket.read(&mut buf).await.unwrap();
        let request = String::from_utf8_lossy(&buf[..n]);

        assert!(request.contains(&format!("Host: {expected_host}")));
        assert!(request.contains("X-Forwarded-For: 203.0.113.9"));
        assert!(request.contains("Connection: close"));

        let response = b"HTTP/1.1 200 OK\r\nContent-Security-Policy: default-src 'self'\r\nContent-Length: 2\r\n\r\nok";
        socket.write_all(response).await.unwrap();
    });
    addr
}

fn state_for(config: &Config) -> SharedState {
    SharedState {
        routes: Arc::new(RouteTable::from_config(config)),
        tls: None,
        pool: Arc::new(BufferPool::new(DEFAULT_BUFFER_SIZE)),
        line_pool: Arc::new(LineReaderPool::new()),
        metrics: None,
        insecure_upstream_tls: false,
        timeouts: Arc::new(config.timeouts.clone()),
        allowlist: Arc::new(config.allowlist.clone()),
    }
}

#[tokio::test]
async fn rewrite_mode_sets_host_xff_and_strips_csp() {
    let backend_addr = spawn_asserting_backend("127.0.0.1").await;
    let yaml = format!(
        "routes:\n  - domain: a.example\n    target: \"http://{backend_addr}\"\n    http:\n      header_forwarded_for: true\n"
    );
    let config = Config::parse(&yaml).unwrap();
    let state = state_for(&config);

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();

    let handler = tokio::spawn(async move {
        let (socket, peer) = proxy_listener.accept().await.unwrap();
        dispatch(socket, peer, ListenerKind::Http, state).await;
    });

    // headerForwardedFor appends the dispatcher's observed peer address to
    // whatever X-Forwarded-For the client already sent, so the backend's
    // substring check on the client-supplied value still holds regardless
    // of what ephemeral loopback port this test runs with.
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\nX-Forwarded-For: 203.0.113.9\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    handler.await.unwrap();

    let response_text = String::from_utf8_lossy(&response);
    assert!(!response_text.contains("Content-Security-Policy"));
    assert!(response_text.contains("HTTP/1.1 200 OK"));
    assert!(response_text.ends_with("ok"));
}
