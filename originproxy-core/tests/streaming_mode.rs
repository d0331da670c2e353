//! End-to-end streaming-mode coverage: a real TCP listener stands in for the
//! client, dispatch() does the sniff/route/tunnel dance, and a real TCP
//! backend stands in for the origin. Exercises spec.md §4.6 scenario S4 plus
//! the direction-asymmetric substitution from §4.3/§4.7.

use std::sync::Arc;

use originproxy_config::Config;
use originproxy_core::dispatcher::{ListenerKind, SharedState, dispatch};
use originproxy_core::host::LineReaderPool;
use originproxy_core::pool::{BufferPool, DEFAULT_BUFFER_SIZE};
use originproxy_core::route::RouteTable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_echo_backend() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            if socket.write_all(&buf[..n]).await.is_err() {
                return;
            }
        }
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

/// S4: a client sends a Host-bearing request on the plaintext port for a
/// `stream: true` route; the origin receives the request byte-identical to
/// what the client sent.
#[tokio::test]
async fn s4_host_sniff_tunnels_request_byte_identical() {
    let backend_addr = spawn_echo_backend().await;
    let yaml = format!(
        "routes:\n  - domain: a.example\n    target: \"http://{backend_addr}\"\n    stream: true\n"
    );
    let config = Config::parse(&yaml).unwrap();
    let state = state_for(&config);

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, peer) = proxy_listener.accept().await.unwrap();
        dispatch(socket, peer, ListenerKind::Http, state).await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = b"GET /p HTTP/1.1\r\nHost: a.example:8080\r\n\r\n";
    client.write_all(request).await.unwrap();

    let mut echoed = vec![0u8; request.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, request);
}

/// Streaming substitution is direction-asymmetric: the client-to-origin leg
/// undoes the rewrite (new -> old) while the origin-to-client leg applies it
/// (old -> new), so each side only ever sees its own vocabulary.
#[tokio::test]
async fn streaming_replace_is_direction_asymmetric() {
    let backend_addr = spawn_echo_backend().await;
    let yaml = format!(
        "routes:\n  - domain: a.example\n    target: \"http://{backend_addr}\"\n    stream: true\n    replaces:\n      - old: internal\n        new: public\n"
    );
    let config = Config::parse(&yaml).unwrap();
    let state = state_for(&config);

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, peer) = proxy_listener.accept().await.unwrap();
        dispatch(socket, peer, ListenerKind::Http, state).await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    // The client speaks "public"; the echo backend receives "internal"
    // because downstream->upstream undoes the rewrite.
    let request = b"GET /public HTTP/1.1\r\nHost: a.example\r\n\r\n";
    client.write_all(request).await.unwrap();

    let mut echoed = vec![0u8; request.len()];
    client.read_exact(&mut echoed).await.unwrap();
    let echoed_text = String::from_utf8(echoed).unwrap();
    assert!(echoed_text.contains("internal"));
    assert!(!echoed_text.contains("/public "));
}

/// A sniffed host with no routing-table entry is a terminal, silent close —
/// no bytes are written back and no panic occurs (spec.md §4.6 step 4, §7
/// Route-miss).
#[tokio::test]
async fn route_miss_closes_the_connection_silently() {
    let config = Config::parse("routes: []\n").unwrap();
    let state = state_for(&config);

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, peer) = proxy_listener.accept().await.unwrap();
        dispatch(socket, peer, ListenerKind::Http, state).await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: nowhere.example\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}
