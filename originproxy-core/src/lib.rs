pub mod dispatcher;
pub mod error;
pub mod host;
pub mod http_rewrite;
pub mod metrics;
pub mod peek;
pub mod pool;
pub mod replace;
pub mod route;
pub mod sni;
pub mod tls;
pub mod tunnel;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use dispatcher::{ListenerKind, SharedState};
use host::LineReaderPool;
use originproxy_config::Config;
use pool::{BufferPool, DEFAULT_BUFFER_SIZE};
use route::RouteTable;
use tls::TlsTerminator;

/// Runs the proxy until `shutdown_rx` fires or a bind failure aborts
/// startup. Binds every configured plaintext and TLS listener up front —
/// per spec.md §6, failure to bind any listener is fatal.
pub async fn run_proxy(
    config: Config,
    registry: Option<Registry>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let routes = Arc::new(RouteTable::from_config(&config));
    if routes.is_empty() {
        info!("starting with an empty route table; every connection will be a route miss");
    }

    let tls = if config.tls_listen_addrs.is_empty() {
        None
    } else {
        let cache_dir = config.tls_dir.as_ref().map(std::path::PathBuf::from);
        Some(Arc::new(TlsTerminator::new(
            routes.domains().map(str::to_string),
            cache_dir,
            true,
        )))
    };

    let metrics = registry.map(|r| Arc::new(metrics::Metrics::new(&r)));

    let state = SharedState {
        routes,
        tls,
        pool: Arc::new(BufferPool::new(DEFAULT_BUFFER_SIZE)),
        line_pool: Arc::new(LineReaderPool::new()),
        metrics,
        insecure_upstream_tls: config.insecure_upstream_tls,
        timeouts: Arc::new(config.timeouts.clone()),
        allowlist: Arc::new(config.allowlist.clone()),
    };

    let mut http_listeners = Vec::new();
    for addr_str in &config.listen_addrs {
        let addr: SocketAddr = addr_str.parse()?;
        info!(%addr, "binding plaintext listener");
        http_listeners.push(TcpListener::bind(addr).await?);
    }

    let mut tls_listeners = Vec::new();
    for addr_str in &config.tls_listen_addrs {
        let addr: SocketAddr = addr_str.parse()?;
        info!(%addr, "binding tls listener");
        tls_listeners.push(TcpListener::bind(addr).await?);
    }

    info!("proxy started, waiting for connections");

    loop {
        let mut accepts = FuturesUnordered::new();
        for listener in &http_listeners {
            accepts.push(accept_tagged(listener, ListenerKind::Http));
        }
        for listener in &tls_listeners {
            accepts.push(accept_tagged(listener, ListenerKind::Tls));
        }

        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("received shutdown signal");
                break;
            }
            Some(result) = accepts.next() => {
                match result {
                    Ok((socket, addr, kind)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            dispatcher::dispatch(socket, addr, kind, state).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                    }
                }
            }
        }
    }

    info!("shutting down proxy");
    Ok(())
}

async fn accept_tagged(
    listener: &TcpListener,
    kind: ListenerKind,
) -> std::io::Result<(tokio::net::TcpStream, SocketAddr, ListenerKind)> {
    let (socket, addr) = listener.accept().await?;
    Ok((socket, addr, kind))
}
