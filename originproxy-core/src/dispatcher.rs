//! Accept-loop orchestration: peek, sniff, route, then either redirect,
//! terminate TLS, or tunnel.
//!
//! Ported from the Go original's `handleHTTP`/`handleTLS` (`server.go`), with
//! the dual-mode selection from spec.md §4.9 and the replacing-reader
//! wrapping from §4.7 folded in as the two post-route-lookup branches.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use originproxy_config::Timeouts;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::host::{self, LineReaderPool};
use crate::metrics::Metrics;
use crate::peek::PeekStream;
use crate::pool::BufferPool;
use crate::replace::ReplacingReader;
use crate::route::RouteTable;
use crate::sni;
use crate::tls::TlsTerminator;
use crate::tunnel;
use crate::upstream;

/// Which port a connection arrived on, since the host inspector and the
/// forceTLS/redirect behavior both depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Http,
    Tls,
}

/// Everything a dispatched connection needs that isn't per-connection state:
/// shared, read-only, cloned cheaply per accept.
#[derive(Clone)]
pub struct SharedState {
    pub routes: Arc<RouteTable>,
    pub tls: Option<Arc<TlsTerminator>>,
    pub pool: Arc<BufferPool>,
    pub line_pool: Arc<LineReaderPool>,
    pub metrics: Option<Arc<Metrics>>,
    pub insecure_upstream_tls: bool,
    /// Process-wide `connect`/`client_hello`/`idle` deadlines (spec.md §9's
    /// per-route-timeout Open Question, resolved process-wide — see
    /// DESIGN.md).
    pub timeouts: Arc<Timeouts>,
    /// Optional wildcard hostname allowlist, checked before route lookup.
    pub allowlist: Arc<Option<Vec<String>>>,
}

/// True if `host` matches at least one configured allowlist pattern, or if
/// no allowlist is configured at all.
fn host_is_allowed(host: &str, allowlist: &Option<Vec<String>>) -> bool {
    match allowlist {
        None => true,
        Some(patterns) => patterns
            .iter()
            .any(|pattern| originproxy_config::matches_allowlist_pattern(host, pattern)),
    }
}

/// Handles one accepted connection end to end. Every error path is logged
/// here (per spec.md §4.6/§7) and absorbed — the accept loop never sees a
/// per-connection failure.
pub async fn dispatch<S>(stream: S, peer: SocketAddr, kind: ListenerKind, state: SharedState)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = dispatch_inner(stream, peer, kind, &state).await {
        if !e.is_transport_closed() {
            warn!(peer = %peer, error = %e, "connection handler error");
            if let Some(metrics) = &state.metrics {
                metrics.record_error(error_kind(&e));
            }
        }
    }
}

fn error_kind(e: &ProxyError) -> &'static str {
    match e {
        ProxyError::Transport(_) => "transport",
        ProxyError::Parse(_) => "parse",
        ProxyError::RouteMiss(_) => "route-miss",
        ProxyError::UpstreamUnreachable(_) => "upstream-unreachable",
        ProxyError::Rewrite(_) => "rewrite",
        ProxyError::Configuration(_) => "configuration",
    }
}

async fn dispatch_inner<S>(
    stream: S,
    peer: SocketAddr,
    kind: ListenerKind,
    state: &SharedState,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut inner = stream;
    let client_hello_timeout = Duration::from_secs(state.timeouts.client_hello);

    let (host, peeked) = match kind {
        ListenerKind::Http => {
            let mut captured = Vec::new();
            let host = {
                let tee = TeeReader {
                    inner: &mut inner,
                    captured: &mut captured,
                };
                timeout(client_hello_timeout, host::extract_host(tee, &state.line_pool))
                    .await
                    .map_err(|_| ProxyError::Parse("timed out waiting for request headers".to_string()))?
                    .map_err(|e| ProxyError::Parse(e.to_string()))?
            };
            (host, PeekStream::new(inner, captured))
        }
        ListenerKind::Tls => {
            let peeked = PeekStream::new(inner, Vec::new());
            let (record, probe) = timeout(client_hello_timeout, read_client_hello_record(peeked))
                .await
                .map_err(|_| ProxyError::Parse("timed out waiting for TLS ClientHello".to_string()))??;
            let host = sni::extract_sni(&record).map_err(|e| ProxyError::Parse(format!("{e:?}")))?;
            (host::normalize_host(&host), probe.wrap(record))
        }
    };

    if !host_is_allowed(&host, &state.allowlist) {
        debug!(host = %host, "rejected by allowlist");
        return Err(ProxyError::RouteMiss(host));
    }

    let route = state
        .routes
        .lookup(&host)
        .cloned()
        .ok_or_else(|| ProxyError::RouteMiss(host.clone()))?;

    if kind == ListenerKind::Http && route.force_tls {
        let mut probe = peeked;
        let path = host::extract_path(&mut probe, &state.line_pool)
            .await
            .map_err(|e| ProxyError::Parse(e.to_string()))?;
        return send_redirect(probe.into_inner(), &host, &path).await;
    }

    let guard = state
        .metrics
        .as_ref()
        .map(|m| m.connection_opened(&host, if route.stream { "stream" } else { "rewrite" }));

    let (upstream_stream, upstream_host) = timeout(
        Duration::from_secs(state.timeouts.connect),
        upstream::dial(&route.target, state.insecure_upstream_tls),
    )
    .await
    .map_err(|_| ProxyError::UpstreamUnreachable(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))?
    .map_err(|e| ProxyError::UpstreamUnreachable(std::io::Error::other(e.to_string())))?;

    let result = if kind == ListenerKind::Tls {
        let tls_terminator = state
            .tls
            .as_ref()
            .ok_or_else(|| ProxyError::Configuration("TLS requested but no terminator configured".into()))?;
        let tls_stream = tls_terminator.accept(peeked).await?;
        run_mode(tls_stream, upstream_stream, &route, peer, &upstream_host, state).await
    } else {
        run_mode(peeked, upstream_stream, &route, peer, &upstream_host, state).await
    };

    drop(guard);
    result
}

async fn run_mode<D, U>(
    mut downstream: D,
    mut upstream_stream: U,
    route: &crate::route::Route,
    peer: SocketAddr,
    upstream_host: &str,
    state: &SharedState,
) -> Result<(), ProxyError>
where
    D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if route.stream {
        debug!(host = %route.domain, peer = %peer, "entering streaming mode");
        stream_mode(downstream, upstream_stream, route, state).await
    } else {
        debug!(host = %route.domain, peer = %peer, "entering http rewrite mode");
        crate::http_rewrite::rewrite_and_forward(&mut downstream, &mut upstream_stream, route, upstream_host, peer)
            .await
            .map_err(|e| ProxyError::Rewrite(e.to_string()))
    }
}

async fn stream_mode<D, U>(
    downstream: D,
    upstream_stream: U,
    route: &crate::route::Route,
    state: &SharedState,
) -> Result<(), ProxyError>
where
    D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let idle = Duration::from_secs(state.timeouts.idle);
    let metrics = state.metrics.as_deref();
    let host = route.domain.as_str();
    let record = |direction: &'static str, n: u64| {
        if let Some(metrics) = metrics {
            metrics.record_bytes(host, direction, n);
        }
    };

    if route.replaces.is_empty() {
        tunnel::tunnel(downstream, upstream_stream, &state.pool, idle, record)
            .await
            .map_err(ProxyError::from)
    } else {
        // Downstream -> upstream undoes the rewrite (new -> old); upstream
        // -> downstream applies it (old -> new). See spec.md §4.3/§4.7.
        let (down_read, down_write) = tokio::io::split(downstream);
        let (up_read, up_write) = tokio::io::split(upstream_stream);

        let mut down_read = wrap_replaces(down_read, route, true);
        let mut up_read = wrap_replaces(up_read, route, false);
        let mut down_write = down_write;
        let mut up_write = up_write;

        let mut buf_a = state.pool.acquire();
        let mut buf_b = state.pool.acquire();

        let a_to_b = tunnel::copy_with_idle_timeout(&mut down_read, &mut up_write, &mut buf_a, idle, |n| {
            record("upstream", n)
        });
        let b_to_a = tunnel::copy_with_idle_timeout(&mut up_read, &mut down_write, &mut buf_b, idle, |n| {
            record("downstream", n)
        });
        let (r1, r2) = tokio::join!(a_to_b, b_to_a);
        let _ = up_write.shutdown().await;
        let _ = down_write.shutdown().await;
        r1.and(r2).map(|_| ()).map_err(ProxyError::from)
    }
}

/// Chains the route's ordered `replaces` into a single layered reader, one
/// [`ReplacingReader`] per substitution, applied in configuration order.
fn wrap_replaces<R>(reader: R, route: &crate::route::Route, reverse: bool) -> Box<dyn AsyncRead + Send + Unpin>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
    for r in &route.replaces {
        let (old, new) = if reverse { (r.new.clone(), r.old.clone()) } else { (r.old.clone(), r.new.clone()) };
        if old.is_empty() {
            continue;
        }
        boxed = Box::new(
            ReplacingReader::new(boxed, old, new, crate::pool::DEFAULT_BUFFER_SIZE)
                .expect("old is non-empty, checked above"),
        );
    }
    boxed
}

/// Reads just enough of the TLS record stream to extract a complete
/// ClientHello, returning the raw bytes consumed (to be re-prepended via
/// [`PeekStream::wrap`]) alongside the stream they were read from.
async fn read_client_hello_record<S>(mut peeked: PeekStream<S>) -> Result<(Vec<u8>, PeekStream<S>), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;

    const RECORD_HEADER_LEN: usize = 5;
    let mut header = [0u8; RECORD_HEADER_LEN];
    peeked.read_exact(&mut header).await?;
    if header[0] != 0x16 {
        return Err(ProxyError::Parse("not a TLS handshake record".to_string()));
    }
    let body_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut body = vec![0u8; body_len];
    peeked.read_exact(&mut body).await?;

    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + body_len);
    record.extend_from_slice(&header);
    record.extend_from_slice(&body);
    Ok((record, peeked))
}

/// Tees every byte read from `inner` into `captured`, so the exact bytes an
/// inspector consumed (per spec.md §4.2) can be re-prepended onto the
/// stream afterward via [`PeekStream::new`].
struct TeeReader<'a, S> {
    inner: &'a mut S,
    captured: &'a mut Vec<u8>,
}

impl<S: AsyncRead + Unpin> AsyncRead for TeeReader<'_, S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut *this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            this.captured.extend_from_slice(&buf.filled()[before..]);
        }
        result
    }
}

/// Writes exactly the §6 redirect response and closes the connection.
async fn send_redirect<S>(mut stream: S, host: &str, path: &str) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let response = format!("HTTP/1.1 302 Found\r\nLocation: https://{host}{path}\r\nConnection: close\r\n\r\n");
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    info!(host, path, "served forceTLS redirect");
    Ok(())
}
