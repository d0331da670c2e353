//! TLS termination with an ACME-backed certificate resolver.
//!
//! The Go original's `acme.go` wraps `autocert.Manager`; the Rust
//! equivalent is `rustls-acme`'s `AcmeConfig`/`AcmeState`, which drives
//! certificate issuance/renewal as a background stream and exposes a
//! `rustls::ServerConfig`-compatible cert resolver. The domain whitelist is
//! the route table's key set (routes are static for the process lifetime).

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use rustls_acme::AcmeConfig;
use rustls_acme::caches::DirCache;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, warn};

/// Owns the ACME-driven `rustls::ServerConfig` and the background task that
/// keeps certificates current. Handshakes are served through
/// [`TlsTerminator::accept`].
pub struct TlsTerminator {
    acceptor: TlsAcceptor,
}

impl TlsTerminator {
    /// Builds a terminator serving `domains`, caching issued certificates
    /// under `cache_dir` (falling back to an in-memory cache if unset, for
    /// tests and ephemeral deployments). `production` selects Let's
    /// Encrypt's production directory; the staging directory is used
    /// otherwise to avoid burning production rate limits.
    pub fn new<I>(domains: I, cache_dir: Option<PathBuf>, production: bool) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = AcmeConfig::new(domains).directory_lets_encrypt(production);
        if let Some(dir) = cache_dir {
            config = config.cache(DirCache::new(dir));
        }
        let mut state = config.state();
        let server_config = Arc::new(
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(state.resolver()),
        );

        tokio::spawn(async move {
            while let Some(event) = state.next().await {
                match event {
                    Ok(ok) => debug!(?ok, "acme event"),
                    Err(err) => warn!(%err, "acme error"),
                }
            }
        });

        Self {
            acceptor: TlsAcceptor::from(server_config),
        }
    }

    /// Performs the server handshake over a stream that has already
    /// replayed its ClientHello prefix (see [`crate::peek::PeekStream`]),
    /// yielding a plaintext duplex stream layered atop the original
    /// transport.
    pub async fn accept<S>(&self, stream: S) -> std::io::Result<TlsStream<S>>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        self.acceptor.accept(stream).await
    }
}
