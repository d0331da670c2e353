//! Upstream dialing: connects to a route's `target`, either plain TCP or
//! TCP wrapped in a client TLS handshake.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use url::Url;

#[derive(Debug)]
pub enum DialError {
    UnparseableTarget(String),
    UnsupportedScheme(String),
    MissingHost,
    Connect(std::io::Error),
    Tls(std::io::Error),
    InvalidServerName(String),
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialError::UnparseableTarget(t) => write!(f, "unparseable target {t:?}"),
            DialError::UnsupportedScheme(s) => write!(f, "unsupported upstream scheme {s:?}"),
            DialError::MissingHost => write!(f, "target has no host"),
            DialError::Connect(e) => write!(f, "upstream connect failed: {e}"),
            DialError::Tls(e) => write!(f, "upstream TLS handshake failed: {e}"),
            DialError::InvalidServerName(h) => write!(f, "invalid upstream server name {h:?}"),
        }
    }
}

impl std::error::Error for DialError {}

/// Either half of a dialed upstream connection, unified behind one type so
/// callers (the tunnel, the HTTP rewriter) don't need to be generic over
/// plaintext vs. TLS.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl tokio::io::AsyncRead for UpstreamStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for UpstreamStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dials `target` (`http://host[:port]` or `https://host[:port]`) and
/// returns the connected stream plus the upstream hostname (used to set the
/// forwarded request's `Host` header in rewrite mode).
///
/// `insecure_tls` disables peer certificate verification for `https`
/// targets — a deliberate trust-decoupling choice per spec.md §4.8/§9, off
/// by default and only ever on when the operator's configuration asks for
/// it.
pub async fn dial(target: &str, insecure_tls: bool) -> Result<(UpstreamStream, String), DialError> {
    let url = Url::parse(target).map_err(|_| DialError::UnparseableTarget(target.to_string()))?;
    let host = url.host_str().ok_or(DialError::MissingHost)?.to_string();

    match url.scheme() {
        "http" => {
            let port = url.port().unwrap_or(80);
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(DialError::Connect)?;
            Ok((UpstreamStream::Plain(stream), host))
        }
        "https" => {
            let port = url.port().unwrap_or(443);
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(DialError::Connect)?;
            let connector = TlsConnector::from(Arc::new(tls_client_config(insecure_tls)));
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| DialError::InvalidServerName(host.clone()))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(DialError::Tls)?;
            Ok((UpstreamStream::Tls(Box::new(tls_stream)), host))
        }
        other => Err(DialError::UnsupportedScheme(other.to_string())),
    }
}

fn tls_client_config(insecure: bool) -> rustls::ClientConfig {
    if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// A certificate verifier that accepts anything. Only reachable when a
/// route's configuration explicitly opts into `insecure_upstream_tls`.
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
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
