//! Error taxonomy for the data path.
//!
//! The five kinds below classify every failure a connection handler can hit.
//! `Transport` is the only one that is never logged — it covers the peer
//! simply closing the socket. Everything else is logged once, at the point
//! the connection is torn down; nothing here is retried.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ProxyError {
    /// Peer closed the connection, or the OS reports "closed network
    /// connection". Not an error worth logging.
    Transport(io::Error),
    /// Malformed TLS ClientHello, malformed HTTP request/response, or
    /// truncated headers.
    Parse(String),
    /// Sniffed host has no entry in the route table.
    RouteMiss(String),
    /// Dialing or TLS-handshaking to the upstream origin failed.
    UpstreamUnreachable(io::Error),
    /// Body decompression failed, or content didn't match its declared
    /// encoding.
    Rewrite(String),
    /// Startup-only: bad configuration, unbindable listener. Always fatal.
    Configuration(String),
}

impl ProxyError {
    /// True if this error represents a clean, expected connection close that
    /// should not be logged as a failure.
    pub fn is_transport_closed(&self) -> bool {
        match self {
            ProxyError::Transport(e) => is_closed_connection(e),
            _ => false,
        }
    }
}

fn is_closed_connection(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Transport(e) => write!(f, "transport closed: {e}"),
            ProxyError::Parse(msg) => write!(f, "parse failure: {msg}"),
            ProxyError::RouteMiss(host) => write!(f, "no route for host {host:?}"),
            ProxyError::UpstreamUnreachable(e) => write!(f, "upstream unreachable: {e}"),
            ProxyError::Rewrite(msg) => write!(f, "rewrite failure: {msg}"),
            ProxyError::Configuration(msg) => write!(f, "configuration failure: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        if is_closed_connection(&e) {
            ProxyError::Transport(e)
        } else {
            ProxyError::UpstreamUnreachable(e)
        }
    }
}
