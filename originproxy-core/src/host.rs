//! HTTP/1.1 Host header and request-path extraction over a byte prefix.
//!
//! Both functions read just enough of a request to answer one question and
//! stop; neither parses the full request. They share [`LineReaderPool`] so a
//! busy proxy doesn't allocate a line buffer per connection.

use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

#[derive(Debug)]
pub enum HostError {
    /// The stream closed before a complete request line / header block
    /// arrived.
    Truncated,
    /// No `Host` header was present before the blank line.
    NoHostHeader,
    Io(std::io::Error),
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostError::Truncated => write!(f, "truncated request"),
            HostError::NoHostHeader => write!(f, "no Host header"),
            HostError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for HostError {}

impl From<std::io::Error> for HostError {
    fn from(e: std::io::Error) -> Self {
        HostError::Io(e)
    }
}

/// A free list of reusable line buffers, avoiding a fresh `Vec` per request
/// line read.
pub struct LineReaderPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl Default for LineReaderPool {
    fn default() -> Self {
        Self::new()
    }
}

impl LineReaderPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self) -> Vec<u8> {
        let mut buf = self.free.lock().expect("line pool mutex poisoned").pop().unwrap_or_default();
        buf.clear();
        buf
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        self.free.lock().expect("line pool mutex poisoned").push(buf);
    }
}

/// Reads lines off `reader` until the blank line terminating the header
/// block, returning the trimmed value of `key` (case-insensitive on the
/// header name) if present.
pub async fn extract_header<R: AsyncRead + Unpin>(
    reader: R,
    key: &[u8],
    pool: &LineReaderPool,
) -> Result<String, HostError> {
    let mut buf = BufReader::new(reader);
    let mut line = pool.acquire();

    // Skip the request line.
    line.clear();
    let n = buf.read_until(b'\n', &mut line).await?;
    if n == 0 {
        pool.release(line);
        return Err(HostError::Truncated);
    }

    loop {
        line.clear();
        let n = buf.read_until(b'\n', &mut line).await?;
        if n == 0 {
            pool.release(line);
            return Err(HostError::Truncated);
        }
        let trimmed = trim_crlf(&line);
        if trimmed.is_empty() {
            pool.release(line);
            return Err(HostError::NoHostHeader);
        }
        if let Some(colon) = trimmed.iter().position(|&b| b == b':') {
            let name = &trimmed[..colon];
            if name.len() == key.len() && name.eq_ignore_ascii_case(key) {
                let value = String::from_utf8_lossy(trim_ascii_whitespace(&trimmed[colon + 1..]))
                    .into_owned();
                pool.release(line);
                return Ok(value);
            }
        }
    }
}

/// Returns the `Host` header value of an HTTP/1.1 request, lowercased and
/// with any `:port` suffix stripped.
pub async fn extract_host<R: AsyncRead + Unpin>(
    reader: R,
    pool: &LineReaderPool,
) -> Result<String, HostError> {
    let host = extract_header(reader, b"host", pool).await?;
    Ok(normalize_host(&host))
}

/// Returns the request-target (path) from the first line of an HTTP/1.1
/// request, e.g. `"GET /foo?x=1 HTTP/1.1"` → `"/foo?x=1"`.
pub async fn extract_path<R: AsyncRead + Unpin>(
    reader: R,
    pool: &LineReaderPool,
) -> Result<String, HostError> {
    let mut buf = BufReader::new(reader);
    let mut line = pool.acquire();
    let n = buf.read_until(b'\n', &mut line).await?;
    if n == 0 {
        pool.release(line);
        return Err(HostError::Truncated);
    }
    let trimmed = trim_crlf(&line);
    let first_space = trimmed.iter().position(|&b| b == b' ');
    let result = match first_space {
        Some(start) => {
            let rest = &trimmed[start + 1..];
            match rest.iter().position(|&b| b == b' ') {
                Some(end) => String::from_utf8_lossy(&rest[..end]).into_owned(),
                None => {
                    pool.release(line);
                    return Err(HostError::Truncated);
                }
            }
        }
        None => {
            pool.release(line);
            return Err(HostError::Truncated);
        }
    };
    pool.release(line);
    Ok(result)
}

/// Lowercases a sniffed host value and strips any trailing `:port`.
pub fn normalize_host(host: &str) -> String {
    let stripped = match host.rfind(':') {
        // An IPv6 literal like "[::1]" has colons before the closing
        // bracket; only treat a colon after the last ']' as a port split.
        Some(idx) if host[..idx].find(']').is_none_or(|b| b < idx) => &host[..idx],
        _ => host,
    };
    stripped.to_ascii_lowercase()
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn trim_ascii_whitespace(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(s.len());
    let end = s.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &s[start..end]
}
