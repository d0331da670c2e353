//! Structured HTTP/1.1 request/response rewrite mode.
//!
//! `httparse` tokenizes the request/response line and headers; this module
//! owns body reading (content-length and chunked) and all reconstruction —
//! the "black-box reader/writer" spec.md §1 describes as an external
//! collaborator is the tokenizer half only.

use std::net::SocketAddr;

use flate2::read::{DeflateDecoder, GzDecoder};
use std::io::Read;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::peek::PeekStream;
use crate::route::Route;

/// Bodies larger than this (after decompression) pass through unmodified;
/// header rewrites still apply. Bounds per-request memory use.
pub const MAX_BODY_REWRITE_SIZE: usize = 8 * 1024 * 1024;

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug)]
pub enum RewriteError {
    Truncated,
    HeadTooLarge,
    Parse(String),
    Io(std::io::Error),
    BodyTooLarge,
    InvalidChunkedEncoding,
}

impl std::fmt::Display for RewriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RewriteError::Truncated => write!(f, "truncated HTTP message"),
            RewriteError::HeadTooLarge => write!(f, "request/response head exceeded size limit"),
            RewriteError::Parse(msg) => write!(f, "HTTP parse failure: {msg}"),
            RewriteError::Io(e) => write!(f, "io error: {e}"),
            RewriteError::BodyTooLarge => write!(f, "body exceeded rewrite size limit"),
            RewriteError::InvalidChunkedEncoding => write!(f, "invalid chunked encoding"),
        }
    }
}

impl std::error::Error for RewriteError {}

impl From<std::io::Error> for RewriteError {
    fn from(e: std::io::Error) -> Self {
        RewriteError::Io(e)
    }
}

/// A header list preserving insertion order, matched case-insensitively.
#[derive(Debug, Clone, Default)]
struct Headers(Vec<(String, Vec<u8>)>);

impl Headers {
    fn get(&self, name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    fn set(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        let value = value.into();
        if let Some(entry) = self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            entry.1 = value;
        } else {
            self.0.push((name.to_string(), value));
        }
    }

    fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    fn append_comma(&mut self, name: &str, suffix: &str) {
        match self.get_str(name) {
            Some(existing) => {
                let joined = format!("{existing}, {suffix}");
                self.set(name, joined);
            }
            None => self.set(name, suffix.to_string()),
        }
    }
}

struct RawRequest {
    method: String,
    target: String,
    version: u8,
    headers: Headers,
    body: Vec<u8>,
}

struct RawResponse {
    version: u8,
    code: u16,
    reason: String,
    headers: Headers,
    body: Vec<u8>,
}

/// Reads bytes from `reader` until the blank line ending the head, or
/// `MAX_HEAD_SIZE` is reached. Returns the full head bytes and any body
/// bytes read past it in the same chunk.
async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, RewriteError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        if find_head_end(&buf).is_some() {
            return Ok(buf);
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(RewriteError::HeadTooLarge);
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(RewriteError::Truncated);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_headers(raw: &[httparse::Header<'_>]) -> Headers {
    Headers(
        raw.iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
    )
}

async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RawRequest, RewriteError> {
    let head = read_head(reader).await?;
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req
        .parse(&head)
        .map_err(|e| RewriteError::Parse(e.to_string()))?;
    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(RewriteError::Truncated),
    };
    let headers = parse_headers(req.headers);
    let leftover = head[consumed..].to_vec();
    let body = read_body(reader, &headers, leftover).await?;
    Ok(RawRequest {
        method: req.method.unwrap_or("GET").to_string(),
        target: req.path.unwrap_or("/").to_string(),
        version: req.version.unwrap_or(1),
        headers,
        body,
    })
}

async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RawResponse, RewriteError> {
    let head = read_head(reader).await?;
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut header_storage);
    let status = resp
        .parse(&head)
        .map_err(|e| RewriteError::Parse(e.to_string()))?;
    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(RewriteError::Truncated),
    };
    let headers = parse_headers(resp.headers);
    let leftover = head[consumed..].to_vec();
    let body = read_body(reader, &headers, leftover).await?;
    Ok(RawResponse {
        version: resp.version.unwrap_or(1),
        code: resp.code.unwrap_or(200),
        reason: resp.reason.unwrap_or("").to_string(),
        headers,
        body,
    })
}

/// Reads the body following a head, honoring `Content-Length` or
/// `Transfer-Encoding: chunked`. A response/request with neither is
/// treated as bodyless (correct for the cases this proxy forwards, since
/// both sides always send `Connection: close` and nothing here speaks
/// HTTP/1.0 keep-alive-without-length semantics).
async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    headers: &Headers,
    leftover: Vec<u8>,
) -> Result<Vec<u8>, RewriteError> {
    let chunked = headers
        .get_str("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));

    if chunked {
        return read_chunked_body(reader, leftover).await;
    }

    let content_length: usize = match headers.get_str("content-length") {
        Some(v) => v.trim().parse().unwrap_or(0),
        None => 0,
    };
    if content_length == 0 {
        return Ok(leftover);
    }

    let mut body = leftover;
    body.reserve(content_length.saturating_sub(body.len()));
    while body.len() < content_length {
        let mut chunk = [0u8; 8192];
        let want = (content_length - body.len()).min(chunk.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(RewriteError::Truncated);
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(body)
}

/// Decodes a chunked body. Not bounded by [`MAX_BODY_REWRITE_SIZE`] at read
/// time (that ceiling only gates whether substitution is attempted) but
/// capped at a generous hard limit to bound memory against a misbehaving
/// origin.
async fn read_chunked_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    leftover: Vec<u8>,
) -> Result<Vec<u8>, RewriteError> {
    const HARD_LIMIT: usize = 64 * 1024 * 1024;
    let mut buffered = BufReader::new(PeekStream::new(reader, leftover));
    let mut body = Vec::new();

    loop {
        let mut size_line = Vec::new();
        let n = tokio::io::AsyncBufReadExt::read_until(&mut buffered, b'\n', &mut size_line).await?;
        if n == 0 {
            return Err(RewriteError::InvalidChunkedEncoding);
        }
        let trimmed = trim_crlf(&size_line);
        let size_str = std::str::from_utf8(trimmed)
            .ok()
            .and_then(|s| s.split(';').next())
            .map(str::trim)
            .ok_or(RewriteError::InvalidChunkedEncoding)?;
        let size = usize::from_str_radix(size_str, 16).map_err(|_| RewriteError::InvalidChunkedEncoding)?;

        if size == 0 {
            loop {
                let mut trailer = Vec::new();
                tokio::io::AsyncBufReadExt::read_until(&mut buffered, b'\n', &mut trailer).await?;
                if trim_crlf(&trailer).is_empty() {
                    break;
                }
            }
            return Ok(body);
        }

        if body.len() + size > HARD_LIMIT {
            return Err(RewriteError::BodyTooLarge);
        }
        let mut chunk_data = vec![0u8; size];
        buffered.read_exact(&mut chunk_data).await?;
        body.extend_from_slice(&chunk_data);

        let mut crlf = [0u8; 2];
        buffered.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(RewriteError::InvalidChunkedEncoding);
        }
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn is_rewritable_content_type(headers: &Headers) -> bool {
    match headers.get_str("content-type") {
        Some(ct) => {
            let lower = ct.to_ascii_lowercase();
            lower.starts_with("text/") || lower.starts_with("application/javascript")
        }
        None => false,
    }
}

/// Decompresses `body` per `Content-Encoding`. Unrecognized or unsupported
/// encodings (including `br`, for which no pack-grounded crate is
/// available — see DESIGN.md) are passed through undecoded, which the
/// caller treats the same as "not eligible for rewrite".
fn decompress(body: &[u8], content_encoding: Option<&str>) -> Option<Vec<u8>> {
    match content_encoding.map(str::to_ascii_lowercase).as_deref() {
        None | Some("") | Some("identity") => Some(body.to_vec()),
        Some("gzip") => {
            let mut out = Vec::new();
            GzDecoder::new(body).read_to_end(&mut out).ok()?;
            Some(out)
        }
        Some("deflate") => {
            let mut out = Vec::new();
            DeflateDecoder::new(body).read_to_end(&mut out).ok()?;
            Some(out)
        }
        _ => None,
    }
}

/// Applies every configured `replace` to `body`, in order, using the
/// direction-correct substitution (`old -> new` for responses, `new -> old`
/// for requests, matching the streaming-mode asymmetry in spec.md §4.3).
fn substitute_body(mut body: Vec<u8>, route: &Route, reverse: bool) -> Vec<u8> {
    for r in &route.replaces {
        let (from, to) = if reverse {
            (&r.new, &r.old)
        } else {
            (&r.old, &r.new)
        };
        if from.is_empty() {
            continue;
        }
        body = replace_all_bytes(&body, from, to);
    }
    body
}

fn replace_all_bytes(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(from) {
            out.extend_from_slice(to);
            i += from.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

fn substitute_header_if_present(headers: &mut Headers, name: &str, route: &Route, reverse: bool) {
    if let Some(value) = headers.get(name) {
        let rewritten = substitute_body(value.to_vec(), route, reverse);
        headers.set(name, rewritten);
    }
}

/// Rewrites and forwards one request/response pair between `downstream` and
/// `upstream`. `client_addr` is the sniffed remote address used for
/// `X-Forwarded-For`; `upstream_host` is the hostname dialing resolved,
/// used for the forwarded request's `Host` header.
pub async fn rewrite_and_forward<D, U>(
    downstream: &mut D,
    upstream: &mut U,
    route: &Route,
    upstream_host: &str,
    client_addr: SocketAddr,
) -> Result<(), RewriteError>
where
    D: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = read_request(downstream).await?;
    rewrite_request(&mut request, route, upstream_host, client_addr);
    let raw = serialize_request(&request);
    upstream.write_all(&raw).await?;

    let mut response = read_response(upstream).await?;
    rewrite_response(&mut response, route, request.headers.get("referer").is_some());
    let raw = serialize_response(&response);
    downstream.write_all(&raw).await?;
    downstream.flush().await?;
    Ok(())
}

fn rewrite_request(request: &mut RawRequest, route: &Route, upstream_host: &str, client_addr: SocketAddr) {
    request.headers.set("Host", upstream_host.to_string());
    request.headers.set("Connection", "close");

    if route.header_forwarded_for {
        request.headers.append_comma("X-Forwarded-For", &client_addr.to_string());
    }

    if !route.replaces.is_empty() {
        let content_length: usize = request
            .headers
            .get_str("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        if content_length > 0 && is_rewritable_content_type(&request.headers) {
            let encoding = request.headers.get_str("content-encoding").map(str::to_string);
            if let Some(decoded) = decompress(&request.body, encoding.as_deref()) {
                if decoded.len() <= MAX_BODY_REWRITE_SIZE {
                    let rewritten = substitute_body(decoded, route, true);
                    request.headers.set("Content-Length", rewritten.len().to_string());
                    request.headers.remove("Content-Encoding");
                    request.body = rewritten;
                }
            }
        }

        substitute_header_if_present(&mut request.headers, "Referer", route, true);
        substitute_header_if_present(&mut request.headers, "Origin", route, true);
    }
}

fn rewrite_response(response: &mut RawResponse, route: &Route, had_referer: bool) {
    if !route.replaces.is_empty() {
        let content_length: usize = response
            .headers
            .get_str("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        if content_length > 0 && is_rewritable_content_type(&response.headers) {
            let encoding = response.headers.get_str("content-encoding").map(str::to_string);
            if let Some(decoded) = decompress(&response.body, encoding.as_deref()) {
                if decoded.len() <= MAX_BODY_REWRITE_SIZE {
                    let rewritten = substitute_body(decoded, route, false);
                    response.headers.set("Content-Length", rewritten.len().to_string());
                    response.headers.remove("Content-Encoding");
                    response.body = rewritten;
                }
            }
        }

        substitute_header_if_present(&mut response.headers, "Timing-Allow-Origin", route, false);
        if (300..400).contains(&response.code) {
            substitute_header_if_present(&mut response.headers, "Location", route, false);
        }
    }

    if had_referer {
        response.headers.set("Access-Control-Allow-Origin", "*");
    }
    response.headers.remove("Content-Security-Policy");
    response.headers.set("Connection", "close");
}

fn serialize_request(request: &RawRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + request.body.len());
    out.extend_from_slice(request.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.target.as_bytes());
    out.extend_from_slice(format!(" HTTP/1.{}\r\n", request.version).as_bytes());
    write_headers(&mut out, &request.headers);
    out.extend_from_slice(&request.body);
    out
}

fn serialize_response(response: &RawResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + response.body.len());
    out.extend_from_slice(format!("HTTP/1.{} {} {}\r\n", response.version, response.code, response.reason).as_bytes());
    write_headers(&mut out, &response.headers);
    out.extend_from_slice(&response.body);
    out
}

fn write_headers(out: &mut Vec<u8>, headers: &Headers) {
    for (name, value) in &headers.0 {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use originproxy_config::Config;

    fn route_with_replace(old: &str, new: &str) -> Route {
        let yaml = format!(
            "routes:\n  - domain: a.example\n    target: \"http://origin:80\"\n    replaces:\n      - old: \"{old}\"\n        new: \"{new}\"\n"
        );
        let config = Config::parse(&yaml).unwrap();
        Route::from(&config.routes[0])
    }

    fn route_without_replace() -> Route {
        let config = Config::parse("routes:\n  - domain: a.example\n    target: \"http://origin:80\"\n").unwrap();
        Route::from(&config.routes[0])
    }

    #[tokio::test]
    async fn octet_stream_body_is_never_rewritten() {
        let body = b"old-value".to_vec();
        let raw = format!(
            "POST / HTTP/1.1\r\nHost: x\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut full = raw.into_bytes();
        full.extend_from_slice(&body);

        let mut request = read_request(&mut &full[..]).await.unwrap();
        let route = route_with_replace("old-value", "new-value");
        rewrite_request(&mut request, &route, "origin", "127.0.0.1:9".parse().unwrap());
        assert_eq!(request.body, b"old-value");
    }

    #[tokio::test]
    async fn nine_mib_text_body_skips_substitution_but_keeps_header_rewrite() {
        let body = vec![b'x'; 9 * 1024 * 1024];
        let raw = format!(
            "POST / HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nReferer: http://old-value/\r\n\r\n",
            body.len()
        );
        let mut full = raw.into_bytes();
        full.extend_from_slice(&body);

        let mut request = read_request(&mut &full[..]).await.unwrap();
        let route = route_with_replace("old-value", "new-value");
        rewrite_request(&mut request, &route, "origin", "127.0.0.1:9".parse().unwrap());
        assert_eq!(request.body.len(), 9 * 1024 * 1024);
        // Header substitution still applies even though the body passed through.
        assert_eq!(request.headers.get_str("referer"), Some("http://new-value/"));
    }

    #[tokio::test]
    async fn xff_append_joins_existing_value() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n";
        let mut request = read_request(&mut &raw[..]).await.unwrap();
        let mut route = route_without_replace();
        route.header_forwarded_for = true;
        rewrite_request(&mut request, &route, "origin", "203.0.113.9:1234".parse().unwrap());
        assert_eq!(
            request.headers.get_str("x-forwarded-for"),
            Some("10.0.0.1, 203.0.113.9:1234")
        );
    }

    #[tokio::test]
    async fn response_csp_is_stripped_and_cors_added_when_referer_present() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Security-Policy: default-src 'self'\r\nContent-Length: 0\r\n\r\n";
        let mut response = read_response(&mut &raw[..]).await.unwrap();
        let route = route_without_replace();
        rewrite_response(&mut response, &route, true);
        assert!(response.headers.get("content-security-policy").is_none());
        assert_eq!(response.headers.get_str("access-control-allow-origin"), Some("*"));
        assert_eq!(response.headers.get_str("connection"), Some("close"));
    }

    #[tokio::test]
    async fn chunked_request_body_is_decoded() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let request = read_request(&mut &raw[..]).await.unwrap();
        assert_eq!(request.body, b"Wikipedia");
    }

    #[test]
    fn replace_all_bytes_is_non_overlapping_left_to_right() {
        assert_eq!(replace_all_bytes(b"aaaa", b"aa", b"b"), b"bb");
    }
}
