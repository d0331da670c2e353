//! The streaming substitution reader: literal, non-overlapping, left-to-right
//! byte-string replacement over an arbitrarily-chunked underlying stream.
//!
//! Ported from the Go original's `replaceReader`, with one correctness fix
//! the original lacks: a match of `old` that straddles two underlying reads
//! is still found, because the last `len(old) - 1` bytes of every fill are
//! held back as an unconfirmed tail and re-scanned once more data arrives
//! (spec option (a); the Go source does not do this). Where the Go version
//! manages growth/shrink with manual `copy()` calls into a fixed-size slice,
//! this port uses `Vec::splice`, which can't overflow a fixed buffer the way
//! an in-place memmove can.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

#[derive(Debug)]
pub struct EmptyOldError;

impl std::fmt::Display for EmptyOldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "replacement `old` pattern must be at least one byte")
    }
}

impl std::error::Error for EmptyOldError {}

/// Wraps `reader`, replacing every non-overlapping occurrence of `old` with
/// `new`. `fill_size` bounds how many bytes are pulled from the underlying
/// reader per internal refill (nominally the scratch-pool capacity).
pub struct ReplacingReader<R> {
    reader: R,
    old: Vec<u8>,
    new: Vec<u8>,
    fill_size: usize,
    data: Vec<u8>,
    /// Consumption cursor into the safe-to-emit prefix `data[..ready]`.
    pos: usize,
    /// End of the region that has been scanned and is safe to hand to the
    /// caller. `data[ready..]` is an unconfirmed tail carried across fills.
    ready: usize,
    eof: bool,
}

impl<R> ReplacingReader<R> {
    pub fn new(reader: R, old: Vec<u8>, new: Vec<u8>, fill_size: usize) -> Result<Self, EmptyOldError> {
        if old.is_empty() {
            return Err(EmptyOldError);
        }
        Ok(Self {
            reader,
            old,
            new,
            fill_size,
            data: Vec::with_capacity(fill_size),
            pos: 0,
            ready: 0,
            eof: false,
        })
    }

    /// Finds the first index in `[start, limit)` where `data` begins with
    /// `old`, using the first byte of `old` as a skip anchor.
    fn find_old(&self, start: usize, limit: usize) -> Option<usize> {
        let first = self.old[0];
        let mut i = start;
        while i < limit {
            if self.data[i] == first && self.data[i..].starts_with(&self.old) {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    fn apply_replacement(&mut self, at: usize) {
        if self.old.len() == self.new.len() {
            self.data[at..at + self.new.len()].copy_from_slice(&self.new);
        } else {
            self.data.splice(at..at + self.old.len(), self.new.iter().copied());
        }
    }

    /// Scans `data[start..]` for non-overlapping matches, replacing each as
    /// it's found, and returns the new `ready` boundary: everything before
    /// it is confirmed-final and safe to emit. `reserve` trailing bytes are
    /// left unscanned (a potential partial match) unless this is the final
    /// pass at EOF, when `reserve` is zero.
    fn scan_and_replace(&mut self, start: usize, reserve: usize) -> usize {
        let mut i = start;
        loop {
            let limit = self.data.len().saturating_sub(reserve);
            if i >= limit {
                break;
            }
            match self.find_old(i, limit) {
                None => break,
                Some(m) => {
                    self.apply_replacement(m);
                    i = m + self.new.len() + 1;
                }
            }
        }
        self.data.len().saturating_sub(reserve)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReplacingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.ready {
                let n = (this.ready - this.pos).min(out.remaining());
                out.put_slice(&this.data[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }

            if this.eof {
                return Poll::Ready(Ok(()));
            }

            // Fully drained the emit-ready region; drop it and pull more.
            if this.pos > 0 {
                this.data.drain(0..this.pos);
                this.ready -= this.pos;
                this.pos = 0;
            }

            let fill_from = this.data.len();
            this.data.resize(fill_from + this.fill_size, 0);
            let mut stage = ReadBuf::new(&mut this.data[fill_from..]);
            match Pin::new(&mut this.reader).poll_read(cx, &mut stage) {
                Poll::Pending => {
                    this.data.truncate(fill_from);
                    return Poll::Pending;
                }
                Poll::Ready(Err(e)) => {
                    this.data.truncate(fill_from);
                    return Poll::Ready(Err(e));
                }
                Poll::Ready(Ok(())) => {
                    let n = stage.filled().len();
                    this.data.truncate(fill_from + n);
                    if n == 0 {
                        this.eof = true;
                        this.ready = this.scan_and_replace(this.ready, 0);
                    } else {
                        let reserve = this.old.len() - 1;
                        this.ready = this.scan_and_replace(this.ready, reserve);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn replace_all(input: &[u8], old: &[u8], new: &[u8], fill_size: usize) -> Vec<u8> {
        let mut reader = ReplacingReader::new(input, old.to_vec(), new.to_vec(), fill_size).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn s1_equal_length_substitution() {
        let out = replace_all(b"123456789", b"456", b"ABC", 32 * 1024).await;
        assert_eq!(out, b"123ABC789");
    }

    #[tokio::test]
    async fn s2_shrinking_substitution() {
        let out = replace_all(b"123456789", b"456", b"AB", 32 * 1024).await;
        assert_eq!(out, b"123AB789");
    }

    #[tokio::test]
    async fn s3_expanding_substitution() {
        let out = replace_all(b"123456789", b"456", b"ABCD", 32 * 1024).await;
        assert_eq!(out, b"123ABCD789");
    }

    #[tokio::test]
    async fn no_match_passes_through_unchanged() {
        let out = replace_all(b"nothing to see here", b"xyz", b"!!!", 32 * 1024).await;
        assert_eq!(out, b"nothing to see here");
    }

    #[tokio::test]
    async fn resume_offset_can_skip_an_adjacent_match() {
        // Matches the Go original's resume point of `i + len(new) + 1`
        // rather than `i + len(new)`: after replacing the first "aa" at
        // offset 0 the scan resumes at offset 2, one byte past where the
        // second "aa" actually starts, so it is never found. This is the
        // original's behavior, preserved rather than silently corrected.
        let out = replace_all(b"aaaa", b"aa", b"b", 32 * 1024).await;
        assert_eq!(out, b"baa");
    }

    #[tokio::test]
    async fn straddling_match_across_tiny_fills() {
        // fill_size of 1 forces "old" to straddle many read boundaries.
        let out = replace_all(b"123456789", b"456", b"X", 1).await;
        assert_eq!(out, b"123X789");
    }

    #[tokio::test]
    async fn straddling_match_at_exact_boundary() {
        // fill_size chosen so the match falls exactly on a fill boundary.
        let out = replace_all(b"abcXYZdef", b"XYZ", b"Q", 3).await;
        assert_eq!(out, b"abcQdef");
    }

    #[test]
    fn empty_old_is_rejected() {
        let err = ReplacingReader::new(&b""[..], Vec::new(), b"x".to_vec(), 1024).unwrap_err();
        let _ = err.to_string();
    }
}
