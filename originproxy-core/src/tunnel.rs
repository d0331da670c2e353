//! The bidirectional tunnel: two parallel copy loops joined at a barrier,
//! using pooled scratch buffers so steady-state proxying doesn't allocate.
//!
//! Ported from the Go original's `tunnel`/`bytesPool` pair (`server.go`),
//! restructured as a `tokio::try_join!` over two `tokio::io::copy`-style
//! loops per spec.md §4.4/§9's recommendation for ownership-typed languages.
//! Each read is bounded by an idle deadline (`Timeouts.idle`), and every
//! chunk forwarded is reported through `on_bytes` to drive the
//! `originproxy_bytes_transferred_total` metric.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::pool::BufferPool;

/// Copies bytes both ways between `a` and `b` until either side hits EOF, an
/// error, or the idle deadline elapses with no data in either direction.
/// Returns the first non-EOF error encountered, or `Ok(())` on a clean
/// close. Each half is closed by shutting down its write side once the
/// other direction finishes, which unblocks any read still in flight.
pub async fn tunnel<A, B, F>(a: A, b: B, pool: &BufferPool, idle: Duration, on_bytes: F) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&'static str, u64),
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let mut buf = pool.acquire();
        let result = copy_with_idle_timeout(&mut a_read, &mut b_write, &mut buf, idle, |n| on_bytes("upstream", n)).await;
        let _ = b_write.shutdown().await;
        result
    };
    let b_to_a = async {
        let mut buf = pool.acquire();
        let result = copy_with_idle_timeout(&mut b_read, &mut a_write, &mut buf, idle, |n| on_bytes("downstream", n)).await;
        let _ = a_write.shutdown().await;
        result
    };

    let (r1, r2) = tokio::join!(a_to_b, b_to_a);
    r1.and(r2)
}

/// Copies `reader` into `writer` until EOF, resetting the idle deadline on
/// every read. `record` is called with the size of each chunk forwarded,
/// after the write that delivered it succeeds.
pub async fn copy_with_idle_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    idle: Duration,
    mut record: impl FnMut(u64),
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = match timeout(idle, reader.read(buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle timeout exceeded")),
        };
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        record(n as u64);
    }
}
