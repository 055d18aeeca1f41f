//! Bidirectional byte pump between two streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Default read size per direction.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Which side of the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Orderly close (zero-length read) on this side.
    Closed(Side),
    /// Read or write error on this side.
    Failed(Side),
}

/// Byte counts and termination reason of one pump run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub end: PumpEnd,
}

/// Copy bytes between `a` and `b` until either side closes or fails, then
/// close both.
///
/// Each chunk read from one side is written unmodified to the other before the
/// next read; a slow writer therefore stalls that direction only through the
/// natural blocking of `write_all`. I/O errors end the pump exactly like an
/// orderly close and are only reported through [`PumpStats::end`].
pub async fn pump<A, B>(mut a: A, mut b: B, chunk_size: usize) -> PumpStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let chunk_size = chunk_size.max(1);
    let mut buf_a = vec![0u8; chunk_size];
    let mut buf_b = vec![0u8; chunk_size];
    let mut a_to_b: u64 = 0;
    let mut b_to_a: u64 = 0;

    let end = loop {
        tokio::select! {
            result = a.read(&mut buf_a) => match result {
                Ok(0) => break PumpEnd::Closed(Side::A),
                Ok(n) => {
                    if let Err(e) = b.write_all(&buf_a[..n]).await {
                        debug!(error = %e, "pump write to B failed");
                        break PumpEnd::Failed(Side::B);
                    }
                    a_to_b += n as u64;
                }
                Err(e) => {
                    debug!(error = %e, "pump read from A failed");
                    break PumpEnd::Failed(Side::A);
                }
            },
            result = b.read(&mut buf_b) => match result {
                Ok(0) => break PumpEnd::Closed(Side::B),
                Ok(n) => {
                    if let Err(e) = a.write_all(&buf_b[..n]).await {
                        debug!(error = %e, "pump write to A failed");
                        break PumpEnd::Failed(Side::A);
                    }
                    b_to_a += n as u64;
                }
                Err(e) => {
                    debug!(error = %e, "pump read from B failed");
                    break PumpEnd::Failed(Side::B);
                }
            },
        }
    };

    // Close both; errors here mean the side is already gone.
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
    drop(a);
    drop(b);

    PumpStats { a_to_b, b_to_a, end }
}
