//! Instrumented connection wrapper.
//!
//! [`TrackedConn`] wraps an upstream byte stream, updating a shared
//! activity timestamp and byte counters on every successful poll. The
//! wrapper owns the sole deregistration point: whichever path closes the
//! connection (EOF, error, forced shutdown, drop), the registry entry is
//! removed exactly once.

use super::{monotonic_nanos, Tracker};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use uuid::Uuid;

/// Shared counters between a wrapper and the registry.
///
/// `last_activity` is nanoseconds since the process epoch, written with a
/// plain atomic store on every successful read or write.
#[derive(Debug)]
pub struct ConnStats {
    last_activity: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl ConnStats {
    pub(crate) fn new() -> Self {
        Self {
            last_activity: AtomicU64::new(monotonic_nanos()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_activity.store(monotonic_nanos(), Ordering::Relaxed);
    }

    /// Last activity in nanoseconds since the process epoch.
    #[must_use]
    pub fn last_activity_nanos(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Total bytes read from the wrapped stream.
    #[must_use]
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Total bytes written to the wrapped stream.
    #[must_use]
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

/// A tracked upstream connection.
///
/// Implements `AsyncRead`/`AsyncWrite` by delegating to the inner stream
/// while recording activity. Close-once semantics are enforced with an
/// atomic flag; `Drop` is the deregistration point, so the registry never
/// holds a connection past its close.
pub struct TrackedConn<C> {
    inner: C,
    id: Uuid,
    stats: Arc<ConnStats>,
    tracker: Arc<Tracker>,
    closed: AtomicBool,
}

impl<C> TrackedConn<C> {
    pub(crate) fn new(inner: C, id: Uuid, stats: Arc<ConnStats>, tracker: Arc<Tracker>) -> Self {
        Self {
            inner,
            id,
            stats,
            tracker,
            closed: AtomicBool::new(false),
        }
    }

    /// Registry identity of this connection.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Handle to the shared counters, valid past the wrapper's close.
    #[must_use]
    pub fn stats(&self) -> Arc<ConnStats> {
        self.stats.clone()
    }

    /// Deregister, exactly once.
    fn close_once(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.tracker.deregister(self.id);
        }
    }

    /// During shutdown, connections already idle past the threshold refuse
    /// further I/O so the drain loop converges.
    fn refuse_io(&self) -> Option<io::Error> {
        if !self.tracker.is_shutting_down() {
            return None;
        }
        let idle = monotonic_nanos().saturating_sub(self.stats.last_activity_nanos());
        if idle >= self.tracker.idle_threshold().as_nanos() as u64 {
            Some(io::Error::other("connection reaped during shutdown drain"))
        } else {
            None
        }
    }
}

impl<C> Drop for TrackedConn<C> {
    fn drop(&mut self) {
        self.close_once();
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for TrackedConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.refuse_io() {
            return Poll::Ready(Err(err));
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.stats.touch();
                    this.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for TrackedConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = this.refuse_io() {
            return Poll::Ready(Err(err));
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.stats.touch();
                    this.stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(res) => {
                this.close_once();
                Poll::Ready(res)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_byte_counters() {
        let tracker = Tracker::new(Duration::from_secs(1));
        let (a, mut b) = duplex(1024);
        let mut conn = tracker.wrap(a, "role", "dest:80");
        let stats = conn.stats();

        conn.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        b.read_exact(&mut buf).await.unwrap();
        b.write_all(b"resp").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();

        assert_eq!(stats.bytes_out(), 7);
        assert_eq!(stats.bytes_in(), 4);
    }

    #[tokio::test]
    async fn test_activity_timestamp_advances() {
        let tracker = Tracker::new(Duration::from_secs(1));
        let (a, mut b) = duplex(64);
        let mut conn = tracker.wrap(a, "role", "dest:80");
        let stats = conn.stats();

        let initial = stats.last_activity_nanos();
        tokio::time::sleep(Duration::from_millis(2)).await;
        conn.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        b.read_exact(&mut one).await.unwrap();

        assert!(stats.last_activity_nanos() > initial);
    }

    #[tokio::test]
    async fn test_shutdown_deregisters_once() {
        let tracker = Tracker::new(Duration::from_secs(1));
        let (a, _b) = duplex(64);
        let mut conn = tracker.wrap(a, "role", "dest:80");

        conn.shutdown().await.unwrap();
        assert!(tracker.is_empty());

        // Dropping after an explicit shutdown must not double-remove.
        drop(conn);
        assert!(tracker.is_empty());
    }
}
