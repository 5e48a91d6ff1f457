//! Tracking of in-flight proxied connections.
//!
//! Every upstream connection the proxy opens is registered here before its
//! first byte and deregistered exactly once when it closes. The registry
//! drives graceful shutdown: the server stops accepting, then paces its
//! drain loop on [`Tracker::maybe_idle_in`], which reports how long until
//! every tracked connection has been quiet for the configured idle
//! threshold.
//!
//! Timestamps are nanoseconds since a process-wide monotonic epoch, stored
//! in an `AtomicU64` shared between the wrapper (writer) and the registry
//! (reader), so the drain loop never takes a per-connection lock.

mod conn;

pub use conn::{ConnStats, TrackedConn};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed since the process-wide monotonic epoch.
pub(crate) fn monotonic_nanos() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Metadata snapshot of one tracked connection, for diagnostics.
#[derive(Debug, Clone)]
pub struct TrackedInfo {
    /// Registry identity of the connection.
    pub id: Uuid,
    /// Role that opened the connection.
    pub role: String,
    /// Destination as `host:port`.
    pub destination: String,
    /// Nanoseconds of inactivity so far.
    pub idle_nanos: u64,
    /// Bytes read from the upstream.
    pub bytes_in: u64,
    /// Bytes written to the upstream.
    pub bytes_out: u64,
}

struct Entry {
    stats: Arc<ConnStats>,
    role: String,
    destination: String,
}

/// Registry of in-flight proxied connections.
pub struct Tracker {
    registry: Mutex<HashMap<Uuid, Entry>>,
    idle_threshold: Duration,
    shutting_down: AtomicBool,
}

impl Tracker {
    /// Create a tracker with the given idle threshold.
    ///
    /// A connection is idle once it has seen no bytes in either direction
    /// for `idle_threshold`.
    #[must_use]
    pub fn new(idle_threshold: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(HashMap::new()),
            idle_threshold,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// The configured idle threshold.
    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    /// Wrap an upstream connection, registering it until close.
    ///
    /// The wrapper updates the shared activity timestamp and byte counters
    /// on every successful read or write, and deregisters itself exactly
    /// once when dropped.
    pub fn wrap<C>(self: &Arc<Self>, conn: C, role: &str, destination: &str) -> TrackedConn<C> {
        let id = Uuid::new_v4();
        let stats = Arc::new(ConnStats::new());
        self.registry.lock().unwrap().insert(
            id,
            Entry {
                stats: stats.clone(),
                role: role.to_string(),
                destination: destination.to_string(),
            },
        );
        debug!(%id, role, destination, "tracking upstream connection");
        TrackedConn::new(conn, id, stats, self.clone())
    }

    /// Remove a connection from the registry. Called by the wrapper's close
    /// path; harmless if the id is already gone.
    pub(crate) fn deregister(&self, id: Uuid) {
        if self.registry.lock().unwrap().remove(&id).is_some() {
            debug!(%id, "upstream connection closed");
        }
    }

    /// Number of currently tracked connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Whether no connections are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.lock().unwrap().is_empty()
    }

    /// The longest time until all tracked connections become idle.
    ///
    /// Zero means every connection is already idle (or none exist). The
    /// value is advisory; the shutdown loop uses it to pace its next
    /// wake-up.
    #[must_use]
    pub fn maybe_idle_in(&self) -> Duration {
        let now = monotonic_nanos();
        let threshold = self.idle_threshold.as_nanos() as u64;
        let mut longest = Duration::ZERO;
        for entry in self.registry.lock().unwrap().values() {
            let last = entry.stats.last_activity_nanos();
            let idle_at = last.saturating_add(threshold);
            let idle_in = Duration::from_nanos(idle_at.saturating_sub(now));
            if idle_in > longest {
                longest = idle_in;
            }
        }
        longest
    }

    /// Iterate tracked connections for diagnostics.
    pub fn range<F: FnMut(&TrackedInfo)>(&self, mut f: F) {
        let now = monotonic_nanos();
        for (id, entry) in self.registry.lock().unwrap().iter() {
            f(&TrackedInfo {
                id: *id,
                role: entry.role.clone(),
                destination: entry.destination.clone(),
                idle_nanos: now.saturating_sub(entry.stats.last_activity_nanos()),
                bytes_in: entry.stats.bytes_in(),
                bytes_out: entry.stats.bytes_out(),
            });
        }
    }

    /// Flip the shutdown flag. Wrappers refuse further I/O on connections
    /// that are already past the idle threshold.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_wrap_and_drop_leaves_empty_registry() {
        let tracker = Tracker::new(Duration::from_secs(1));
        let (a, _b) = duplex(64);

        let conn = tracker.wrap(a, "test-role", "localhost:80");
        assert_eq!(tracker.len(), 1);

        drop(conn);
        assert!(tracker.is_empty(), "registry should be empty after close");
    }

    #[tokio::test]
    async fn test_maybe_idle_in_zero_when_untracked() {
        let tracker = Tracker::new(Duration::from_secs(10));
        assert_eq!(tracker.maybe_idle_in(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_maybe_idle_in_zero_past_threshold() {
        // Nanosecond threshold: everything is immediately idle.
        let tracker = Tracker::new(Duration::from_nanos(1));
        let (a, _b) = duplex(64);
        let _conn = tracker.wrap(a, "test-role", "localhost:80");

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(tracker.maybe_idle_in(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_maybe_idle_in_tracks_activity() {
        // A fresh write against a one-second threshold pushes the idle
        // horizon out to roughly a second.
        let tracker = Tracker::new(Duration::from_secs(1));
        let (a, mut rx) = duplex(64);
        let mut conn = tracker.wrap(a, "test-role", "localhost:80");
        conn.write_all(b"egress").await.unwrap();
        let mut buf = [0u8; 6];
        rx.read_exact(&mut buf).await.unwrap();

        let idle_in = tracker.maybe_idle_in();
        assert!(idle_in > Duration::from_millis(900), "idle_in = {idle_in:?}");
        assert!(idle_in <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_range_reports_metadata() {
        let tracker = Tracker::new(Duration::from_secs(1));
        let (a, mut b) = duplex(64);
        let mut conn = tracker.wrap(a, "billing", "api.stripe.com:443");
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();

        let mut seen = Vec::new();
        tracker.range(|info| seen.push(info.clone()));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].role, "billing");
        assert_eq!(seen[0].destination, "api.stripe.com:443");
        assert_eq!(seen[0].bytes_out, 5);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_idle_connections() {
        let tracker = Tracker::new(Duration::from_nanos(1));
        let (a, _b) = duplex(64);
        let mut conn = tracker.wrap(a, "test-role", "localhost:80");

        tokio::time::sleep(Duration::from_millis(2)).await;
        tracker.begin_shutdown();

        let err = conn.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Other);
    }

    #[tokio::test]
    async fn test_shutdown_allows_active_connections() {
        let tracker = Tracker::new(Duration::from_secs(60));
        let (a, mut b) = duplex(64);
        let mut conn = tracker.wrap(a, "test-role", "localhost:80");

        tracker.begin_shutdown();

        // Still within the idle threshold: traffic flows.
        conn.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }
}
