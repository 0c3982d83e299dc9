use crate::socket::client::StreamSocket;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default number of idle connections kept across all hosts.
pub const DEFAULT_MAX_IDLE: usize = 16;

/// Default time an idle connection stays reusable.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies interchangeable connections (host, port, secure).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
            secure,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Idle socket with metadata for timeout tracking.
struct PooledConnection<S> {
    socket: S,
    key: PoolKey,
    /// When this socket stops being reusable.
    idle_expiry: Instant,
}

/// Keeps idle keep-alive connections for reuse.
///
/// Entries are kept in release order, newest last. A release into a full
/// pool closes the connection being released; it never evicts an older one.
pub struct ConnectionPool<S> {
    max_idle: usize,
    idle_timeout: Duration,
    idle: Mutex<Vec<PooledConnection<S>>>,
}

impl<S> fmt::Debug for ConnectionPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_idle", &self.max_idle)
            .field("idle_timeout", &self.idle_timeout)
            .field("idle", &self.lock().len())
            .finish()
    }
}

impl<S: StreamSocket> Default for ConnectionPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ConnectionPool<S> {
    fn lock(&self) -> MutexGuard<'_, Vec<PooledConnection<S>>> {
        // A panic while holding the lock leaves the list itself intact.
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S: StreamSocket> ConnectionPool<S> {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_IDLE, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_limits(max_idle: usize, idle_timeout: Duration) -> Self {
        Self {
            max_idle,
            idle_timeout,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_idle
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Take the most recently released live connection for `key`.
    ///
    /// Expired or disconnected entries met during the scan are dropped
    /// (closing them) rather than returned.
    pub fn acquire(&self, key: &PoolKey) -> Option<S> {
        let now = Instant::now();
        let mut idle = self.lock();

        let mut i = idle.len();
        while i > 0 {
            i -= 1;
            if idle[i].idle_expiry <= now || !idle[i].socket.is_connected() {
                let stale = idle.remove(i);
                tracing::trace!(key = %stale.key, "dropping expired idle connection");
                continue;
            }
            if idle[i].key == *key {
                let pooled = idle.remove(i);
                tracing::debug!(key = %key, "reusing idle connection");
                return Some(pooled.socket);
            }
        }

        tracing::trace!(key = %key, "no idle connection");
        None
    }

    /// Return a connection to the pool.
    ///
    /// Returns `false` when the pool is full or the socket is dead; the socket
    /// is dropped (closed) in that case.
    pub fn release(&self, key: PoolKey, socket: S) -> bool {
        if !socket.is_connected() {
            return false;
        }

        let mut idle = self.lock();
        if idle.len() >= self.max_idle {
            drop(idle);
            tracing::debug!(key = %key, "pool full, closing released connection");
            return false;
        }

        idle.push(PooledConnection {
            socket,
            key,
            idle_expiry: Instant::now() + self.idle_timeout,
        });
        true
    }

    /// Get total idle connection count.
    pub fn idle_count(&self) -> usize {
        self.lock().len()
    }

    /// Get idle connection count for one key.
    pub fn idle_count_for(&self, key: &PoolKey) -> usize {
        self.lock().iter().filter(|p| p.key == *key).count()
    }

    /// Close every idle connection whose idle expiry has passed.
    /// Returns how many were closed.
    pub fn cleanup_idle(&self) -> usize {
        let now = Instant::now();
        let mut idle = self.lock();
        let before = idle.len();
        idle.retain(|p| p.idle_expiry > now && p.socket.is_connected());
        let removed = before - idle.len();
        if removed > 0 {
            tracing::debug!(removed, "closed expired idle connections");
        }
        removed
    }

    /// Close all idle connections.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Start a background task to periodically clean up idle connections.
    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                pool.cleanup_idle();
            }
        })
    }
}
