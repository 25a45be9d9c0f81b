//! Connection pool with bounded concurrency

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::MAX_CONNECTIONS;

/// Connection pool shared by the admin and mock listeners
#[derive(Clone)]
pub struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    active_count: Arc<AtomicUsize>,
    max_connections: usize,
}

impl ConnectionPool {
    /// Create a new connection pool; a zero limit is raised to one
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        let max_connections = max_connections.max(1);

        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            active_count: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Check if a new connection can be accepted
    #[must_use]
    pub fn can_accept(&self) -> bool {
        self.active_count.load(Ordering::Relaxed) < self.max_connections
    }

    /// Try to acquire a connection permit
    ///
    /// Returns `None` if no permits are available
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(self.guard(permit))
    }

    /// Acquire a connection permit, waiting for one to free up
    ///
    /// Returns `None` only if the pool has been closed
    pub async fn acquire(&self) -> Option<ConnectionGuard> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        Some(self.guard(permit))
    }

    fn guard(&self, permit: OwnedSemaphorePermit) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            _permit: permit,
            active_count: Arc::clone(&self.active_count),
        }
    }

    /// Get the current number of active connections
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Get the maximum number of connections
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(MAX_CONNECTIONS)
    }
}

/// Guard that releases a connection permit when dropped
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
    active_count: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::Relaxed);
    }
}
