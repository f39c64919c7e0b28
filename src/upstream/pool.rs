//! Bounded pool of upstream connections.
//!
//! Each [`PoolEntry`] wraps a dedicated `reqwest::Client` limited to a single
//! idle keep-alive connection, so one entry stands for one upstream
//! connection. A `tokio::sync::Semaphore` bounds the number of entries in use;
//! the idle list sits behind a `std::sync::Mutex` that is never held across an
//! `.await`.
//!
//! Entries are moved out of the idle list into a [`PooledConnection`] lease,
//! so an entry can never be leased to two sessions at once. A lease dropped
//! without [`PooledConnection::release`] is discarded, never pooled.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of simultaneously leased entries.
    pub max_size: usize,
    /// Idle entries older than this are evicted on the next scan.
    pub idle_ttl: Duration,
    /// How long `acquire` waits for a free entry.
    pub acquire_timeout: Duration,
    /// TCP connect timeout for the entry's client.
    pub connect_timeout: Duration,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    /// Entries currently leased to sessions.
    pub leased: usize,
    /// Entries currently idle in the pool.
    pub idle: usize,
    /// Entries created over the pool's lifetime.
    pub created: u64,
    /// Acquisitions served from the idle list.
    pub reused: u64,
    /// Idle entries dropped for exceeding the TTL.
    pub evicted: u64,
    /// Leases closed instead of being returned (broken, aborted, shutdown).
    pub discarded: u64,
    /// Acquisitions that timed out waiting for a free entry.
    pub exhausted: u64,
}

/// An upstream connection slot.
#[derive(Debug)]
pub(crate) struct PoolEntry {
    id: u64,
    client: reqwest::Client,
    created_at: Instant,
    idle_since: Instant,
    requests_served: u64,
}

impl PoolEntry {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.idle_since) > ttl
    }
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    discarded: AtomicU64,
    exhausted: AtomicU64,
    leased: AtomicUsize,
}

struct PoolShared {
    config: PoolConfig,
    idle: Mutex<Vec<PoolEntry>>,
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
    next_id: AtomicU64,
    counters: PoolCounters,
}

impl PoolShared {
    fn idle_len(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Return a lease's entry to the idle list, or close it.
    fn finish(&self, mut entry: PoolEntry, reusable: bool) {
        self.counters.leased.fetch_sub(1, Ordering::Relaxed);

        if reusable && !self.closed.load(Ordering::Acquire) {
            entry.idle_since = Instant::now();
            entry.requests_served += 1;
            if let Ok(mut idle) = self.idle.lock() {
                idle.push(entry);
                return;
            }
        }

        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            connection_id = entry.id,
            requests_served = entry.requests_served,
            age_ms = entry.created_at.elapsed().as_millis() as u64,
            "upstream connection closed"
        );
    }
}

/// Bounded, lazily-evicting pool of upstream connections.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create an empty pool. Entries are created on demand.
    pub fn new(config: PoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_size));
        Self {
            shared: Arc::new(PoolShared {
                idle: Mutex::new(Vec::with_capacity(config.max_size)),
                config,
                semaphore,
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                counters: PoolCounters::default(),
            }),
        }
    }

    /// Lease an entry, waiting up to the acquire timeout for one to free up.
    ///
    /// This will:
    /// 1. Wait for a slot under the size ceiling (or fail with `PoolExhausted`)
    /// 2. Evict expired idle entries and reuse the most recently returned one
    /// 3. Create a new entry if none is idle
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let start = Instant::now();
        let shared = &self.shared;

        let permit = match tokio::time::timeout(
            shared.config.acquire_timeout,
            shared.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::ShuttingDown),
            Err(_) => {
                shared.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                let waited_ms = start.elapsed().as_millis() as u64;
                tracing::warn!(
                    waited_ms,
                    max_size = shared.config.max_size,
                    "connection pool exhausted"
                );
                return Err(Error::PoolExhausted { waited_ms });
            }
        };

        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let entry = match self.take_idle() {
            Some(entry) => {
                shared.counters.reused.fetch_add(1, Ordering::Relaxed);
                entry
            }
            // Permit drops with the error, freeing the slot
            None => self.create_entry()?,
        };

        shared.counters.leased.fetch_add(1, Ordering::Relaxed);

        Ok(PooledConnection {
            entry: Some(entry),
            permit: Some(permit),
            pool: shared.clone(),
        })
    }

    /// Pop the warmest idle entry after evicting expired ones.
    fn take_idle(&self) -> Option<PoolEntry> {
        let shared = &self.shared;
        let now = Instant::now();
        let mut idle = shared.idle.lock().ok()?;

        let before = idle.len();
        idle.retain(|entry| !entry.is_expired(shared.config.idle_ttl, now));
        let evicted = before - idle.len();
        if evicted > 0 {
            shared
                .counters
                .evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(evicted, "evicted idle upstream connections past TTL");
        }

        idle.pop()
    }

    fn create_entry(&self) -> Result<PoolEntry> {
        let shared = &self.shared;
        let client = reqwest::Client::builder()
            .connect_timeout(shared.config.connect_timeout)
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(shared.config.idle_ttl)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build upstream client: {}", e)))?;

        let now = Instant::now();
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        shared.counters.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection_id = id, "created upstream connection slot");

        Ok(PoolEntry {
            id,
            client,
            created_at: now,
            idle_since: now,
            requests_served: 0,
        })
    }

    /// Stop the pool: waiting and future acquires fail with `ShuttingDown`,
    /// idle entries are closed, and outstanding leases are closed on release.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.semaphore.close();

        let drained = shared
            .idle
            .lock()
            .map(|mut idle| idle.drain(..).count())
            .unwrap_or(0);
        shared
            .counters
            .discarded
            .fetch_add(drained as u64, Ordering::Relaxed);

        tracing::info!(
            drained,
            leased = shared.counters.leased.load(Ordering::Relaxed),
            "connection pool closed"
        );
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let c = &shared.counters;
        PoolStats {
            max_size: shared.config.max_size,
            leased: c.leased.load(Ordering::Relaxed),
            idle: shared.idle_len(),
            created: c.created.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// A leased pool entry (RAII guard).
///
/// Holds the size permit for as long as the entry is in use. Call
/// [`release`](Self::release) to return it; dropping it closes the entry.
pub struct PooledConnection {
    entry: Option<PoolEntry>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolShared>,
}

impl PooledConnection {
    /// Identifier of the leased entry, stable across reuse.
    pub fn id(&self) -> u64 {
        self.entry.as_ref().map(|e| e.id).unwrap_or_default()
    }

    /// Client bound to this entry's connection.
    pub fn client(&self) -> Option<&reqwest::Client> {
        self.entry.as_ref().map(|e| &e.client)
    }

    /// Return the entry to the pool (`reusable = true`) or close it.
    pub fn release(mut self, reusable: bool) {
        self.finish(reusable);
    }

    fn finish(&mut self, reusable: bool) {
        if let Some(entry) = self.entry.take() {
            self.pool.finish(entry, reusable);
        }
        // Entry is back in the idle list before the slot frees up
        self.permit.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.entry.is_some() {
            tracing::debug!(
                connection_id = self.id(),
                "lease dropped without release, closing connection"
            );
            self.finish(false);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_size: usize) -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            max_size,
            idle_ttl: Duration::from_secs(60),
            acquire_timeout: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(1),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state() {
        let pool = pool(4);
        let stats = pool.stats();
        assert_eq!(stats.max_size, 4);
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.created, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_reusable_returns_to_pool() {
        let pool = pool(2);

        let lease = pool.acquire().await.unwrap();
        let first_id = lease.id();
        assert_eq!(pool.stats().leased, 1);
        lease.release(true);

        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.idle, 1);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), first_id, "idle entry should be reused");
        assert_eq!(pool.stats().reused, 1);
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_not_reusable_is_discarded() {
        let pool = pool(2);

        let lease = pool.acquire().await.unwrap();
        let first_id = lease.id();
        lease.release(false);

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);

        let next = pool.acquire().await.unwrap();
        assert_ne!(next.id(), first_id);
        assert_eq!(pool.stats().created, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_without_release_is_discarded() {
        let pool = pool(1);
        {
            let _lease = pool.acquire().await.unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);

        // Slot is free again
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_acquire_timeout() {
        let pool = pool(1);
        let _held = pool.acquire().await.unwrap();

        let start = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(50), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(60), "waited {:?}", waited);
        assert_eq!(pool.stats().exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_released_entry() {
        let pool = pool(1);
        let held = pool.acquire().await.unwrap();
        let held_id = held.id();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|l| l.id()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release(true);

        let waited_id = waiter.await.unwrap().unwrap();
        assert_eq!(waited_id, held_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_leases_are_distinct() {
        let pool = pool(3);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();

        let mut ids = vec![a.id(), b.id(), c.id()];
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3, "an entry must never be leased twice");
        assert_eq!(pool.stats().leased, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entries_evicted_after_ttl() {
        let pool = pool(2);
        let lease = pool.acquire().await.unwrap();
        let old_id = lease.id();
        lease.release(true);

        tokio::time::advance(Duration::from_secs(61)).await;

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.id(), old_id);
        let stats = pool.stats();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.reused, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entry_within_ttl_survives_scan() {
        let pool = pool(2);
        let lease = pool.acquire().await.unwrap();
        let id = lease.id();
        lease.release(true);

        tokio::time::advance(Duration::from_secs(59)).await;

        assert_eq!(pool.acquire().await.unwrap().id(), id);
        assert_eq!(pool.stats().evicted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_acquire_and_discards_returns() {
        let pool = pool(2);
        let outstanding = pool.acquire().await.unwrap();
        pool.acquire().await.unwrap().release(true);
        assert_eq!(pool.stats().idle, 1);

        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            Error::ShuttingDown
        ));

        // Returning after close closes the connection instead of pooling it
        outstanding.release(true);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_waiters() {
        let pool = pool(1);
        let _held = pool.acquire().await.unwrap();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
        tokio::task::yield_now().await;

        pool.close();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::ShuttingDown)));
    }
}
