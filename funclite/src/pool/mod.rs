//! Guest pool.
//!
//! Dynamically sized pool of long-lived guests: warm base, on-demand growth
//! to the ceiling, fail-fast on exhaustion, corruption disposal with
//! asynchronous replacement, and an idle sweeper that shrinks back to the
//! base. All bookkeeping sits behind a single lock; acquire and release are
//! atomic transitions.

mod entry;

pub use entry::{GuestStatus, PoolEntry};

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use funclite_shared::{FuncliteError, FuncliteResult};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::metrics::{PoolMetrics, PoolMetricsStorage};
use crate::runtime::EngineOptions;
use crate::sandbox::{BootstrapScript, Guest};

const SWEEP_PERIOD: Duration = Duration::from_secs(60);
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// A guest checked out for one invocation.
pub struct PooledGuest {
    pub id: u64,
    pub guest: Arc<Guest>,
    pub bootstrap: Arc<BootstrapScript>,
}

#[derive(Clone, Copy, Debug)]
struct PoolConfig {
    base_size: usize,
    max_size: usize,
    memory_limit_mb: u32,
    idle_timeout: Duration,
}

struct PoolState {
    entries: HashMap<u64, PoolEntry>,
    next_id: u64,
    /// Creations in flight, counted against the ceiling.
    creating: usize,
    accepting: bool,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    metrics: PoolMetricsStorage,
    bootstrap: Arc<BootstrapScript>,
    sweeper_stop: CancellationToken,
}

/// Dynamically sized pool of long-lived guest runtimes.
#[derive(Clone)]
pub struct GuestPool {
    inner: Arc<PoolInner>,
}

impl GuestPool {
    /// Build the pool, start warming the base and start the idle sweeper.
    pub fn start(options: &EngineOptions) -> FuncliteResult<Self> {
        let bootstrap = BootstrapScript::shared()?;
        let config = PoolConfig {
            base_size: options.base_pool_size,
            max_size: options.max_pool_size.max(options.base_pool_size),
            memory_limit_mb: options.memory_limit_mb,
            idle_timeout: options.idle_timeout,
        };
        let inner = Arc::new(PoolInner {
            config,
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                next_id: 1,
                creating: 0,
                accepting: true,
            }),
            metrics: PoolMetricsStorage::new(),
            bootstrap,
            sweeper_stop: CancellationToken::new(),
        });

        // Warm-up runs in the background; acquire() can race it and create
        // on demand.
        for _ in 0..config.base_size {
            PoolInner::spawn_fill(Arc::downgrade(&inner), false);
        }
        PoolInner::spawn_sweeper(Arc::downgrade(&inner));

        Ok(Self { inner })
    }

    /// Take an idle guest, or create one below the ceiling, or fail fast.
    pub async fn acquire(&self) -> FuncliteResult<PooledGuest> {
        // Fast path: an idle entry.
        {
            let mut state = self.inner.state.lock();
            if !state.accepting {
                return Err(FuncliteError::ResourceExhausted(
                    "guest pool is shutting down".into(),
                ));
            }
            let idle_id = state
                .entries
                .iter()
                .find(|(_, entry)| entry.status.can_acquire() && entry.guest.is_healthy())
                .map(|(&id, _)| id);
            if let Some(id) = idle_id {
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.status = GuestStatus::InUse;
                    entry.touch();
                    return Ok(PooledGuest {
                        id,
                        guest: Arc::clone(&entry.guest),
                        bootstrap: Arc::clone(&self.inner.bootstrap),
                    });
                }
            }
            let occupancy = state.entries.len() + state.creating;
            if occupancy >= self.inner.config.max_size {
                return Err(FuncliteError::ResourceExhausted(
                    "no guests available".into(),
                ));
            }
            state.creating += 1;
        }

        // Slow path: create a guest for this caller.
        let created = Guest::create(self.inner.config.memory_limit_mb).await;
        let mut state = self.inner.state.lock();
        state.creating -= 1;
        let guest = Arc::new(created?);
        self.inner
            .metrics
            .guests_created
            .fetch_add(1, Ordering::Relaxed);
        let id = state.next_id;
        state.next_id += 1;
        let mut entry = PoolEntry::new(Arc::clone(&guest));
        entry.status = GuestStatus::InUse;
        state.entries.insert(id, entry);
        Ok(PooledGuest {
            id,
            guest,
            bootstrap: Arc::clone(&self.inner.bootstrap),
        })
    }

    /// Return a guest. Unhealthy releases dispose the guest and trigger a
    /// background replacement while the pool sits below its base.
    pub fn release(&self, pooled: PooledGuest, healthy: bool) {
        // A fired interrupt overrides whatever the caller believes.
        let healthy = healthy && pooled.guest.is_healthy();
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(&pooled.id) else {
            return;
        };
        if healthy {
            entry.status = GuestStatus::Idle;
            entry.touch();
            return;
        }
        entry.status = GuestStatus::Corrupted;
        state.entries.remove(&pooled.id);
        self.inner
            .metrics
            .guests_corrupted
            .fetch_add(1, Ordering::Relaxed);
        let healthy_count = state.entries.len() + state.creating;
        let should_replace = state.accepting && healthy_count < self.inner.config.base_size;
        drop(state);
        // The last strong reference to the guest drops with `pooled`.
        if should_replace {
            PoolInner::spawn_fill(Arc::downgrade(&self.inner), true);
        }
    }

    pub fn size(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn idle_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .filter(|e| e.status.is_idle())
            .count()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .filter(|e| e.status.is_in_use())
            .count()
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics::new(self.inner.metrics.clone())
    }

    /// Stop the sweeper, reject new acquires, wait for in-use guests up to
    /// the deadline, then dispose everything left.
    pub async fn shutdown(&self, deadline: Duration) {
        self.inner.sweeper_stop.cancel();
        {
            let mut state = self.inner.state.lock();
            state.accepting = false;
        }
        let started = std::time::Instant::now();
        while started.elapsed() < deadline {
            if self.in_use_count() == 0 {
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        let drained = {
            let mut state = self.inner.state.lock();
            state.entries.drain().count()
        };
        tracing::debug!(disposed = drained, "guest pool shut down");
    }
}

impl PoolInner {
    /// Create one guest in the background and park it idle.
    fn spawn_fill(weak: Weak<PoolInner>, is_replacement: bool) {
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else { return };
            {
                let mut state = inner.state.lock();
                if !state.accepting
                    || state.entries.len() + state.creating >= inner.config.max_size
                {
                    return;
                }
                state.creating += 1;
            }
            let created = Guest::create(inner.config.memory_limit_mb).await;
            let mut state = inner.state.lock();
            state.creating -= 1;
            match created {
                Ok(guest) => {
                    inner.metrics.guests_created.fetch_add(1, Ordering::Relaxed);
                    if is_replacement {
                        inner.metrics.guests_replaced.fetch_add(1, Ordering::Relaxed);
                    }
                    let id = state.next_id;
                    state.next_id += 1;
                    state.entries.insert(id, PoolEntry::new(Arc::new(guest)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "background guest creation failed");
                }
            }
        });
    }

    fn spawn_sweeper(weak: Weak<PoolInner>) {
        tokio::spawn(async move {
            let stop = match weak.upgrade() {
                Some(inner) => inner.sweeper_stop.clone(),
                None => return,
            };
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { return };
                inner.sweep();
            }
        });
    }

    /// Dispose idle guests beyond the base that sat unused past the idle
    /// timeout.
    fn sweep(&self) {
        let mut state = self.state.lock();
        let healthy = state.entries.len();
        if healthy <= self.config.base_size {
            return;
        }
        let mut excess = healthy - self.config.base_size;
        let idle_timeout = self.config.idle_timeout;
        let mut victims: Vec<u64> = state
            .entries
            .iter()
            .filter(|(_, e)| e.status.is_idle() && e.idle_for() > idle_timeout)
            .map(|(&id, _)| id)
            .collect();
        victims.sort();
        for id in victims {
            if excess == 0 {
                break;
            }
            state.entries.remove(&id);
            excess -= 1;
            self.metrics.guests_evicted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_options(base: usize, max: usize) -> EngineOptions {
        EngineOptions {
            base_pool_size: base,
            max_pool_size: max,
            memory_limit_mb: 32,
            ..EngineOptions::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn acquire_creates_up_to_max_then_fails_fast() {
        let pool = GuestPool::start(&small_options(0, 2)).unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), funclite_shared::ErrorKind::ResourceExhausted);
        pool.release(a, true);
        pool.release(b, true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn healthy_release_returns_guest_to_idle() {
        let pool = GuestPool::start(&small_options(0, 2)).unwrap();
        let first = pool.acquire().await.unwrap();
        let first_id = first.id;
        pool.release(first, true);
        assert_eq!(pool.idle_count(), 1);
        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id, first_id);
        pool.release(second, true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unhealthy_release_disposes_the_guest() {
        let pool = GuestPool::start(&small_options(0, 2)).unwrap();
        let pooled = pool.acquire().await.unwrap();
        pool.release(pooled, false);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.metrics().guests_corrupted_total(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn corruption_below_base_triggers_replacement() {
        let pool = GuestPool::start(&small_options(1, 2)).unwrap();
        let pooled = pool.acquire().await.unwrap();
        pool.release(pooled, false);
        // Replacement is asynchronous.
        for _ in 0..100 {
            if pool.metrics().guests_replaced_total() > 0 && pool.idle_count() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pool.metrics().guests_replaced_total() >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn canceled_guest_is_never_reused() {
        let pool = GuestPool::start(&small_options(0, 1)).unwrap();
        let pooled = pool.acquire().await.unwrap();
        pooled.guest.interrupt().cancel();
        // Caller claims healthy; the fired interrupt wins.
        pool.release(pooled, true);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sweep_evicts_idle_guests_beyond_base() {
        let mut options = small_options(1, 4);
        options.idle_timeout = Duration::from_millis(0);
        let pool = GuestPool::start(&options).unwrap();
        // Let the warm-up finish so no background fill races the sweep.
        for _ in 0..100 {
            if pool.size() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        pool.release(a, true);
        pool.release(b, true);
        pool.release(c, true);
        assert!(pool.size() >= 3);

        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.inner.sweep();
        // Shrinks to the base, never below it.
        assert_eq!(pool.size(), 1);
        assert!(pool.metrics().guests_evicted_total() >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sweep_spares_fresh_idle_guests() {
        let mut options = small_options(0, 4);
        options.idle_timeout = Duration::from_secs(3600);
        let pool = GuestPool::start(&options).unwrap();
        let a = pool.acquire().await.unwrap();
        pool.release(a, true);
        pool.inner.sweep();
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.metrics().guests_evicted_total(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_rejects_new_acquires() {
        let pool = GuestPool::start(&small_options(0, 2)).unwrap();
        pool.shutdown(Duration::from_millis(100)).await;
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), funclite_shared::ErrorKind::ResourceExhausted);
    }
}
