//! Engine- and pool-level metrics.
//!
//! All counters are monotonic AtomicU64s shared via `Arc`; read handles are
//! cheap clones and need no lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage for engine-wide counters.
#[derive(Clone, Default)]
pub struct EngineMetricsStorage {
    pub(crate) executions: Arc<AtomicU64>,
    pub(crate) handler_failures: Arc<AtomicU64>,
    pub(crate) timeouts: Arc<AtomicU64>,
    pub(crate) pool_exhausted: Arc<AtomicU64>,
}

impl EngineMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &Arc<AtomicU64>) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle for querying engine-wide metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    storage: EngineMetricsStorage,
}

impl EngineMetrics {
    pub(crate) fn new(storage: EngineMetricsStorage) -> Self {
        Self { storage }
    }

    /// Invocations started (successful or not).
    pub fn executions_total(&self) -> u64 {
        self.storage.executions.load(Ordering::Relaxed)
    }

    /// Invocations whose handler threw (reported as 500, guest stays healthy).
    pub fn handler_failures_total(&self) -> u64 {
        self.storage.handler_failures.load(Ordering::Relaxed)
    }

    /// Invocations terminated by the wall-clock timeout.
    pub fn timeouts_total(&self) -> u64 {
        self.storage.timeouts.load(Ordering::Relaxed)
    }

    /// Acquisitions rejected because the pool was full.
    pub fn pool_exhausted_total(&self) -> u64 {
        self.storage.pool_exhausted.load(Ordering::Relaxed)
    }
}

/// Storage for pool counters.
#[derive(Clone, Default)]
pub struct PoolMetricsStorage {
    pub(crate) guests_created: Arc<AtomicU64>,
    pub(crate) guests_corrupted: Arc<AtomicU64>,
    pub(crate) guests_replaced: Arc<AtomicU64>,
    pub(crate) guests_evicted: Arc<AtomicU64>,
}

impl PoolMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Handle for querying pool metrics.
#[derive(Clone)]
pub struct PoolMetrics {
    storage: PoolMetricsStorage,
}

impl PoolMetrics {
    pub(crate) fn new(storage: PoolMetricsStorage) -> Self {
        Self { storage }
    }

    /// Guests created since startup (warm-up, growth and replacements).
    pub fn guests_created_total(&self) -> u64 {
        self.storage.guests_created.load(Ordering::Relaxed)
    }

    /// Guests disposed after an unhealthy release.
    pub fn guests_corrupted_total(&self) -> u64 {
        self.storage.guests_corrupted.load(Ordering::Relaxed)
    }

    /// Background replacements triggered by corruption.
    pub fn guests_replaced_total(&self) -> u64 {
        self.storage.guests_replaced.load(Ordering::Relaxed)
    }

    /// Idle guests disposed by the sweeper.
    pub fn guests_evicted_total(&self) -> u64 {
        self.storage.guests_evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_share_storage() {
        let storage = EngineMetricsStorage::new();
        let metrics = EngineMetrics::new(storage.clone());
        EngineMetricsStorage::bump(&storage.executions);
        EngineMetricsStorage::bump(&storage.executions);
        assert_eq!(metrics.executions_total(), 2);
        assert_eq!(metrics.timeouts_total(), 0);
    }
}
