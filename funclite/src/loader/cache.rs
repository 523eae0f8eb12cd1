//! Process-wide compiled-script cache.
//!
//! Values are QuickJS serialized bytecode, portable across every guest in
//! the process, keyed by the content-identifying tuple
//! `(function_id, package_digest, virtual_path)`. A hit refreshes recency;
//! inserts evict the least recently used entries beyond the capacity.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// Cache key. The package digest makes stale code unreachable after a
/// republish without any invalidation traffic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScriptKey {
    pub function_id: String,
    pub package_digest: String,
    pub virtual_path: String,
}

impl ScriptKey {
    pub fn new(
        function_id: impl Into<String>,
        package_digest: impl Into<String>,
        virtual_path: impl Into<String>,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            package_digest: package_digest.into(),
            virtual_path: virtual_path.into(),
        }
    }
}

/// Shared LRU of compiled scripts. Cheap to clone.
#[derive(Clone)]
pub struct ScriptCache {
    inner: Option<Arc<Mutex<LruCache<ScriptKey, Arc<[u8]>>>>>,
}

impl ScriptCache {
    /// `enabled = false` yields a cache that never stores anything; the
    /// per-invocation module registry is unaffected.
    pub fn new(max_entries: usize, enabled: bool) -> Self {
        let cap = match NonZeroUsize::new(max_entries) {
            Some(cap) if enabled => cap,
            _ => return Self { inner: None },
        };
        Self {
            inner: Some(Arc::new(Mutex::new(LruCache::new(cap)))),
        }
    }

    pub fn enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Look up a compiled artefact, refreshing its recency.
    pub fn get(&self, key: &ScriptKey) -> Option<Arc<[u8]>> {
        let inner = self.inner.as_ref()?;
        inner.lock().get(key).cloned()
    }

    /// Insert a compiled artefact, evicting beyond capacity.
    pub fn insert(&self, key: ScriptKey, bytecode: Arc<[u8]>) {
        if let Some(inner) = &self.inner {
            inner.lock().put(key, bytecode);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map(|c| c.lock().len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> ScriptKey {
        ScriptKey::new("fn-1", "sha256:abc", path)
    }

    fn code(tag: u8) -> Arc<[u8]> {
        Arc::from(vec![tag; 4])
    }

    #[test]
    fn returns_same_artefact_until_evicted() {
        let cache = ScriptCache::new(8, true);
        let bytecode = code(1);
        cache.insert(key("/app/index.js"), bytecode.clone());
        let hit = cache.get(&key("/app/index.js")).unwrap();
        assert!(Arc::ptr_eq(&hit, &bytecode));
    }

    #[test]
    fn digest_is_part_of_identity() {
        let cache = ScriptCache::new(8, true);
        cache.insert(key("/app/index.js"), code(1));
        let other = ScriptKey::new("fn-1", "sha256:def", "/app/index.js");
        assert!(cache.get(&other).is_none());
    }

    #[test]
    fn lru_evicts_oldest_first() {
        let cache = ScriptCache::new(2, true);
        cache.insert(key("/app/a.js"), code(1));
        cache.insert(key("/app/b.js"), code(2));
        // Touch a so b becomes the eviction candidate.
        cache.get(&key("/app/a.js"));
        cache.insert(key("/app/c.js"), code(3));
        assert!(cache.get(&key("/app/a.js")).is_some());
        assert!(cache.get(&key("/app/b.js")).is_none());
        assert!(cache.get(&key("/app/c.js")).is_some());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = ScriptCache::new(8, false);
        cache.insert(key("/app/index.js"), code(1));
        assert!(cache.get(&key("/app/index.js")).is_none());
        assert!(!cache.enabled());
    }
}
