//! In-memory and local-directory provider implementations.
//!
//! Enough to embed the engine without external services, and the substrate
//! for the integration tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use funclite_shared::constants::defaults;
use funclite_shared::{FuncliteError, FuncliteResult};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::policy::NetworkPolicy;

use super::{FunctionMetadata, KvStore, MetadataProvider, PackagePaths, PackageProvider, PolicyProvider};

// ============================================================================
// METADATA
// ============================================================================

/// Fixed function registry.
#[derive(Default)]
pub struct StaticMetadataProvider {
    functions: Mutex<HashMap<String, FunctionMetadata>>,
}

impl StaticMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, metadata: FunctionMetadata) {
        self.functions
            .lock()
            .insert(metadata.function_id.clone(), metadata);
    }
}

#[async_trait]
impl MetadataProvider for StaticMetadataProvider {
    async fn lookup(&self, function_id: &str) -> FuncliteResult<FunctionMetadata> {
        self.functions
            .lock()
            .get(function_id)
            .cloned()
            .ok_or_else(|| FuncliteError::NotFound(format!("function not found: {}", function_id)))
    }
}

// ============================================================================
// PACKAGES
// ============================================================================

/// Serves packages from local directories registered per function.
///
/// Concurrent materialisations of the same function are serialised by a
/// per-function lock, per the provider contract.
#[derive(Default)]
pub struct DirPackageProvider {
    packages: Mutex<HashMap<String, PackagePaths>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DirPackageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        function_id: impl Into<String>,
        root: impl Into<PathBuf>,
        digest: impl Into<String>,
        version: impl Into<String>,
    ) {
        self.packages.lock().insert(
            function_id.into(),
            PackagePaths {
                root: root.into(),
                digest: digest.into(),
                version: version.into(),
            },
        );
    }

    fn lock_for(&self, function_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(function_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl PackageProvider for DirPackageProvider {
    async fn materialize(&self, function_id: &str, digest: &str) -> FuncliteResult<PackagePaths> {
        let lock = self.lock_for(function_id);
        let _guard = lock.lock().await;

        let paths = self
            .packages
            .lock()
            .get(function_id)
            .cloned()
            .ok_or_else(|| {
                FuncliteError::NotFound(format!("no package for function: {}", function_id))
            })?;
        if !digest.is_empty() && paths.digest != digest {
            return Err(FuncliteError::NotFound(format!(
                "package digest mismatch for function: {}",
                function_id
            )));
        }
        if !paths.root.is_dir() {
            return Err(FuncliteError::NotFound(format!(
                "package directory missing for function: {}",
                function_id
            )));
        }
        Ok(paths)
    }
}

// ============================================================================
// POLICIES
// ============================================================================

/// Fixed per-project policies; unknown projects get the default (deny-all).
#[derive(Default)]
pub struct StaticPolicyProvider {
    policies: Mutex<HashMap<String, NetworkPolicy>>,
}

impl StaticPolicyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, project_id: impl Into<String>, policy: NetworkPolicy) {
        self.policies.lock().insert(project_id.into(), policy);
    }
}

#[async_trait]
impl PolicyProvider for StaticPolicyProvider {
    async fn policies(&self, project_id: &str) -> FuncliteResult<NetworkPolicy> {
        Ok(self
            .policies
            .lock()
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// KV
// ============================================================================

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

#[derive(Default)]
struct ProjectSpace {
    entries: HashMap<String, KvEntry>,
    used_bytes: u64,
}

/// In-memory KV store with TTLs and the per-project storage cap.
pub struct MemoryKvStore {
    quota_bytes: u64,
    projects: Mutex<HashMap<String, ProjectSpace>>,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new(defaults::KV_QUOTA_BYTES)
    }
}

impl MemoryKvStore {
    pub fn new(quota_bytes: u64) -> Self {
        Self {
            quota_bytes,
            projects: Mutex::new(HashMap::new()),
        }
    }

    fn entry_cost(key: &str, value: &str) -> u64 {
        (key.len() + value.len()) as u64
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, project_id: &str, key: &str) -> FuncliteResult<Option<String>> {
        let mut projects = self.projects.lock();
        let Some(space) = projects.get_mut(project_id) else {
            return Ok(None);
        };
        match space.entries.get(key) {
            Some(entry) if entry.live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                // Expired: reclaim lazily.
                if let Some(dead) = space.entries.remove(key) {
                    space.used_bytes = space
                        .used_bytes
                        .saturating_sub(Self::entry_cost(key, &dead.value));
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        project_id: &str,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> FuncliteResult<()> {
        let mut projects = self.projects.lock();
        let space = projects.entry(project_id.to_string()).or_default();

        let new_cost = Self::entry_cost(key, &value);
        let old_cost = space
            .entries
            .get(key)
            .map(|e| Self::entry_cost(key, &e.value))
            .unwrap_or(0);
        let projected = space.used_bytes.saturating_sub(old_cost) + new_cost;
        if projected > self.quota_bytes {
            return Err(FuncliteError::ResourceExhausted(
                "KV storage quota exceeded".into(),
            ));
        }
        space.used_bytes = projected;
        space.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, project_id: &str, key: &str) -> FuncliteResult<bool> {
        let mut projects = self.projects.lock();
        let Some(space) = projects.get_mut(project_id) else {
            return Ok(false);
        };
        match space.entries.remove(key) {
            Some(entry) => {
                space.used_bytes = space
                    .used_bytes
                    .saturating_sub(Self::entry_cost(key, &entry.value));
                Ok(entry.live())
            }
            None => Ok(false),
        }
    }

    async fn has(&self, project_id: &str, key: &str) -> FuncliteResult<bool> {
        Ok(self.get(project_id, key).await?.is_some())
    }

    async fn keys(&self, project_id: &str, prefix: Option<&str>) -> FuncliteResult<Vec<String>> {
        let projects = self.projects.lock();
        let Some(space) = projects.get(project_id) else {
            return Ok(Vec::new());
        };
        let mut keys: Vec<String> = space
            .entries
            .iter()
            .filter(|(_, entry)| entry.live())
            .filter(|(key, _)| prefix.map(|p| key.starts_with(p)).unwrap_or(true))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
