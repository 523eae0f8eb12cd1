//! External collaborators.
//!
//! The engine only ever talks to metadata, packages, policies and the KV
//! store through these traits. In-memory and local-directory
//! implementations live in [`memory`] for embedding and tests; production
//! deployments plug their own.

mod memory;

pub use memory::{DirPackageProvider, MemoryKvStore, StaticMetadataProvider, StaticPolicyProvider};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use funclite_shared::FuncliteResult;
use serde::{Deserialize, Serialize};

use crate::policy::NetworkPolicy;

/// What the metadata store knows about one function.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionMetadata {
    pub function_id: String,
    pub project_id: String,
    pub active_version: String,
    pub package_digest: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// Resolved package directory for one invocation.
#[derive(Clone, Debug)]
pub struct PackagePaths {
    /// Host directory containing the extracted package, rooted by `index.js`.
    pub root: PathBuf,
    pub digest: String,
    pub version: String,
}

/// Function metadata lookup.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Fails `NotFound` for unknown functions.
    async fn lookup(&self, function_id: &str) -> FuncliteResult<FunctionMetadata>;
}

/// Package materialisation.
///
/// Contract: the returned directory is stable for the lifetime of a single
/// invocation and treated as read-only by the engine; concurrent
/// materialisations of the same function are serialised by the provider.
#[async_trait]
pub trait PackageProvider: Send + Sync {
    async fn materialize(&self, function_id: &str, digest: &str) -> FuncliteResult<PackagePaths>;
}

/// Network policy fetch. A failing fetch degrades to default deny.
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    async fn policies(&self, project_id: &str) -> FuncliteResult<NetworkPolicy>;
}

/// Project-scoped key-value store. Values are JSON text; implementations
/// enforce the per-project storage cap with `ResourceExhausted`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, project_id: &str, key: &str) -> FuncliteResult<Option<String>>;
    async fn set(
        &self,
        project_id: &str,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> FuncliteResult<()>;
    async fn delete(&self, project_id: &str, key: &str) -> FuncliteResult<bool>;
    async fn has(&self, project_id: &str, key: &str) -> FuncliteResult<bool>;
    async fn keys(&self, project_id: &str, prefix: Option<&str>) -> FuncliteResult<Vec<String>>;
}

/// Bundle handed to the engine at construction.
#[derive(Clone)]
pub struct Providers {
    pub metadata: Arc<dyn MetadataProvider>,
    pub packages: Arc<dyn PackageProvider>,
    pub policies: Arc<dyn PolicyProvider>,
    pub kv: Arc<dyn KvStore>,
}
