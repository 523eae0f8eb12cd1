//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use funclite::providers::{
    DirPackageProvider, FunctionMetadata, MemoryKvStore, Providers, StaticMetadataProvider,
    StaticPolicyProvider,
};
use funclite::policy::NetworkPolicy;
use funclite::{Engine, EngineOptions, FunctionOutcome, FunctionRequest};
use funclite_test_utils::{PackageBuilder, RequestBuilder, TestPackage};
use std::collections::HashMap;

pub const PROJECT: &str = "project-1";

/// Engine wired to in-memory providers, with package fixtures kept alive
/// for the duration of the test.
pub struct TestContext {
    pub engine: Engine,
    pub metadata: Arc<StaticMetadataProvider>,
    pub packages: Arc<DirPackageProvider>,
    pub policies: Arc<StaticPolicyProvider>,
    pub kv: Arc<MemoryKvStore>,
    held: Vec<TestPackage>,
}

impl TestContext {
    pub fn new(options: EngineOptions) -> Self {
        let metadata = Arc::new(StaticMetadataProvider::new());
        let packages = Arc::new(DirPackageProvider::new());
        let policies = Arc::new(StaticPolicyProvider::new());
        let kv = Arc::new(MemoryKvStore::default());
        let providers = Providers {
            metadata: metadata.clone(),
            packages: packages.clone(),
            policies: policies.clone(),
            kv: kv.clone(),
        };
        let engine = Engine::new(options, providers).expect("failed to build engine");
        Self {
            engine,
            metadata,
            packages,
            policies,
            kv,
            held: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(small_options())
    }

    /// Publish a package under a function id.
    pub fn deploy(&mut self, function_id: &str, package: TestPackage) {
        self.deploy_with_env(function_id, package, HashMap::new());
    }

    pub fn deploy_with_env(
        &mut self,
        function_id: &str,
        package: TestPackage,
        env_vars: HashMap<String, String>,
    ) {
        self.metadata.register(FunctionMetadata {
            function_id: function_id.to_string(),
            project_id: PROJECT.to_string(),
            active_version: "1".into(),
            package_digest: package.digest().to_string(),
            env_vars,
        });
        self.packages
            .register(function_id, package.root(), package.digest(), "1");
        self.held.push(package);
    }

    pub fn set_policy(&self, policy: NetworkPolicy) {
        self.policies.set(PROJECT, policy);
    }

    pub async fn invoke(&self, function_id: &str, request: FunctionRequest) -> FunctionOutcome {
        self.engine.execute_function(function_id, request).await
    }

    pub async fn invoke_simple(&self, function_id: &str) -> FunctionOutcome {
        self.invoke(function_id, RequestBuilder::new().build()).await
    }
}

/// Options sized for tests: no warm-up noise, small ceiling.
pub fn small_options() -> EngineOptions {
    EngineOptions {
        base_pool_size: 0,
        max_pool_size: 2,
        memory_limit_mb: 64,
        ..EngineOptions::default()
    }
}

pub fn handler(source: &str) -> TestPackage {
    PackageBuilder::new().entry(source).build()
}
