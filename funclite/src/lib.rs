//! Funclite - a multi-tenant function-execution runtime.
//!
//! Receives an HTTP-style request addressed to a function id, loads the
//! function's published package, runs the handler inside a pooled,
//! memory-capped QuickJS guest behind a fixed host-call bridge, and returns
//! the response plus captured logs. A faulty or malicious package cannot
//! read the host filesystem, reach internal networks, exhaust host memory
//! or interfere with other tenants.
//!
//! ```no_run
//! use std::sync::Arc;
//! use funclite::{Engine, EngineOptions, FunctionRequest};
//! use funclite::providers::{
//!     DirPackageProvider, MemoryKvStore, Providers, StaticMetadataProvider,
//!     StaticPolicyProvider,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let providers = Providers {
//!     metadata: Arc::new(StaticMetadataProvider::new()),
//!     packages: Arc::new(DirPackageProvider::new()),
//!     policies: Arc::new(StaticPolicyProvider::new()),
//!     kv: Arc::new(MemoryKvStore::default()),
//! };
//! let engine = Engine::new(EngineOptions::from_env(), providers)?;
//! let outcome = engine.execute_function("fn-1", FunctionRequest::default()).await;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod engine;
pub mod loader;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod providers;
pub mod runtime;
pub mod sandbox;
pub mod vfs;

pub use engine::Engine;
pub use funclite_shared::{
    ErrorKind, FunctionFailure, FunctionOutcome, FunctionRequest, FunctionResponse, FuncliteError,
    FuncliteResult, LogEntry, LogLevel, ResponseData,
};
pub use runtime::EngineOptions;

/// Initialize tracing for binaries and tests embedding the engine.
///
/// Honours `RUST_LOG`; calling it twice is harmless.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
