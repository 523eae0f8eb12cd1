//! Configuration for the funclite engine.

use std::time::Duration;

use funclite_shared::constants::{defaults, envs};

/// Configuration options for the execution engine.
///
/// Users can create it with defaults and modify fields as needed, or derive
/// it from the environment with [`EngineOptions::from_env`].
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Minimum number of warm guests kept by the pool.
    pub base_pool_size: usize,
    /// Hard ceiling on live guests.
    pub max_pool_size: usize,
    /// Per-guest heap ceiling.
    pub memory_limit_mb: u32,
    /// Idle guests beyond the base are disposed after this long.
    pub idle_timeout: Duration,
    /// Per-invocation wall clock.
    pub function_timeout: Duration,
    /// Compiled-script cache capacity.
    pub module_cache_max_entries: usize,
    /// Toggle for the compiled-script cache.
    pub module_cache_enabled: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            base_pool_size: defaults::BASE_POOL_SIZE,
            max_pool_size: defaults::MAX_POOL_SIZE,
            memory_limit_mb: defaults::MEMORY_LIMIT_MB,
            idle_timeout: Duration::from_millis(defaults::IDLE_TIMEOUT_MS),
            function_timeout: Duration::from_millis(defaults::FUNCTION_TIMEOUT_MS),
            module_cache_max_entries: defaults::MODULE_CACHE_MAX_ENTRIES,
            module_cache_enabled: true,
        }
    }
}

impl EngineOptions {
    /// Build options from `FUNCLITE_*` environment variables.
    ///
    /// Unset or unparseable values fall back to the defaults; a bad value is
    /// logged at warn and never aborts startup.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(v) = parse_env::<usize>(envs::BASE_POOL_SIZE) {
            opts.base_pool_size = v;
        }
        if let Some(v) = parse_env::<usize>(envs::MAX_POOL_SIZE) {
            opts.max_pool_size = v;
        }
        if let Some(v) = parse_env::<u32>(envs::MEMORY_LIMIT_MB) {
            opts.memory_limit_mb = v;
        }
        if let Some(v) = parse_env::<u64>(envs::IDLE_TIMEOUT_MS) {
            opts.idle_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u64>(envs::FUNCTION_TIMEOUT_MS) {
            opts.function_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<usize>(envs::MODULE_CACHE_MAX_ENTRIES) {
            opts.module_cache_max_entries = v;
        }
        if let Some(v) = parse_env::<bool>(envs::MODULE_CACHE_ENABLED) {
            opts.module_cache_enabled = v;
        }
        if opts.max_pool_size < opts.base_pool_size {
            tracing::warn!(
                base = opts.base_pool_size,
                max = opts.max_pool_size,
                "max pool size below base, raising max to base"
            );
            opts.max_pool_size = opts.base_pool_size;
        }
        opts
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable option");
            None
        }
    }
}
