//! Execution engine.
//!
//! Orchestrates one invocation end to end: metadata, package and policy
//! resolution, guest acquisition, context setup, the handler run under the
//! wall-clock timeout, response assembly and guest release (healthy or
//! corrupted). The outward contract is the invocation record pair: a
//! response with logs, or `{error, statusCode}`.

use std::sync::Arc;
use std::time::Duration;

use funclite_shared::{
    ErrorKind, FunctionFailure, FunctionOutcome, FunctionRequest, FunctionResponse, FuncliteError,
    FuncliteResult,
};
use tracing::Instrument;

use crate::loader::ScriptCache;
use crate::metrics::{EngineMetrics, EngineMetricsStorage};
use crate::pool::{GuestPool, PooledGuest};
use crate::policy::NetworkPolicy;
use crate::providers::{FunctionMetadata, PackagePaths, Providers};
use crate::runtime::EngineOptions;
use crate::sandbox::{ExecutionContext, HandlerOutcome, InvocationSpec};

// Outer belt over the interrupt-driven deadline, for host-side stalls.
const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

/// How an invocation failed, before mapping to a status code.
enum InvocationFailure {
    /// Handler threw. Healthy guest, 500.
    Handler { message: String, stack: Option<String> },
    /// Handler finished without producing a body. Healthy guest, 500.
    NoOutput(String),
    /// Engine-owned failure (timeout, memory, internal). Corrupts the guest.
    Engine(FuncliteError),
}

/// The sandbox execution engine.
#[derive(Clone)]
pub struct Engine {
    options: EngineOptions,
    pool: GuestPool,
    script_cache: ScriptCache,
    providers: Providers,
    metrics: EngineMetricsStorage,
}

impl Engine {
    /// Build the engine and start warming the guest pool.
    pub fn new(options: EngineOptions, providers: Providers) -> FuncliteResult<Self> {
        let pool = GuestPool::start(&options)?;
        let script_cache = ScriptCache::new(
            options.module_cache_max_entries,
            options.module_cache_enabled,
        );
        Ok(Self {
            options,
            pool,
            script_cache,
            providers,
            metrics: EngineMetricsStorage::new(),
        })
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics::new(self.metrics.clone())
    }

    pub fn pool(&self) -> &GuestPool {
        &self.pool
    }

    /// Run one invocation. Never panics outward; every failure becomes an
    /// `{error, statusCode}` record.
    pub async fn execute_function(
        &self,
        function_id: &str,
        request: FunctionRequest,
    ) -> FunctionOutcome {
        EngineMetricsStorage::bump(&self.metrics.executions);
        let invocation_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "invocation",
            function_id = %function_id,
            invocation_id = %&invocation_id[..8],
        );
        self.try_execute(function_id, request).instrument(span).await
    }

    /// Graceful shutdown: reject new work, wait for in-flight invocations.
    pub async fn shutdown(&self, deadline: Duration) {
        self.pool.shutdown(deadline).await;
    }

    async fn try_execute(
        &self,
        function_id: &str,
        request: FunctionRequest,
    ) -> FunctionOutcome {
        // Metadata first; everything else hangs off it.
        let metadata = match self.providers.metadata.lookup(function_id).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(failure(404, format!("function not found: {}", function_id)));
            }
            Err(e) => {
                tracing::error!(error = %e, "metadata lookup failed");
                return Err(failure(500, "internal error".to_string()));
            }
        };

        // Package materialisation and policy fetch are independent.
        let (package, policy) = tokio::join!(
            self.providers
                .packages
                .materialize(function_id, &metadata.package_digest),
            self.providers.policies.policies(&metadata.project_id),
        );
        let package = match package {
            Ok(package) => package,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(failure(404, format!("function not found: {}", function_id)));
            }
            Err(e) => {
                tracing::error!(error = %e, "package materialisation failed");
                return Err(failure(500, "internal error".to_string()));
            }
        };
        // Policy fetch failure degrades to default deny.
        let policy = Arc::new(policy.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "policy fetch failed, defaulting to deny");
            NetworkPolicy::default()
        }));

        let pooled = match self.pool.acquire().await {
            Ok(pooled) => pooled,
            Err(e) if e.kind() == ErrorKind::ResourceExhausted => {
                EngineMetricsStorage::bump(&self.metrics.pool_exhausted);
                return Err(failure(503, "service unavailable: no execution capacity".into()));
            }
            Err(e) => {
                tracing::error!(error = %e, "guest acquisition failed");
                return Err(failure(500, "internal error".to_string()));
            }
        };

        match self
            .run_invocation(&pooled, metadata, package, policy, request)
            .await
        {
            Ok(response) => {
                self.pool.release(pooled, true);
                Ok(response)
            }
            Err(InvocationFailure::Handler { message, stack }) => {
                self.pool.release(pooled, true);
                EngineMetricsStorage::bump(&self.metrics.handler_failures);
                Err(failure(500, render_handler_error(&message, stack.as_deref())))
            }
            Err(InvocationFailure::NoOutput(message)) => {
                self.pool.release(pooled, true);
                EngineMetricsStorage::bump(&self.metrics.handler_failures);
                Err(failure(500, message))
            }
            Err(InvocationFailure::Engine(e)) => {
                pooled.guest.interrupt().cancel();
                self.pool.release(pooled, false);
                match e.kind() {
                    ErrorKind::Canceled => {
                        EngineMetricsStorage::bump(&self.metrics.timeouts);
                        Err(failure(
                            504,
                            format!(
                                "Function execution timed out ({}ms)",
                                self.options.function_timeout.as_millis()
                            ),
                        ))
                    }
                    ErrorKind::ResourceExhausted => {
                        Err(failure(500, "Function exceeded its memory limit".into()))
                    }
                    _ => {
                        tracing::error!(error = %e, "invocation failed in the engine");
                        Err(failure(500, "internal error".to_string()))
                    }
                }
            }
        }
    }

    /// Steps 5 to 9: context setup, bootstrap, handler run under the
    /// deadline, response assembly. Cleanup runs on every path.
    async fn run_invocation(
        &self,
        pooled: &PooledGuest,
        metadata: FunctionMetadata,
        package: PackagePaths,
        policy: Arc<NetworkPolicy>,
        request: FunctionRequest,
    ) -> Result<FunctionResponse, InvocationFailure> {
        let spec = InvocationSpec {
            function_id: metadata.function_id,
            project_id: metadata.project_id,
            package_digest: package.digest,
            package_root: package.root,
            env_vars: metadata.env_vars,
            policy,
            kv: Arc::clone(&self.providers.kv),
            script_cache: self.script_cache.clone(),
        };

        let context = ExecutionContext::new(
            Arc::clone(&pooled.guest),
            Arc::clone(&pooled.bootstrap),
            spec,
        )
        .await
        .map_err(InvocationFailure::Engine)?;

        pooled.guest.interrupt().arm(self.options.function_timeout);
        let work = async {
            context.bootstrap().await?;
            context.setup_request(&request).await?;
            context.run_handler().await
        };
        let outcome = tokio::time::timeout(self.options.function_timeout + TIMEOUT_GRACE, work).await;
        pooled.guest.interrupt().disarm();

        let result = match outcome {
            // The belt fired: the guest never came back from host code.
            Err(_) => {
                pooled.guest.interrupt().cancel();
                Err(InvocationFailure::Engine(FuncliteError::Canceled(
                    "execution timed out".into(),
                )))
            }
            Ok(Err(e)) => Err(InvocationFailure::Engine(e)),
            Ok(Ok(HandlerOutcome::Threw { message, stack })) => {
                Err(InvocationFailure::Handler { message, stack })
            }
            Ok(Ok(HandlerOutcome::Returned(returned))) => match context.finish(returned) {
                Ok(response) => Ok(response),
                Err(e) => Err(InvocationFailure::NoOutput(e.message().to_string())),
            },
        };

        if result.is_err() {
            let dropped = context.take_logs();
            if !dropped.is_empty() {
                tracing::debug!(lines = dropped.len(), "dropping logs of failed invocation");
            }
        }
        context.cleanup().await;
        result
    }
}

fn failure(status_code: u16, error: String) -> FunctionFailure {
    FunctionFailure { error, status_code }
}

/// Handler errors reach the caller with the guest-side message and stack;
/// source URLs are virtual paths, so nothing host-side can leak.
fn render_handler_error(message: &str, stack: Option<&str>) -> String {
    match stack {
        Some(stack) if !stack.trim().is_empty() => format!("{}\n{}", message, stack.trim_end()),
        _ => message.to_string(),
    }
}
