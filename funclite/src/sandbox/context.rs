//! Per-invocation execution context.
//!
//! Owns every resource of one invocation: a fresh guest context inside a
//! pooled guest, the bridge state, the captured response and logs. Cleanup
//! runs on every exit path, including timeout and handler failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use funclite_shared::{FunctionRequest, FunctionResponse, FuncliteError, FuncliteResult, ResponseData};
use parking_lot::Mutex;
use rquickjs::{AsyncContext, CatchResultExt, CaughtError, Ctx, Function, async_with};
use tokio_util::sync::CancellationToken;

use crate::bridge::{self, BridgeState, HandleTable, ResponseCapture};
use crate::loader::{ModuleLoader, ScriptCache};
use crate::policy::NetworkPolicy;
use crate::providers::KvStore;
use crate::vfs::{FdTable, VirtualFs};

use super::bootstrap::BootstrapScript;
use super::guest::Guest;

/// Everything the engine resolved before entering the guest phase.
pub struct InvocationSpec {
    pub function_id: String,
    pub project_id: String,
    pub package_digest: String,
    pub package_root: PathBuf,
    pub env_vars: HashMap<String, String>,
    pub policy: Arc<NetworkPolicy>,
    pub kv: Arc<dyn KvStore>,
    pub script_cache: ScriptCache,
}

/// How the handler concluded, before response assembly.
pub enum HandlerOutcome {
    /// Handler returned (possibly a value used as the body).
    Returned(Option<ResponseData>),
    /// Handler threw. Expected, not corruption.
    Threw { message: String, stack: Option<String> },
}

/// One invocation's guest-side world.
pub struct ExecutionContext {
    guest: Arc<Guest>,
    context: AsyncContext,
    bridge: Arc<BridgeState>,
    bootstrap: Arc<BootstrapScript>,
}

impl ExecutionContext {
    pub async fn new(
        guest: Arc<Guest>,
        bootstrap: Arc<BootstrapScript>,
        spec: InvocationSpec,
    ) -> FuncliteResult<Self> {
        let vfs = VirtualFs::new(&spec.package_root)?;
        let loader = ModuleLoader::new(
            vfs.clone(),
            spec.script_cache.clone(),
            &spec.function_id,
            &spec.package_digest,
        );
        let cancel: CancellationToken = guest.interrupt().token().clone();
        let bridge = Arc::new(BridgeState {
            function_id: spec.function_id,
            project_id: spec.project_id,
            package_digest: spec.package_digest,
            vfs,
            loader,
            env_vars: spec.env_vars,
            policy: spec.policy,
            kv: spec.kv,
            cancel,
            fds: Mutex::new(FdTable::new()),
            handles: Mutex::new(HandleTable::new()),
            logs: Mutex::new(Vec::new()),
            response: Mutex::new(ResponseCapture::default()),
        });

        let context = AsyncContext::full(guest.runtime())
            .await
            .map_err(|e| FuncliteError::Internal(format!("failed to create guest context: {}", e)))?;

        Ok(Self { guest, context, bridge, bootstrap })
    }

    /// Install the bridge and run the pre-compiled bootstrap.
    pub async fn bootstrap(&self) -> FuncliteResult<()> {
        let bridge = Arc::clone(&self.bridge);
        let bootstrap = Arc::clone(&self.bootstrap);
        let env_json = serde_json::to_string(&bridge.env_vars)?;
        let runtime_info = serde_json::json!({
            "arch": std::env::consts::ARCH,
            "platform": std::env::consts::OS,
            "version": format!("funclite/{}", env!("CARGO_PKG_VERSION")),
            "versions": { "funclite": env!("CARGO_PKG_VERSION"), "quickjs": "ng" },
        })
        .to_string();

        async_with!(self.context => |ctx| {
            bridge::install(&ctx, &bridge)
                .map_err(|e| host_error(&ctx, e, "bridge installation failed"))?;
            ctx.globals()
                .set("_envVars", env_json)
                .map_err(|e| host_error(&ctx, e, "environment injection failed"))?;
            ctx.globals()
                .set("_runtimeInfo", runtime_info)
                .map_err(|e| host_error(&ctx, e, "runtime info injection failed"))?;
            bootstrap.run(&ctx)
        })
        .await
    }

    /// Copy the request snapshot into the guest.
    pub async fn setup_request(&self, request: &FunctionRequest) -> FuncliteResult<()> {
        let snapshot = serde_json::to_string(request)?;
        async_with!(self.context => |ctx| {
            ctx.globals()
                .set("_reqData", snapshot)
                .map_err(|e| host_error(&ctx, e, "request injection failed"))
        })
        .await
    }

    /// Load `/app/index.js` through the loader and invoke the handler,
    /// awaiting its promise.
    pub async fn run_handler(&self) -> FuncliteResult<HandlerOutcome> {
        let guest = Arc::clone(&self.guest);
        async_with!(self.context => |ctx| {
            let run: Function = ctx
                .globals()
                .get("_runHandler")
                .map_err(|e| host_error(&ctx, e, "handler entry point missing"))?;
            let promise: rquickjs::Promise = match run.call(()).catch(&ctx) {
                Ok(promise) => promise,
                Err(caught) => return classify_caught(&guest, caught),
            };
            match promise.into_future::<rquickjs::Value>().await.catch(&ctx) {
                Ok(value) => {
                    let returned = match bridge::response::value_to_body(&ctx, &value)? {
                        ResponseData::None => None,
                        data => Some(data),
                    };
                    Ok(HandlerOutcome::Returned(returned))
                }
                Err(caught) => classify_caught(&guest, caught),
            }
        })
        .await
    }

    /// Assemble the final response from the capture, the handler's return
    /// value and the ordered log buffer.
    pub fn finish(&self, returned: Option<ResponseData>) -> FuncliteResult<FunctionResponse> {
        let logs = self.bridge.take_logs();
        let capture = self.bridge.take_response();
        capture.finalize(returned, logs)
    }

    /// Logs for failure paths (the failure record itself carries no logs,
    /// but callers may still want them for diagnostics).
    pub fn take_logs(&self) -> Vec<funclite_shared::LogEntry> {
        self.bridge.take_logs()
    }

    /// Release every invocation resource. Must run on every exit path; the
    /// guest context itself dies with the drop.
    pub async fn cleanup(self) {
        self.bridge.release_resources();
        drop(self.context);
    }
}

/// Convert a host-side rquickjs failure outside user code into `Internal`.
fn host_error(ctx: &Ctx<'_>, err: rquickjs::Error, what: &str) -> FuncliteError {
    let detail = match err {
        rquickjs::Error::Exception => {
            let caught = ctx.catch();
            caught
                .get::<rquickjs::convert::Coerced<String>>()
                .map(|c| c.0)
                .unwrap_or_else(|_| "unknown exception".into())
        }
        other => other.to_string(),
    };
    FuncliteError::Internal(format!("{}: {}", what, detail))
}

/// Sort a caught guest error into timeout, memory exhaustion or a plain
/// handler failure. Timeouts and memory exhaustion are engine-owned errors;
/// anything else is the handler's.
fn classify_caught(guest: &Guest, caught: CaughtError<'_>) -> FuncliteResult<HandlerOutcome> {
    // The interrupt hook fired: this termination belongs to the engine, not
    // the handler, whatever the exception text says.
    if guest.interrupt().is_canceled() || guest.interrupt().deadline_passed() {
        return Err(FuncliteError::Canceled("execution interrupted".into()));
    }
    let (message, stack) = match caught {
        CaughtError::Exception(exception) => {
            let message = exception
                .message()
                .unwrap_or_else(|| "unhandled exception".into());
            (message, exception.stack())
        }
        CaughtError::Value(value) => {
            let message = value
                .get::<rquickjs::convert::Coerced<String>>()
                .map(|c| c.0)
                .unwrap_or_else(|_| "unhandled exception".into());
            (message, None)
        }
        CaughtError::Error(err) => {
            if matches!(err, rquickjs::Error::Allocation) {
                return Err(FuncliteError::ResourceExhausted(
                    "guest memory limit exceeded".into(),
                ));
            }
            (err.to_string(), None)
        }
    };
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("out of memory") || lowered.contains("memory limit") {
        return Err(FuncliteError::ResourceExhausted(
            "guest memory limit exceeded".into(),
        ));
    }
    if lowered.contains("interrupted") {
        return Err(FuncliteError::Canceled("execution interrupted".into()));
    }
    Ok(HandlerOutcome::Threw { message, stack })
}
