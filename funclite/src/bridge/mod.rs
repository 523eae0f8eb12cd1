//! Host-call bridge.
//!
//! The fixed, audited set of host functions exposed into each guest context
//! under flattened names (`_fs_readFileSync`, `_crypto_hashNew`, …). The
//! bootstrap script composes them back into the usual module shapes. No
//! dynamic reflection, no pass-through of host objects: primitives copy by
//! value, bytes cross as typed arrays, stateful resources stay host-side
//! behind integer handles.

pub mod console;
pub mod convert;
pub mod crypto;
pub mod dns;
pub mod encoding;
pub mod fs;
pub mod handles;
pub mod http;
pub mod kv;
pub mod net;
pub mod path;
pub mod response;
pub mod url;
pub mod zlib;

pub use convert::{AsyncReply, BytesArg, JsBytes, JsJson, throw_funclite};
pub use handles::{HandleObject, HandleTable};
pub use response::ResponseCapture;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use funclite_shared::{FuncliteError, FuncliteResult, LogEntry, LogLevel};
use parking_lot::Mutex;
use rquickjs::function::{Async, Func, Opt};
use rquickjs::{Ctx, Value};
use tokio_util::sync::CancellationToken;

use crate::loader::ModuleLoader;
use crate::policy::NetworkPolicy;
use crate::providers::KvStore;
use crate::vfs::{FdTable, VirtualFs};

/// Global slot the loader host call parks a freshly compiled factory in; the
/// guest `require` picks it up immediately after the call returns.
pub const MODULE_FACTORY_SLOT: &str = "__funclite_module_factory";

/// Host-side state for one invocation, shared by every bridge closure of its
/// guest context.
pub struct BridgeState {
    pub function_id: String,
    pub project_id: String,
    pub package_digest: String,
    pub vfs: VirtualFs,
    pub loader: ModuleLoader,
    pub env_vars: HashMap<String, String>,
    pub policy: Arc<NetworkPolicy>,
    pub kv: Arc<dyn KvStore>,
    pub cancel: CancellationToken,
    pub fds: Mutex<FdTable>,
    pub handles: Mutex<HandleTable>,
    pub logs: Mutex<Vec<LogEntry>>,
    pub response: Mutex<ResponseCapture>,
}

impl BridgeState {
    /// Race a bridge future against invocation cancellation.
    ///
    /// Every promise-returning bridge call goes through here so that a fired
    /// timeout fails outstanding calls with `Canceled` instead of letting
    /// them linger.
    pub async fn guard<T>(
        &self,
        fut: impl std::future::Future<Output = FuncliteResult<T>>,
    ) -> FuncliteResult<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(FuncliteError::Canceled("invocation canceled".into()))
            }
            result = fut => result,
        }
    }

    pub fn append_log(&self, level: LogLevel, message: String) {
        self.logs.lock().push(LogEntry {
            level,
            message,
            timestamp: chrono::Utc::now(),
        });
    }

    pub fn take_logs(&self) -> Vec<LogEntry> {
        std::mem::take(&mut self.logs.lock())
    }

    pub fn take_response(&self) -> ResponseCapture {
        std::mem::take(&mut self.response.lock())
    }

    /// Release every handle and descriptor this invocation allocated.
    ///
    /// Runs on every exit path; sockets, files and streams close on drop.
    pub fn release_resources(&self) {
        let leaked_handles = {
            let mut handles = self.handles.lock();
            let described = handles.describe();
            handles.clear();
            described
        };
        let leaked_fds = self.fds.lock().close_all();
        if !leaked_handles.is_empty() || leaked_fds > 0 {
            tracing::debug!(
                function_id = %self.function_id,
                handles = ?leaked_handles,
                fds = leaked_fds,
                "released leaked invocation resources"
            );
        }
    }
}

/// Install the full bridge surface into a guest context.
pub fn install(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    fs::install(ctx, state)?;
    path::install(ctx)?;
    crypto::install(ctx, state)?;
    zlib::install(ctx, state)?;
    url::install(ctx, state)?;
    dns::install(ctx, state)?;
    net::install(ctx, state)?;
    http::install(ctx, state)?;
    console::install(ctx, state)?;
    response::install(ctx, state)?;
    kv::install(ctx, state)?;
    install_loader(ctx, state)?;
    install_timers(ctx, state)?;
    install_util(ctx)?;
    Ok(())
}

fn install_loader(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let st = Arc::clone(state);
    globals.set(
        "_module_resolve",
        Func::from(move |ctx: Ctx<'_>, from_dir: String, specifier: String| {
            let resolved = st
                .loader
                .resolve(&from_dir, &specifier)
                .map_err(|e| throw_funclite(&ctx, e))?;
            let json = serde_json::to_value(&resolved)
                .map_err(|e| throw_funclite(&ctx, FuncliteError::from(e)))?;
            Ok::<_, rquickjs::Error>(JsJson(json))
        }),
    )?;

    // Compiling returns a live function value, which a host return type
    // cannot carry; the factory is parked in a well-known global instead.
    let st = Arc::clone(state);
    globals.set(
        "_module_load",
        Func::from(move |ctx: Ctx<'_>, virtual_path: String| {
            let factory = st
                .loader
                .factory(&ctx, &virtual_path)
                .map_err(|e| throw_funclite(&ctx, e))?;
            ctx.globals().set(MODULE_FACTORY_SLOT, factory)?;
            Ok::<_, rquickjs::Error>(())
        }),
    )?;

    Ok(())
}

fn install_timers(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    let st = Arc::clone(state);
    ctx.globals().set(
        "_sleep",
        Func::from(Async(move |ms: f64| {
            let st = Arc::clone(&st);
            async move {
                let ms = ms.max(0.0).min(u64::MAX as f64) as u64;
                let result = st
                    .guard(async {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        Ok(())
                    })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;
    Ok(())
}

fn install_util(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    globals.set(
        "_util_inspect",
        Func::from(|ctx: Ctx<'_>, value: Value<'_>| {
            Ok::<_, rquickjs::Error>(convert::stringify_value(&ctx, &value))
        }),
    )?;

    globals.set(
        "_util_utf8Encode",
        Func::from(|text: String| Ok::<_, rquickjs::Error>(JsBytes(text.into_bytes()))),
    )?;

    globals.set(
        "_util_utf8Decode",
        Func::from(|data: BytesArg| {
            Ok::<_, rquickjs::Error>(String::from_utf8_lossy(&data.0).into_owned())
        }),
    )?;

    Ok(())
}

/// Helper shared by modules that take an optional encoding argument.
pub(crate) fn opt_str(opt: &Opt<String>) -> Option<&str> {
    opt.0.as_deref()
}

// The closures registered below each take a `Ctx<'js>` alongside one or more
// other `'js`-bound arguments (or return a `'js`-bound value). Rust infers
// each elided `'_` in a closure signature independently, so without an
// explicit `for<'js>` bound the compiler can't prove the argument (or
// return) lifetimes are the same one the host call actually uses. Passing
// the closure through one of these identity functions forces it to be
// checked against the right higher-ranked signature up front.
pub(crate) fn constrain_ctx_value<F, R>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Value<'js>) -> rquickjs::Result<R>,
{
    f
}

pub(crate) fn constrain_ctx_opt_value<F, R>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Opt<Value<'js>>) -> rquickjs::Result<R>,
{
    f
}

pub(crate) fn constrain_ctx_u32_obj<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, u32) -> rquickjs::Result<rquickjs::Object<'js>>,
{
    f
}

pub(crate) fn constrain_ctx_str_rest_value<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, String, rquickjs::function::Rest<Value<'js>>) -> rquickjs::Result<()>,
{
    f
}
