//! Compiled-script serialization.
//!
//! QuickJS can serialize a compile-only evaluation result to bytecode and
//! replay it in any runtime of the same process, which is what makes the
//! process-wide script cache work across guests. The engine's high-level API
//! does not expose this, so this module goes through the raw `qjs` bindings;
//! all unsafe stays confined here.

use std::ffi::CString;

use funclite_shared::{FuncliteError, FuncliteResult};
use rquickjs::{Ctx, Value, qjs};

/// Compile a script without executing it and serialize it to bytecode.
///
/// `name` becomes the script's source URL; callers pass the virtual path so
/// stack traces never show host paths.
pub fn compile(ctx: &Ctx<'_>, source: &str, name: &str) -> FuncliteResult<Vec<u8>> {
    let raw_ctx = ctx.as_raw().as_ptr();
    let src = CString::new(source)
        .map_err(|_| FuncliteError::InvalidArgument("source contains NUL".into()))?;
    let file = CString::new(name)
        .map_err(|_| FuncliteError::InvalidArgument("script name contains NUL".into()))?;

    unsafe {
        let compiled = qjs::JS_Eval(
            raw_ctx,
            src.as_ptr(),
            source.len() as _,
            file.as_ptr(),
            (qjs::JS_EVAL_TYPE_GLOBAL | qjs::JS_EVAL_FLAG_COMPILE_ONLY) as i32,
        );
        if is_exception(compiled) {
            return Err(FuncliteError::InvalidArgument(format!(
                "failed to compile {}: {}",
                name,
                pending_exception_message(ctx)
            )));
        }
        // Ownership moves into the Value so the compiled object is freed on
        // every path below.
        let compiled = Value::from_raw(ctx.clone(), compiled);

        let mut size: qjs::size_t = 0;
        let buf = qjs::JS_WriteObject(
            raw_ctx,
            &mut size,
            compiled.as_raw(),
            qjs::JS_WRITE_OBJ_BYTECODE as i32,
        );
        if buf.is_null() {
            return Err(FuncliteError::Internal(format!(
                "failed to serialize compiled script {}",
                name
            )));
        }
        let bytes = std::slice::from_raw_parts(buf, size as usize).to_vec();
        qjs::js_free(raw_ctx, buf as *mut std::ffi::c_void);
        Ok(bytes)
    }
}

/// Replay serialized bytecode in `ctx` and return its completion value.
///
/// For a compiled `(function (…) { … })` expression the completion value is
/// the function itself; for a plain script it is whatever the script
/// evaluates to.
pub fn evaluate<'js>(ctx: &Ctx<'js>, bytecode: &[u8]) -> FuncliteResult<Value<'js>> {
    let raw_ctx = ctx.as_raw().as_ptr();
    unsafe {
        let obj = qjs::JS_ReadObject(
            raw_ctx,
            bytecode.as_ptr(),
            bytecode.len() as _,
            qjs::JS_READ_OBJ_BYTECODE as i32,
        );
        if is_exception(obj) {
            return Err(FuncliteError::Internal(format!(
                "failed to deserialize compiled script: {}",
                pending_exception_message(ctx)
            )));
        }
        // JS_EvalFunction consumes the object on both paths.
        let result = qjs::JS_EvalFunction(raw_ctx, obj);
        if is_exception(result) {
            return Err(FuncliteError::InvalidArgument(pending_exception_message(ctx)));
        }
        Ok(Value::from_raw(ctx.clone(), result))
    }
}

unsafe fn is_exception(value: qjs::JSValue) -> bool {
    qjs::JS_VALUE_GET_NORM_TAG(value) == qjs::JS_TAG_EXCEPTION
}

/// Take the pending exception and render it as text, never exposing host
/// detail beyond what the guest script itself produced.
fn pending_exception_message(ctx: &Ctx<'_>) -> String {
    let caught = ctx.catch();
    caught
        .get::<rquickjs::convert::Coerced<String>>()
        .map(|c| c.0)
        .unwrap_or_else(|_| "unknown script error".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Function, Runtime};

    fn with_ctx<R>(f: impl FnOnce(&Ctx<'_>) -> R) -> R {
        let rt = Runtime::new().unwrap();
        let context = Context::full(&rt).unwrap();
        context.with(|ctx| f(&ctx))
    }

    #[test]
    fn compiled_factory_survives_a_round_trip() {
        let bytecode = with_ctx(|ctx| {
            compile(ctx, "(function (a, b) { return a + b; })", "/app/add.js").unwrap()
        });
        // Replay in a different runtime: the cache shares artefacts between
        // guests, so this must work cross-runtime.
        with_ctx(|ctx| {
            let value = evaluate(ctx, &bytecode).unwrap();
            let func = value.into_function().expect("completion value is the factory");
            let sum: i32 = func.call((2, 3)).unwrap();
            assert_eq!(sum, 5);
        });
    }

    #[test]
    fn scripts_run_for_side_effects() {
        with_ctx(|ctx| {
            let bytecode = compile(ctx, "globalThis.__marker = 41 + 1;", "setup.js").unwrap();
            evaluate(ctx, &bytecode).unwrap();
            let marker: i32 = ctx.globals().get("__marker").unwrap();
            assert_eq!(marker, 42);
        });
    }

    #[test]
    fn syntax_errors_are_invalid_argument() {
        with_ctx(|ctx| {
            let err = compile(ctx, "function (", "/app/broken.js").unwrap_err();
            assert_eq!(err.kind(), funclite_shared::ErrorKind::InvalidArgument);
            // Virtual name only; no host path can appear.
            assert!(!err.to_string().contains("/root"));
        });
    }

    #[test]
    fn source_url_is_the_virtual_path() {
        with_ctx(|ctx| {
            let bytecode = compile(
                ctx,
                "(function () { try { null.x; } catch (e) { return e.stack; } })",
                "/app/lib/trace.js",
            )
            .unwrap();
            let func: Function = evaluate(ctx, &bytecode).unwrap().into_function().unwrap();
            let stack: String = func.call(()).unwrap();
            assert!(stack.contains("/app/lib/trace.js"), "stack: {stack}");
        });
    }
}
