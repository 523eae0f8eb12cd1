//! Project-scoped key-value bridge.
//!
//! Values cross as JSON text; the shim parses and stringifies on its side.
//! Quota enforcement lives in the store implementation and surfaces as
//! `ResourceExhausted`.

use std::sync::Arc;
use std::time::Duration;

use rquickjs::Ctx;
use rquickjs::function::{Async, Func, Opt};

use super::convert::AsyncReply;
use super::BridgeState;

pub fn install(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let st = Arc::clone(state);
    globals.set(
        "_kv_get",
        Func::from(Async(move |key: String| {
            let st = Arc::clone(&st);
            async move {
                let result = st
                    .guard(async { st.kv.get(&st.project_id, &key).await })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_kv_set",
        Func::from(Async(move |key: String, value: String, ttl_ms: Opt<f64>| {
            let st = Arc::clone(&st);
            async move {
                let ttl = ttl_ms
                    .0
                    .filter(|ms| *ms > 0.0)
                    .map(|ms| Duration::from_millis(ms as u64));
                let result = st
                    .guard(async { st.kv.set(&st.project_id, &key, value, ttl).await })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_kv_delete",
        Func::from(Async(move |key: String| {
            let st = Arc::clone(&st);
            async move {
                let result = st
                    .guard(async { st.kv.delete(&st.project_id, &key).await })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_kv_has",
        Func::from(Async(move |key: String| {
            let st = Arc::clone(&st);
            async move {
                let result = st
                    .guard(async { st.kv.has(&st.project_id, &key).await })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_kv_keys",
        Func::from(Async(move |prefix: Opt<String>| {
            let st = Arc::clone(&st);
            async move {
                let result = st
                    .guard(async {
                        st.kv
                            .keys(&st.project_id, prefix.0.as_deref())
                            .await
                    })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    Ok(())
}
