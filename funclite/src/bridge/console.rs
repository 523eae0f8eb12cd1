//! Console bridge.
//!
//! Four levels, appended in emission order to the invocation's log buffer.
//! Arguments are stringified host-side so persisted logs stay stable text.

use std::sync::Arc;

use funclite_shared::LogLevel;
use rquickjs::function::{Func, Rest};
use rquickjs::{Ctx, Value};

use super::BridgeState;
use super::constrain_ctx_str_rest_value;
use super::convert::stringify_value;

pub fn install(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    let st = Arc::clone(state);
    ctx.globals().set(
        "_console_write",
        Func::from(constrain_ctx_str_rest_value(move |ctx: Ctx<'_>, level: String, args: Rest<Value<'_>>| {
            let level = level.parse::<LogLevel>().unwrap_or(LogLevel::Log);
            let message = args
                .0
                .iter()
                .map(|v| stringify_value(&ctx, v))
                .collect::<Vec<_>>()
                .join(" ");
            st.append_log(level, message);
            Ok::<_, rquickjs::Error>(())
        })),
    )?;
    Ok(())
}
