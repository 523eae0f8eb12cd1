//! Response capture.
//!
//! Handler output is collected host-side through the `_res_*` hooks. The
//! body is last-write-wins; header sets are last-write-wins per lowercased
//! name; the final record is assembled by [`ResponseCapture::finalize`].

use std::collections::HashMap;
use std::sync::Arc;

use funclite_shared::{FunctionResponse, FuncliteError, FuncliteResult, LogEntry, ResponseData};
use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Value};

use super::BridgeState;
use super::convert::{BytesArg, sync_result};
use super::{constrain_ctx_opt_value, constrain_ctx_value};

const CONTENT_TYPE: &str = "content-type";

/// Mutable response state for one invocation.
#[derive(Debug, Default)]
pub struct ResponseCapture {
    status: Option<u16>,
    headers: HashMap<String, String>,
    data: ResponseData,
    /// Whether the handler produced a body explicitly (`send`/`json`/`end`).
    wrote_body: bool,
}

impl ResponseCapture {
    pub fn set_status(&mut self, code: u16) -> FuncliteResult<()> {
        if !(100..=599).contains(&code) {
            return Err(FuncliteError::InvalidArgument(format!(
                "invalid status code: {}",
                code
            )));
        }
        self.status = Some(code);
        Ok(())
    }

    pub fn set_header(&mut self, name: &str, value: String) {
        self.headers.insert(name.to_ascii_lowercase(), value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    /// Body write. Later writes overwrite earlier ones.
    pub fn set_data(&mut self, data: ResponseData, content_type: Option<&str>) {
        if let Some(ct) = content_type {
            self.headers
                .entry(CONTENT_TYPE.into())
                .or_insert_with(|| ct.to_string());
        }
        self.data = data;
        self.wrote_body = true;
    }

    pub fn wrote_body(&self) -> bool {
        self.wrote_body
    }

    /// Assemble the invocation result, applying the return-value rule: when
    /// the handler never wrote a body, its return value becomes the body; no
    /// body and no return value is a failure.
    pub fn finalize(
        mut self,
        returned: Option<ResponseData>,
        logs: Vec<LogEntry>,
    ) -> FuncliteResult<FunctionResponse> {
        if !self.wrote_body {
            match returned {
                Some(data) => {
                    let ct = match &data {
                        ResponseData::Json(_) => Some("application/json"),
                        ResponseData::Text(_) => Some("text/plain; charset=utf-8"),
                        _ => None,
                    };
                    self.set_data(data, ct);
                }
                None => {
                    return Err(FuncliteError::Internal(
                        "Function did not produce any output".into(),
                    ));
                }
            }
        }
        Ok(FunctionResponse {
            status_code: self.status.unwrap_or(200),
            headers: self.headers,
            data: self.data,
            logs,
        })
    }
}

/// Convert a guest value into a body record.
pub fn value_to_body<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> FuncliteResult<ResponseData> {
    if value.is_undefined() || value.is_null() {
        return Ok(ResponseData::None);
    }
    if let Some(s) = value.as_string() {
        return Ok(ResponseData::Text(s.to_string().map_err(|_| {
            FuncliteError::InvalidArgument("unrepresentable response string".into())
        })?));
    }
    if let Ok(bytes) = value.clone().get::<BytesArg>() {
        if !value.is_string() {
            return Ok(ResponseData::Bytes(bytes.0));
        }
    }
    let text = ctx
        .json_stringify(value.clone())
        .ok()
        .flatten()
        .and_then(|s| s.to_string().ok())
        .ok_or_else(|| {
            FuncliteError::InvalidArgument("response body is not serializable".into())
        })?;
    let json = serde_json::from_str(&text)?;
    Ok(ResponseData::Json(json))
}

fn mime_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "html" | "htm" => "text/html; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "json" => "application/json",
        "js" => "text/javascript",
        "css" => "text/css",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

pub fn install(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let st = Arc::clone(state);
    globals.set(
        "_res_status",
        Func::from(move |ctx: Ctx<'_>, code: u16| {
            sync_result(&ctx, st.response.lock().set_status(code))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_res_setHeader",
        Func::from(move |name: String, value: String| {
            st.response.lock().set_header(&name, value);
            Ok::<_, rquickjs::Error>(())
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_res_getHeader",
        Func::from(move |name: String| {
            Ok::<_, rquickjs::Error>(st.response.lock().header(&name).map(|s| s.to_string()))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_res_send",
        Func::from(constrain_ctx_value(move |ctx: Ctx<'_>, value: Value<'_>| {
            let body = value_to_body(&ctx, &value).map_err(|e| super::throw_funclite(&ctx, e))?;
            let ct = match &body {
                ResponseData::Json(_) => Some("application/json"),
                ResponseData::Text(_) => Some("text/html; charset=utf-8"),
                ResponseData::Bytes(_) => Some("application/octet-stream"),
                ResponseData::None => None,
            };
            st.response.lock().set_data(body, ct);
            Ok::<_, rquickjs::Error>(())
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_res_json",
        Func::from(move |ctx: Ctx<'_>, value: Value<'_>| {
            let text = ctx
                .json_stringify(value)?
                .map(|s| s.to_string())
                .transpose()?
                .unwrap_or_else(|| "null".into());
            let json: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| super::throw_funclite(&ctx, FuncliteError::from(e)))?;
            st.response
                .lock()
                .set_data(ResponseData::Json(json), Some("application/json"));
            Ok::<_, rquickjs::Error>(())
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_res_sendFile",
        Func::from(move |ctx: Ctx<'_>, path: String| {
            let bytes = st.vfs.read_file(&path).map_err(|e| super::throw_funclite(&ctx, e))?;
            st.response
                .lock()
                .set_data(ResponseData::Bytes(bytes), Some(mime_for(&path)));
            Ok::<_, rquickjs::Error>(())
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_res_end",
        Func::from(move |ctx: Ctx<'_>, value: Opt<Value<'_>>| {
            if let Some(value) = value.0 {
                if !value.is_undefined() {
                    let body =
                        value_to_body(&ctx, &value).map_err(|e| super::throw_funclite(&ctx, e))?;
                    st.response.lock().set_data(body, None);
                    return Ok::<_, rquickjs::Error>(());
                }
            }
            // Bare end() marks the body written so an empty 200 is valid output.
            let mut response = st.response.lock();
            if !response.wrote_body() {
                response.set_data(ResponseData::None, None);
            }
            Ok::<_, rquickjs::Error>(())
        }),
    )?;

    Ok(())
}
