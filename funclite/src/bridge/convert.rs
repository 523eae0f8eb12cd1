//! Data marshalling across the bridge.
//!
//! Primitives copy by value, byte sequences cross as typed arrays, compound
//! records cross as JSON deep copies. Nothing host-owned is ever reachable
//! from a guest value.

use funclite_shared::{FuncliteError, FuncliteResult};
use rquickjs::convert::Coerced;
use rquickjs::{ArrayBuffer, Ctx, FromJs, IntoJs, TypedArray, Value};

use super::encoding::decode_string;

/// Byte payload leaving the host: materialises as a `Uint8Array`.
#[derive(Clone, Debug, Default)]
pub struct JsBytes(pub Vec<u8>);

impl<'js> IntoJs<'js> for JsBytes {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        TypedArray::new(ctx.clone(), self.0)?.into_js(ctx)
    }
}

/// Structured payload leaving the host: deep-copied through JSON.
#[derive(Clone, Debug)]
pub struct JsJson(pub serde_json::Value);

impl<'js> IntoJs<'js> for JsJson {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        let text = serde_json::to_string(&self.0)
            .map_err(|_| rquickjs::Error::new_into_js("json", "value"))?;
        ctx.json_parse(text)
    }
}

/// Byte payload entering the host: accepts `Uint8Array`, `ArrayBuffer` or a
/// string (taken as UTF-8).
#[derive(Clone, Debug)]
pub struct BytesArg(pub Vec<u8>);

impl<'js> FromJs<'js> for BytesArg {
    fn from_js(_ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Self> {
        if let Some(s) = value.as_string() {
            return Ok(BytesArg(s.to_string()?.into_bytes()));
        }
        if let Ok(array) = value.clone().get::<TypedArray<u8>>() {
            if let Some(bytes) = array.as_bytes() {
                return Ok(BytesArg(bytes.to_vec()));
            }
        }
        if let Ok(buffer) = value.clone().get::<ArrayBuffer>() {
            if let Some(bytes) = buffer.as_bytes() {
                return Ok(BytesArg(bytes.to_vec()));
            }
        }
        Err(rquickjs::Error::new_from_js("value", "bytes"))
    }
}

/// Decode a data argument that may carry its own encoding
/// (`update(data, "hex")` and friends).
pub fn data_with_encoding(data: BytesArg, encoding: Option<&str>) -> FuncliteResult<Vec<u8>> {
    match encoding {
        None | Some("utf8") | Some("utf-8") | Some("buffer") => Ok(data.0),
        Some(enc) => {
            let text = String::from_utf8(data.0)
                .map_err(|_| FuncliteError::InvalidArgument("expected string data".into()))?;
            decode_string(&text, enc)
        }
    }
}

/// Result of read operations that honour an optional encoding: decoded text
/// when an encoding was named, raw bytes otherwise.
#[derive(Clone, Debug)]
pub enum TextOrBytes {
    Text(String),
    Bytes(Vec<u8>),
}

impl<'js> IntoJs<'js> for TextOrBytes {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        match self {
            TextOrBytes::Text(s) => s.into_js(ctx),
            TextOrBytes::Bytes(b) => JsBytes(b).into_js(ctx),
        }
    }
}

/// Envelope carried by promise-returning bridge calls.
///
/// Futures cannot touch the context, so async failures cross as a marked
/// record; the bootstrap re-throws them as typed errors on the guest side.
pub enum AsyncReply<T> {
    Ok(T),
    Err { kind: &'static str, message: String },
}

impl<T> From<FuncliteResult<T>> for AsyncReply<T> {
    fn from(result: FuncliteResult<T>) -> Self {
        match result {
            Ok(value) => AsyncReply::Ok(value),
            Err(err) => AsyncReply::Err {
                kind: err.kind().as_str(),
                message: err.message().to_string(),
            },
        }
    }
}

impl<'js, T: IntoJs<'js>> IntoJs<'js> for AsyncReply<T> {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        match self {
            AsyncReply::Ok(value) => value.into_js(ctx),
            AsyncReply::Err { kind, message } => {
                let obj = rquickjs::Object::new(ctx.clone())?;
                obj.set("__bridgeError", true)?;
                obj.set("kind", kind)?;
                obj.set("message", message)?;
                Ok(obj.into_value())
            }
        }
    }
}

/// Throw a typed error into the guest (sync bridge calls).
///
/// The error object carries `kind` so guest code can branch on it; the
/// message is already host-path free by construction.
pub fn throw_funclite(ctx: &Ctx<'_>, err: FuncliteError) -> rquickjs::Error {
    match build_error_value(ctx, &err) {
        Ok(value) => ctx.throw(value),
        Err(e) => e,
    }
}

fn build_error_value<'js>(
    ctx: &Ctx<'js>,
    err: &FuncliteError,
) -> rquickjs::Result<Value<'js>> {
    let exception = rquickjs::Exception::from_message(ctx.clone(), err.message())?;
    exception.set("kind", err.kind().as_str())?;
    Ok(exception.into_value())
}

/// Map a host result into a sync bridge return.
pub fn sync_result<'js, T>(ctx: &Ctx<'js>, result: FuncliteResult<T>) -> rquickjs::Result<T> {
    result.map_err(|e| throw_funclite(ctx, e))
}

/// Render an arbitrary guest value as stable text (console, inspect).
pub fn stringify_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    if value.is_undefined() {
        return "undefined".into();
    }
    if value.is_null() {
        return "null".into();
    }
    if value.is_object() && !value.is_function() {
        if let Ok(Some(text)) = ctx.json_stringify(value.clone()) {
            if let Ok(text) = text.to_string() {
                return text;
            }
        }
    }
    value
        .clone()
        .get::<Coerced<String>>()
        .map(|c| c.0)
        .unwrap_or_else(|_| "[unrepresentable]".into())
}
