//! URL and querystring bridge.
//!
//! `_url_parse` returns a flat component record; `URLSearchParams` is
//! stateful host-side behind a handle so mutation semantics match the usual
//! class; querystring ops are stateless.

use std::sync::Arc;

use funclite_shared::{FuncliteError, FuncliteResult};
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use rquickjs::Ctx;
use rquickjs::function::{Func, Opt};
use url::Url;

use super::convert::{JsJson, sync_result};
use super::handles::HandleObject;
use super::BridgeState;

/// Ordered multi-map behind a `URLSearchParams` handle.
#[derive(Clone, Debug, Default)]
pub struct SearchParams {
    entries: Vec<(String, String)>,
}

impl SearchParams {
    pub fn parse(init: &str) -> Self {
        let trimmed = init.strip_prefix('?').unwrap_or(init);
        let entries = form_urlencoded::parse(trimmed.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn set(&mut self, name: &str, value: String) {
        let mut kept_first = false;
        self.entries.retain_mut(|(k, v)| {
            if k != name {
                return true;
            }
            if kept_first {
                return false;
            }
            kept_first = true;
            *v = value.clone();
            true
        });
        if !kept_first {
            self.entries.push((name.to_string(), value));
        }
    }

    pub fn append(&mut self, name: String, value: String) {
        self.entries.push((name, value));
    }

    pub fn delete(&mut self, name: &str) {
        self.entries.retain(|(k, _)| k != name);
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == name)
    }

    pub fn to_query(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.entries {
            serializer.append_pair(k, v);
        }
        serializer.finish()
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }
}

fn parse_url(input: &str, base: Option<&str>) -> FuncliteResult<serde_json::Value> {
    let malformed = |_| FuncliteError::InvalidArgument(format!("invalid URL: {}", input));
    let url = match base {
        Some(base) => {
            let base = Url::parse(base)
                .map_err(|_| FuncliteError::InvalidArgument(format!("invalid base URL: {}", base)))?;
            base.join(input).map_err(malformed)?
        }
        None => Url::parse(input).map_err(malformed)?,
    };
    let port = url.port().map(|p| p.to_string()).unwrap_or_default();
    let host = match (url.host_str(), url.port()) {
        (Some(h), Some(p)) => format!("{}:{}", h, p),
        (Some(h), None) => h.to_string(),
        _ => String::new(),
    };
    let search = url.query().map(|q| format!("?{}", q)).unwrap_or_default();
    let hash = url.fragment().map(|f| format!("#{}", f)).unwrap_or_default();
    Ok(serde_json::json!({
        "href": url.as_str(),
        "origin": url.origin().ascii_serialization(),
        "protocol": format!("{}:", url.scheme()),
        "username": url.username(),
        "password": url.password().unwrap_or(""),
        "host": host,
        "hostname": url.host_str().unwrap_or(""),
        "port": port,
        "pathname": url.path(),
        "search": search,
        "hash": hash,
    }))
}

fn qs_parse(input: &str) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for (key, value) in form_urlencoded::parse(input.trim_start_matches('?').as_bytes()) {
        let key = key.into_owned();
        let value = serde_json::Value::String(value.into_owned());
        match out.get_mut(&key) {
            None => {
                out.insert(key, value);
            }
            Some(serde_json::Value::Array(list)) => list.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = serde_json::Value::Array(vec![first, value]);
            }
        }
    }
    serde_json::Value::Object(out)
}

fn qs_stringify(record: &serde_json::Value) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    if let Some(map) = record.as_object() {
        for (key, value) in map {
            match value {
                serde_json::Value::Array(items) => {
                    for item in items {
                        serializer.append_pair(key, &json_scalar_to_string(item));
                    }
                }
                other => {
                    serializer.append_pair(key, &json_scalar_to_string(other));
                }
            }
        }
    }
    serializer.finish()
}

fn json_scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn with_search_params<'js, R>(
    ctx: &Ctx<'js>,
    state: &BridgeState,
    handle: u32,
    f: impl FnOnce(&mut SearchParams) -> R,
) -> rquickjs::Result<R> {
    let mut handles = state.handles.lock();
    match sync_result(ctx, handles.get_mut(handle))? {
        HandleObject::SearchParams(params) => Ok(f(params)),
        _ => Err(super::throw_funclite(
            ctx,
            FuncliteError::InvalidArgument("handle is not search params".into()),
        )),
    }
}

pub fn install(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    globals.set(
        "_url_parse",
        Func::from(|ctx: Ctx<'_>, input: String, base: Opt<String>| {
            sync_result(&ctx, parse_url(&input, base.0.as_deref()).map(JsJson))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_url_spNew",
        Func::from(move |init: Opt<String>| {
            let params = match init.0 {
                Some(init) => SearchParams::parse(&init),
                None => SearchParams::default(),
            };
            Ok::<_, rquickjs::Error>(
                st.handles.lock().insert(HandleObject::SearchParams(params)),
            )
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_url_spGet",
        Func::from(move |ctx: Ctx<'_>, handle: u32, name: String| {
            with_search_params(&ctx, &st, handle, |p| p.get(&name).map(|s| s.to_string()))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_url_spGetAll",
        Func::from(move |ctx: Ctx<'_>, handle: u32, name: String| {
            with_search_params(&ctx, &st, handle, |p| p.get_all(&name))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_url_spSet",
        Func::from(move |ctx: Ctx<'_>, handle: u32, name: String, value: String| {
            with_search_params(&ctx, &st, handle, |p| p.set(&name, value))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_url_spAppend",
        Func::from(move |ctx: Ctx<'_>, handle: u32, name: String, value: String| {
            with_search_params(&ctx, &st, handle, |p| p.append(name, value))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_url_spDelete",
        Func::from(move |ctx: Ctx<'_>, handle: u32, name: String| {
            with_search_params(&ctx, &st, handle, |p| p.delete(&name))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_url_spHas",
        Func::from(move |ctx: Ctx<'_>, handle: u32, name: String| {
            with_search_params(&ctx, &st, handle, |p| p.has(&name))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_url_spToString",
        Func::from(move |ctx: Ctx<'_>, handle: u32| {
            with_search_params(&ctx, &st, handle, |p| p.to_query())
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_url_spEntries",
        Func::from(move |ctx: Ctx<'_>, handle: u32| {
            let entries = with_search_params(&ctx, &st, handle, |p| {
                p.entries()
                    .iter()
                    .map(|(k, v)| serde_json::json!([k, v]))
                    .collect::<Vec<_>>()
            })?;
            Ok::<_, rquickjs::Error>(JsJson(serde_json::Value::Array(entries)))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_url_spDispose",
        Func::from(move |handle: u32| {
            st.handles.lock().try_remove(handle);
            Ok::<_, rquickjs::Error>(())
        }),
    )?;

    // ---- querystring ----
    globals.set(
        "_qs_parse",
        Func::from(|input: String| Ok::<_, rquickjs::Error>(JsJson(qs_parse(&input)))),
    )?;

    globals.set(
        "_qs_stringify",
        Func::from(|ctx: Ctx<'_>, record: rquickjs::Value<'_>| {
            let text = ctx
                .json_stringify(record)?
                .map(|s| s.to_string())
                .transpose()?
                .unwrap_or_else(|| "{}".into());
            let json: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
            Ok::<_, rquickjs::Error>(qs_stringify(&json))
        }),
    )?;

    globals.set(
        "_qs_escape",
        Func::from(|input: String| {
            Ok::<_, rquickjs::Error>(
                utf8_percent_encode(&input, NON_ALPHANUMERIC).to_string(),
            )
        }),
    )?;

    globals.set(
        "_qs_unescape",
        Func::from(|input: String| {
            let replaced = input.replace('+', " ");
            Ok::<_, rquickjs::Error>(
                percent_decode_str(&replaced)
                    .decode_utf8_lossy()
                    .into_owned(),
            )
        }),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parse_flattens_components() {
        let record = parse_url("https://user:pw@example.com:8443/a/b?x=1#frag", None).unwrap();
        assert_eq!(record["protocol"], "https:");
        assert_eq!(record["hostname"], "example.com");
        assert_eq!(record["host"], "example.com:8443");
        assert_eq!(record["port"], "8443");
        assert_eq!(record["pathname"], "/a/b");
        assert_eq!(record["search"], "?x=1");
        assert_eq!(record["hash"], "#frag");
        assert_eq!(record["username"], "user");
    }

    #[test]
    fn url_parse_with_base() {
        let record = parse_url("../up", Some("https://example.com/a/b/c")).unwrap();
        assert_eq!(record["pathname"], "/a/up");
    }

    #[test]
    fn bad_url_is_invalid_argument() {
        let err = parse_url("::not a url::", None).unwrap_err();
        assert_eq!(err.kind(), funclite_shared::ErrorKind::InvalidArgument);
    }

    #[test]
    fn search_params_ordering_and_set_semantics() {
        let mut params = SearchParams::parse("a=1&b=2&a=3");
        assert_eq!(params.get("a"), Some("1"));
        assert_eq!(params.get_all("a"), vec!["1", "3"]);
        // set replaces the first and drops the rest
        params.set("a", "9".into());
        assert_eq!(params.to_query(), "a=9&b=2");
        params.append("c".into(), "x y".into());
        assert_eq!(params.to_query(), "a=9&b=2&c=x+y");
        params.delete("b");
        assert!(!params.has("b"));
    }

    #[test]
    fn qs_parse_collects_repeats_into_arrays() {
        let parsed = qs_parse("a=1&a=2&b=solo");
        assert_eq!(parsed["a"], serde_json::json!(["1", "2"]));
        assert_eq!(parsed["b"], "solo");
    }

    #[test]
    fn qs_stringify_expands_arrays() {
        let record = serde_json::json!({"a": ["1", "2"], "b": 3});
        assert_eq!(qs_stringify(&record), "a=1&a=2&b=3");
    }

    #[test]
    fn escape_unescape_round_trip() {
        let input = "a b&c=d/π";
        let escaped = utf8_percent_encode(input, NON_ALPHANUMERIC).to_string();
        let back = percent_decode_str(&escaped).decode_utf8_lossy().into_owned();
        assert_eq!(back, input);
    }
}
