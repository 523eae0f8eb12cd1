//! Policy-enforced outbound HTTP.
//!
//! Backs the guest `fetch` global. Redirects are never delegated to the
//! client: each hop is followed manually and re-validated against the
//! network policy, before the host lookup and again for every resolved
//! address, so a redirect into a private range dies the same way a direct
//! connection would.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use funclite_shared::{FuncliteError, FuncliteResult};
use rquickjs::function::{Async, Func, Opt};
use rquickjs::{Ctx, IntoJs, Object, Value};
use serde::Deserialize;
use url::Url;

use super::convert::{AsyncReply, BytesArg, JsBytes, JsJson};
use super::dns::resolve_host_addrs;
use super::BridgeState;

const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FetchOptions {
    url: String,
    method: String,
    headers: HashMap<String, String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".into(),
            headers: HashMap::new(),
        }
    }
}

/// Final response crossing back into the guest.
pub struct FetchReply {
    status: u16,
    headers: serde_json::Value,
    body: Vec<u8>,
    url: String,
}

impl<'js> IntoJs<'js> for FetchReply {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        let obj = Object::new(ctx.clone())?;
        obj.set("status", self.status)?;
        obj.set("headers", JsJson(self.headers))?;
        obj.set("body", JsBytes(self.body))?;
        obj.set("url", self.url)?;
        Ok(obj.into_value())
    }
}

fn default_port(url: &Url) -> FuncliteResult<u16> {
    match url.scheme() {
        "http" => Ok(url.port().unwrap_or(80)),
        "https" => Ok(url.port().unwrap_or(443)),
        other => Err(FuncliteError::InvalidArgument(format!(
            "unsupported URL scheme: {}",
            other
        ))),
    }
}

/// Validate one hop and pin the client to an approved address.
async fn checked_client(state: &BridgeState, url: &Url) -> FuncliteResult<reqwest::Client> {
    let host = url
        .host_str()
        .ok_or_else(|| FuncliteError::InvalidArgument("URL has no host".into()))?
        .to_string();
    let port = default_port(url)?;

    state.policy.check_host_port(&host, port)?;
    let addrs = resolve_host_addrs(&host).await?;
    state.policy.check_resolved(&host, port, &addrs)?;

    let pinned = SocketAddr::new(addrs[0], port);
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .resolve(&host, pinned)
        .build()
        .map_err(|e| FuncliteError::Internal(format!("failed to build HTTP client: {}", e)))
}

pub async fn fetch(
    state: &BridgeState,
    options: FetchOptions,
    body: Option<Vec<u8>>,
) -> FuncliteResult<FetchReply> {
    let mut url = Url::parse(&options.url)
        .map_err(|_| FuncliteError::InvalidArgument(format!("invalid URL: {}", options.url)))?;
    let mut method = reqwest::Method::from_bytes(options.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| FuncliteError::InvalidArgument(format!("invalid method: {}", options.method)))?;
    let mut body = body;

    for _hop in 0..=MAX_REDIRECTS {
        let client = checked_client(state, &url).await?;
        let mut request = client.request(method.clone(), url.clone());
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        if let Some(bytes) = &body {
            request = request.body(bytes.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|e| FuncliteError::Internal(format!("request failed: {}", scrub(&e))))?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    FuncliteError::Internal("redirect without a location header".into())
                })?;
            url = url.join(location).map_err(|_| {
                FuncliteError::InvalidArgument(format!("invalid redirect target: {}", location))
            })?;
            // 303 always demotes to GET; 301/302 demote non-GET requests the
            // way browsers do; 307/308 preserve method and body.
            if status == reqwest::StatusCode::SEE_OTHER
                || (method != reqwest::Method::GET
                    && (status == reqwest::StatusCode::MOVED_PERMANENTLY
                        || status == reqwest::StatusCode::FOUND))
            {
                method = reqwest::Method::GET;
                body = None;
            }
            continue;
        }

        let mut headers = serde_json::Map::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(
                    name.as_str().to_ascii_lowercase(),
                    serde_json::Value::String(value.to_string()),
                );
            }
        }
        let final_url = response.url().to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FuncliteError::Internal(format!("failed to read body: {}", scrub(&e))))?;
        return Ok(FetchReply {
            status: status.as_u16(),
            headers: serde_json::Value::Object(headers),
            body: bytes.to_vec(),
            url: final_url,
        });
    }
    Err(FuncliteError::InvalidArgument("too many redirects".into()))
}

// reqwest errors can embed local socket details; keep only the outline.
fn scrub(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "timed out".into()
    } else if err.is_connect() {
        "connection failed".into()
    } else {
        "transport error".into()
    }
}

pub fn install(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    let st = Arc::clone(state);
    ctx.globals().set(
        "_http_fetch",
        Func::from(Async(move |options_json: String, body: Opt<BytesArg>| {
            let st = Arc::clone(&st);
            async move {
                let result = st
                    .guard(async {
                        let options: FetchOptions = serde_json::from_str(&options_json)
                            .map_err(|_| {
                                FuncliteError::InvalidArgument("invalid fetch options".into())
                            })?;
                        fetch(&st, options, body.0.map(|b| b.0)).await
                    })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;
    Ok(())
}
