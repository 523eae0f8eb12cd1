//! End-to-end invocation behaviour: responses, errors, logs, env.

mod common;

use common::{TestContext, handler};
use funclite::{LogLevel, ResponseData};
use funclite_test_utils::{PackageBuilder, RequestBuilder, env_vars};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_json() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "echo",
        handler("module.exports = (req, res) => res.json({ m: req.body.m });"),
    );

    let request = RequestBuilder::new()
        .method("POST")
        .body(serde_json::json!({ "m": "hi" }))
        .header("Content-Type", "application/json")
        .build();
    let response = ctx.invoke("echo", request).await.expect("invocation succeeds");

    assert_eq!(response.status_code, 200);
    assert_eq!(
        response.headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
    assert_eq!(response.data, ResponseData::Json(serde_json::json!({ "m": "hi" })));
    assert!(response.logs.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_function_is_404() {
    let ctx = TestContext::with_defaults();
    let failure = ctx.invoke_simple("ghost").await.unwrap_err();
    assert_eq!(failure.status_code, 404);
    assert!(failure.error.contains("not found"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn synchronous_throw_is_500_and_guest_stays_healthy() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "thrower",
        handler("module.exports = () => { throw new Error('boom from handler'); };"),
    );
    ctx.deploy("ok", handler("module.exports = (req, res) => res.send('fine');"));

    let failure = ctx.invoke_simple("thrower").await.unwrap_err();
    assert_eq!(failure.status_code, 500);
    assert!(failure.error.contains("boom from handler"));
    assert_eq!(ctx.engine.pool().metrics().guests_corrupted_total(), 0);

    // The same pool keeps serving.
    let response = ctx.invoke_simple("ok").await.expect("pool still healthy");
    assert_eq!(response.data, ResponseData::Text("fine".into()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_stack_uses_virtual_paths() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "thrower",
        handler("module.exports = () => { throw new Error('with stack'); };"),
    );
    let failure = ctx.invoke_simple("thrower").await.unwrap_err();
    assert!(failure.error.contains("with stack"));
    // Stack traces, when present, name the virtual tree only.
    assert!(!failure.error.contains("/tmp/"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_output_is_a_500() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy("silent", handler("module.exports = () => {};"));
    let failure = ctx.invoke_simple("silent").await.unwrap_err();
    assert_eq!(failure.status_code, 500);
    assert!(failure.error.contains("did not produce any output"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn returned_value_becomes_the_body() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "returner",
        handler("module.exports = (req, res) => { res.status(201); return { made: true }; };"),
    );
    let response = ctx.invoke_simple("returner").await.unwrap();
    assert_eq!(response.status_code, 201);
    assert_eq!(response.data, ResponseData::Json(serde_json::json!({ "made": true })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_handlers_are_awaited() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "sleeper",
        handler(
            "module.exports = async (req, res) => {\n\
             await new Promise((resolve) => setTimeout(resolve, 20));\n\
             res.send('woke');\n\
             };",
        ),
    );
    let response = ctx.invoke_simple("sleeper").await.unwrap();
    assert_eq!(response.data, ResponseData::Text("woke".into()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn console_logs_are_captured_in_order() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "logger",
        handler(
            "module.exports = (req, res) => {\n\
             console.log('first', 1);\n\
             console.warn('second');\n\
             console.error('third', { nested: true });\n\
             res.send('ok');\n\
             };",
        ),
    );
    let response = ctx.invoke_simple("logger").await.unwrap();
    assert_eq!(response.logs.len(), 3);
    assert_eq!(response.logs[0].level, LogLevel::Log);
    assert_eq!(response.logs[0].message, "first 1");
    assert_eq!(response.logs[1].level, LogLevel::Warn);
    assert_eq!(response.logs[2].level, LogLevel::Error);
    assert!(response.logs[2].message.contains("nested"));
    assert!(response.logs[0].timestamp <= response.logs[2].timestamp);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn env_vars_reach_the_handler() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy_with_env(
        "envy",
        handler("module.exports = (req, res) => res.send(process.env.GREETING);"),
        env_vars(&[("GREETING", "hello from env")]),
    );
    let response = ctx.invoke_simple("envy").await.unwrap();
    assert_eq!(response.data, ResponseData::Text("hello from env".into()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_accessors_work() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "inspect",
        handler(
            "module.exports = (req, res) => res.json({\n\
             ua: req.get('User-Agent'),\n\
             isJson: req.is('json'),\n\
             q: req.query.page,\n\
             });",
        ),
    );
    let request = RequestBuilder::new()
        .header("User-Agent", "funclite-test")
        .header("Content-Type", "application/json")
        .query("page", "3")
        .build();
    let response = ctx.invoke("inspect", request).await.unwrap();
    assert_eq!(
        response.data,
        ResponseData::Json(serde_json::json!({
            "ua": "funclite-test",
            "isJson": true,
            "q": "3",
        }))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn header_names_are_lowercased_last_write_wins() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "headers",
        handler(
            "module.exports = (req, res) => {\n\
             res.setHeader('X-Thing', 'a');\n\
             res.set('x-thing', 'b');\n\
             res.send('done');\n\
             };",
        ),
    );
    let response = ctx.invoke_simple("headers").await.unwrap();
    assert_eq!(response.headers.get("x-thing").map(String::as_str), Some("b"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_file_sets_content_type() {
    let mut ctx = TestContext::with_defaults();
    let package = PackageBuilder::new()
        .entry("module.exports = (req, res) => res.sendFile('/app/data.json');")
        .file("data.json", "{\"fromFile\":true}")
        .build();
    ctx.deploy("filer", package);
    let response = ctx.invoke_simple("filer").await.unwrap();
    assert_eq!(
        response.headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
    match response.data {
        ResponseData::Bytes(bytes) => assert_eq!(bytes, b"{\"fromFile\":true}"),
        other => panic!("expected bytes, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_entry_module_is_a_500() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy("broken", handler("this is not javascript ("));
    let failure = ctx.invoke_simple("broken").await.unwrap_err();
    assert_eq!(failure.status_code, 500);
    // Syntax errors are handler territory, not engine corruption.
    assert_eq!(ctx.engine.pool().metrics().guests_corrupted_total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_function_export_is_a_500() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy("notafn", handler("module.exports = 42;"));
    let failure = ctx.invoke_simple("notafn").await.unwrap_err();
    assert_eq!(failure.status_code, 500);
    assert!(failure.error.contains("handler"));
}
