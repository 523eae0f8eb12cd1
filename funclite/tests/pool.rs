//! Pool behaviour through the engine: exhaustion, reuse, shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestContext, handler};
use funclite::EngineOptions;
use funclite_test_utils::RequestBuilder;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_pool_fails_fast_with_503() {
    let mut ctx = TestContext::new(EngineOptions {
        base_pool_size: 0,
        max_pool_size: 1,
        memory_limit_mb: 64,
        ..EngineOptions::default()
    });
    ctx.deploy(
        "slow",
        handler(
            "module.exports = async (req, res) => {\n\
             await new Promise((resolve) => setTimeout(resolve, 500));\n\
             res.send('done');\n\
             };",
        ),
    );

    let ctx = Arc::new(ctx);
    let first = {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move { ctx.invoke_simple("slow").await })
    };
    // Let the first invocation claim the only guest.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let failure = ctx.invoke_simple("slow").await.unwrap_err();
    assert_eq!(failure.status_code, 503);
    assert!(failure.error.contains("unavailable"));
    assert_eq!(ctx.engine.metrics().pool_exhausted_total(), 1);

    let response = first.await.unwrap().expect("first invocation completes");
    assert_eq!(response.status_code, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn guests_are_reused_across_invocations() {
    let mut ctx = TestContext::new(EngineOptions {
        base_pool_size: 0,
        max_pool_size: 1,
        memory_limit_mb: 64,
        ..EngineOptions::default()
    });
    ctx.deploy("ok", handler("module.exports = (req, res) => res.send('pong');"));

    for _ in 0..5 {
        let response = ctx.invoke_simple("ok").await.unwrap();
        assert_eq!(response.status_code, 200);
    }
    // One guest served all five invocations.
    assert_eq!(ctx.engine.pool().metrics().guests_created_total(), 1);
    assert_eq!(ctx.engine.pool().size(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_invocations_use_distinct_guests() {
    let mut ctx = TestContext::new(EngineOptions {
        base_pool_size: 0,
        max_pool_size: 4,
        memory_limit_mb: 64,
        ..EngineOptions::default()
    });
    ctx.deploy(
        "pause",
        handler(
            "module.exports = async (req, res) => {\n\
             await new Promise((resolve) => setTimeout(resolve, 200));\n\
             res.send('ok');\n\
             };",
        ),
    );

    let ctx = Arc::new(ctx);
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let ctx = Arc::clone(&ctx);
        tasks.push(tokio::spawn(async move {
            ctx.invoke("pause", RequestBuilder::new().build()).await
        }));
    }
    for task in tasks {
        let response = task.await.unwrap().expect("parallel invocation succeeds");
        assert_eq!(response.status_code, 200);
    }
    assert!(ctx.engine.pool().metrics().guests_created_total() >= 2);
    assert!(ctx.engine.pool().size() <= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn warm_up_reaches_the_base_size() {
    let ctx = TestContext::new(EngineOptions {
        base_pool_size: 2,
        max_pool_size: 4,
        memory_limit_mb: 64,
        ..EngineOptions::default()
    });
    for _ in 0..100 {
        if ctx.engine.pool().idle_count() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ctx.engine.pool().idle_count() >= 2);
    assert!(ctx.engine.pool().size() <= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_rejects_new_invocations() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy("ok", handler("module.exports = (req, res) => res.send('ok');"));

    ctx.engine.shutdown(Duration::from_millis(200)).await;
    let failure = ctx.invoke_simple("ok").await.unwrap_err();
    assert_eq!(failure.status_code, 503);
}
