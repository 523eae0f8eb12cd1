//! Network policy behaviour through the guest: default deny, explicit
//! allows, private-range protection, fetch gating.

mod common;

use common::{TestContext, handler};
use funclite::ResponseData;
use funclite::policy::{NetworkPolicy, NetworkRule, RuleTarget};
use funclite_test_utils::env_vars;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn text(data: &ResponseData) -> &str {
    match data {
        ResponseData::Text(s) => s,
        other => panic!("expected text body, got {:?}", other),
    }
}

const PROBE_SOURCE: &str = "\
module.exports = (req, res) => new Promise((resolve) => {\n\
  const net = require('net');\n\
  const socket = new net.Socket();\n\
  socket.on('error', (err) => { res.send('denied:' + err.kind); resolve(); });\n\
  socket.on('data', (chunk) => { res.send('data:' + chunk.toString('utf8')); socket.destroy(); resolve(); });\n\
  socket.connect(Number(process.env.TARGET_PORT), process.env.TARGET_HOST, () => {\n\
    socket.write('ping');\n\
  });\n\
});";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_policy_denies_every_connect() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy_with_env(
        "probe",
        handler(PROBE_SOURCE),
        env_vars(&[("TARGET_HOST", "192.0.2.1"), ("TARGET_PORT", "80")]),
    );
    let response = ctx.invoke_simple("probe").await.unwrap();
    // The policy check fires before any connection attempt.
    assert_eq!(text(&response.data), "denied:PermissionDenied");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn allow_any_still_blocks_private_ranges() {
    let mut ctx = TestContext::with_defaults();
    ctx.set_policy(NetworkPolicy::new(
        vec![NetworkRule::allow(RuleTarget::Any, 0)],
        vec![],
    ));
    ctx.deploy_with_env(
        "probe",
        handler(PROBE_SOURCE),
        env_vars(&[("TARGET_HOST", "169.254.169.254"), ("TARGET_PORT", "80")]),
    );
    let response = ctx.invoke_simple("probe").await.unwrap();
    assert_eq!(text(&response.data), "denied:PermissionDenied");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn explicit_loopback_allow_connects_to_a_local_server() {
    // One-shot echo server on an ephemeral loopback port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 16];
            if let Ok(n) = socket.read(&mut buf).await {
                let _ = socket.write_all(format!("echo:{}", String::from_utf8_lossy(&buf[..n])).as_bytes()).await;
            }
        }
    });

    let mut ctx = TestContext::with_defaults();
    ctx.set_policy(NetworkPolicy::new(
        vec![],
        vec![NetworkRule::allow(RuleTarget::Cidr("127.0.0.0/8".into()), 0)],
    ));
    ctx.deploy_with_env(
        "probe",
        handler(PROBE_SOURCE),
        env_vars(&[("TARGET_HOST", "127.0.0.1"), ("TARGET_PORT", &port.to_string())]),
    );
    let response = ctx.invoke_simple("probe").await.unwrap();
    assert_eq!(text(&response.data), "data:echo:ping");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deny_rule_beats_later_allow() {
    let mut ctx = TestContext::with_defaults();
    ctx.set_policy(NetworkPolicy::new(
        vec![NetworkRule::deny(RuleTarget::Cidr("127.0.0.0/8".into()), 0)],
        vec![NetworkRule::allow(RuleTarget::Any, 0)],
    ));
    ctx.deploy_with_env(
        "probe",
        handler(PROBE_SOURCE),
        env_vars(&[("TARGET_HOST", "127.0.0.1"), ("TARGET_PORT", "8080")]),
    );
    let response = ctx.invoke_simple("probe").await.unwrap();
    assert_eq!(text(&response.data), "denied:PermissionDenied");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetch_is_policy_gated_too() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "fetcher",
        handler(
            "module.exports = async (req, res) => {\n\
             try {\n\
             await fetch('http://192.0.2.1/');\n\
             res.send('fetched');\n\
             } catch (err) {\n\
             res.send('denied:' + err.kind);\n\
             }\n\
             };",
        ),
    );
    let response = ctx.invoke_simple("fetcher").await.unwrap();
    assert_eq!(text(&response.data), "denied:PermissionDenied");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn guest_stays_healthy_after_denied_connects() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy_with_env(
        "probe",
        handler(PROBE_SOURCE),
        env_vars(&[("TARGET_HOST", "192.0.2.1"), ("TARGET_PORT", "80")]),
    );
    ctx.deploy("ok", handler("module.exports = (req, res) => res.send('fine');"));

    let _ = ctx.invoke_simple("probe").await.unwrap();
    assert_eq!(ctx.engine.pool().metrics().guests_corrupted_total(), 0);
    let response = ctx.invoke_simple("ok").await.unwrap();
    assert_eq!(text(&response.data), "fine");
}
