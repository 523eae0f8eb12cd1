//! Sandbox behaviour: confinement, module rules, shim round trips,
//! context isolation.

mod common;

use common::{TestContext, handler};
use funclite::ResponseData;
use funclite_test_utils::PackageBuilder;

fn text(data: &ResponseData) -> &str {
    match data {
        ResponseData::Text(s) => s,
        other => panic!("expected text body, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fs_escape_is_denied_and_guest_survives() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "escape",
        handler(
            "module.exports = (req, res) => {\n\
             require('fs').readFileSync('../../../etc/passwd');\n\
             res.send('should not get here');\n\
             };",
        ),
    );
    ctx.deploy("ok", handler("module.exports = (req, res) => res.send('still fine');"));

    let failure = ctx.invoke_simple("escape").await.unwrap_err();
    assert_eq!(failure.status_code, 500);
    let lowered = failure.error.to_ascii_lowercase();
    assert!(
        lowered.contains("permission") || lowered.contains("escape"),
        "error: {}",
        failure.error
    );
    // The error text names the guest path universe, never the host.
    assert!(!failure.error.contains("/tmp/"));
    assert_eq!(ctx.engine.pool().metrics().guests_corrupted_total(), 0);

    let response = ctx.invoke_simple("ok").await.unwrap();
    assert_eq!(text(&response.data), "still fine");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn caught_escape_lets_the_handler_continue() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "catcher",
        handler(
            "module.exports = (req, res) => {\n\
             try {\n\
             require('fs').readFileSync('/etc/passwd');\n\
             res.send('leaked');\n\
             } catch (err) {\n\
             res.send('kind=' + err.kind);\n\
             }\n\
             };",
        ),
    );
    let response = ctx.invoke_simple("catcher").await.unwrap();
    assert_eq!(text(&response.data), "kind=PermissionDenied");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bare_specifiers_outside_the_set_are_denied() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "deny",
        handler(
            "module.exports = (req, res) => {\n\
             try {\n\
             require('child_process');\n\
             res.send('allowed');\n\
             } catch (err) {\n\
             res.send('kind=' + err.kind);\n\
             }\n\
             };",
        ),
    );
    let response = ctx.invoke_simple("deny").await.unwrap();
    assert_eq!(text(&response.data), "kind=ModuleDenied");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn node_prefixed_builtins_resolve() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "nodealias",
        handler(
            "const path = require('node:path');\n\
             module.exports = (req, res) => res.send(path.join('/app', 'x', '..', 'y.js'));",
        ),
    );
    let response = ctx.invoke_simple("nodealias").await.unwrap();
    assert_eq!(text(&response.data), "/app/y.js");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sibling_modules_load_through_the_vfs() {
    let mut ctx = TestContext::with_defaults();
    let package = PackageBuilder::new()
        .entry(
            "const lib = require('./lib/greet');\n\
             module.exports = (req, res) => res.send(lib.greet('funclite'));",
        )
        .file(
            "lib/greet.js",
            "exports.greet = (name) => 'hello ' + name;",
        )
        .build();
    ctx.deploy("modular", package);
    let response = ctx.invoke_simple("modular").await.unwrap();
    assert_eq!(text(&response.data), "hello funclite");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cyclic_requires_see_partial_exports() {
    let mut ctx = TestContext::with_defaults();
    let package = PackageBuilder::new()
        .entry(
            "const a = require('./a');\n\
             module.exports = (req, res) => res.json({ aOfB: a.viaB.a, direct: a.a });",
        )
        .file("a.js", "module.exports.a = 1;\nmodule.exports.viaB = require('./b');")
        .file("b.js", "const a = require('./a');\nmodule.exports = a;")
        .build();
    ctx.deploy("cyclic", package);
    let response = ctx.invoke_simple("cyclic").await.unwrap();
    // b imported a mid-definition and captured the partial { a: 1 }.
    assert_eq!(
        response.data,
        ResponseData::Json(serde_json::json!({ "aOfB": 1, "direct": 1 }))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zlib_round_trips_inside_the_guest() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "zipper",
        handler(
            "const zlib = require('zlib');\n\
             module.exports = (req, res) => {\n\
             const input = 'payload '.repeat(50);\n\
             const viaGzip = zlib.gunzipSync(zlib.gzipSync(input)).toString('utf8');\n\
             const viaDeflate = zlib.inflateSync(zlib.deflateSync(input)).toString('utf8');\n\
             const viaBrotli = zlib.brotliDecompressSync(zlib.brotliCompressSync(input)).toString('utf8');\n\
             res.json({ gzip: viaGzip === input, deflate: viaDeflate === input, brotli: viaBrotli === input });\n\
             };",
        ),
    );
    let response = ctx.invoke_simple("zipper").await.unwrap();
    assert_eq!(
        response.data,
        ResponseData::Json(serde_json::json!({ "gzip": true, "deflate": true, "brotli": true }))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crypto_hashes_match_known_vectors() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "hasher",
        handler(
            "const crypto = require('crypto');\n\
             module.exports = (req, res) => res.json({\n\
             sha256: crypto.createHash('sha256').update('abc').digest('hex'),\n\
             hmac: crypto.createHmac('sha256', 'Jefe').update('what do ya want for nothing?').digest('hex'),\n\
             });",
        ),
    );
    let response = ctx.invoke_simple("hasher").await.unwrap();
    assert_eq!(
        response.data,
        ResponseData::Json(serde_json::json!({
            "sha256": "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            "hmac": "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843",
        }))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gcm_cipher_round_trips_inside_the_guest() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "cipher",
        handler(
            "const crypto = require('crypto');\n\
             module.exports = (req, res) => {\n\
             const key = Buffer.alloc(32, 7);\n\
             const iv = Buffer.alloc(12, 9);\n\
             const enc = crypto.createCipheriv('aes-256-gcm', key, iv);\n\
             enc.update('secret message');\n\
             const ciphertext = enc.final();\n\
             const tag = enc.getAuthTag();\n\
             const dec = crypto.createDecipheriv('aes-256-gcm', key, iv);\n\
             dec.update(ciphertext);\n\
             dec.setAuthTag(tag);\n\
             res.send(dec.final().toString('utf8'));\n\
             };",
        ),
    );
    let response = ctx.invoke_simple("cipher").await.unwrap();
    assert_eq!(text(&response.data), "secret message");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn randoms_have_expected_shapes() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "random",
        handler(
            "const crypto = require('crypto');\n\
             module.exports = (req, res) => {\n\
             const uuid = crypto.randomUUID();\n\
             const bytes = crypto.randomBytes(16);\n\
             const n = crypto.randomInt(10, 20);\n\
             res.json({ uuidLen: uuid.length, bytesLen: bytes.length, inRange: n >= 10 && n < 20 });\n\
             };",
        ),
    );
    let response = ctx.invoke_simple("random").await.unwrap();
    assert_eq!(
        response.data,
        ResponseData::Json(serde_json::json!({ "uuidLen": 36, "bytesLen": 16, "inRange": true }))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn url_and_querystring_shims() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "urls",
        handler(
            "const { URL } = require('url');\n\
             const qs = require('querystring');\n\
             module.exports = (req, res) => {\n\
             const u = new URL('https://example.com:8443/a/b?x=1&x=2#frag');\n\
             res.json({\n\
             host: u.host,\n\
             path: u.pathname,\n\
             first: u.searchParams.get('x'),\n\
             all: u.searchParams.getAll('x'),\n\
             qs: qs.stringify({ a: '1', b: ['2', '3'] }),\n\
             });\n\
             };",
        ),
    );
    let response = ctx.invoke_simple("urls").await.unwrap();
    assert_eq!(
        response.data,
        ResponseData::Json(serde_json::json!({
            "host": "example.com:8443",
            "path": "/a/b",
            "first": "1",
            "all": ["1", "2"],
            "qs": "a=1&b=2&b=3",
        }))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fs_streams_are_refused() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "streams",
        handler(
            "module.exports = (req, res) => {\n\
             try {\n\
             require('fs').createReadStream('/app/index.js');\n\
             res.send('created');\n\
             } catch (err) {\n\
             res.send(err.message);\n\
             }\n\
             };",
        ),
    );
    let response = ctx.invoke_simple("streams").await.unwrap();
    assert!(text(&response.data).contains("not supported in isolated environment"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kv_round_trips_through_the_project_store() {
    let mut ctx = TestContext::with_defaults();
    ctx.deploy(
        "kvuser",
        handler(
            "const kv = require('kv');\n\
             module.exports = async (req, res) => {\n\
             await kv.set('counter', { n: 41 });\n\
             const stored = await kv.get('counter');\n\
             const present = await kv.has('counter');\n\
             const keys = await kv.keys();\n\
             res.json({ n: stored.n + 1, present, keys });\n\
             };",
        ),
    );
    let response = ctx.invoke_simple("kvuser").await.unwrap();
    assert_eq!(
        response.data,
        ResponseData::Json(serde_json::json!({ "n": 42, "present": true, "keys": ["counter"] }))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn globals_do_not_leak_between_invocations() {
    let mut ctx = TestContext::new(funclite::EngineOptions {
        base_pool_size: 0,
        max_pool_size: 1,
        ..common::small_options()
    });
    ctx.deploy(
        "writer",
        handler("module.exports = (req, res) => { globalThis.leak = 'secret'; res.send('set'); };"),
    );
    ctx.deploy(
        "reader",
        handler("module.exports = (req, res) => res.send(String(globalThis.leak));"),
    );

    let first = ctx.invoke_simple("writer").await.unwrap();
    assert_eq!(text(&first.data), "set");
    // Same single guest, fresh context: the global must be gone.
    let second = ctx.invoke_simple("reader").await.unwrap();
    assert_eq!(text(&second.data), "undefined");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fd_table_reads_and_mandatory_close() {
    let mut ctx = TestContext::with_defaults();
    let package = PackageBuilder::new()
        .entry(
            "const fs = require('fs');\n\
             module.exports = (req, res) => {\n\
             const fd = fs.openSync('/app/data.txt', 'r');\n\
             const buf = Buffer.alloc(5);\n\
             const n = fs.readSync(fd, buf, 0, 5, 6);\n\
             fs.closeSync(fd);\n\
             res.send(buf.slice(0, n).toString('utf8'));\n\
             };",
        )
        .file("data.txt", "hello world")
        .build();
    ctx.deploy("fds", package);
    let response = ctx.invoke_simple("fds").await.unwrap();
    assert_eq!(text(&response.data), "world");
}
