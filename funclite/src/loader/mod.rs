//! Module loader.
//!
//! Turns a guest `require("./thing")` into a compiled CommonJS factory.
//! Resolution walks the VFS; compilation goes through the process-wide
//! bytecode cache. The per-invocation module registry (cache-before-execute,
//! cycle-tolerant) lives guest-side in the bootstrap's `require`.

mod cache;

pub use cache::{ScriptCache, ScriptKey};

use std::sync::Arc;

use funclite_shared::{FuncliteError, FuncliteResult};
use rquickjs::{Ctx, Value};
use serde::Serialize;

use crate::sandbox::bytecode;
use crate::vfs::{VirtualFs, normalize_guest_path};

/// Bare specifiers a package may require. Everything else is denied.
/// `node:`-prefixed aliases resolve to the same shims.
pub const BUILTIN_MODULES: &[&str] = &[
    "fs",
    "path",
    "crypto",
    "zlib",
    "url",
    "querystring",
    "dns",
    "net",
    "tls",
    "util",
    "kv",
];

/// Outcome of specifier resolution, serialized to the guest `require`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "path")]
pub enum ResolvedModule {
    /// Guest shim installed by the bootstrap.
    Builtin(String),
    /// Virtual path of a package file.
    File(String),
}

/// Loader for one invocation's package.
#[derive(Clone)]
pub struct ModuleLoader {
    vfs: VirtualFs,
    cache: ScriptCache,
    function_id: String,
    package_digest: String,
}

impl ModuleLoader {
    pub fn new(
        vfs: VirtualFs,
        cache: ScriptCache,
        function_id: impl Into<String>,
        package_digest: impl Into<String>,
    ) -> Self {
        Self {
            vfs,
            cache,
            function_id: function_id.into(),
            package_digest: package_digest.into(),
        }
    }

    /// Resolve a specifier against the requiring module's directory.
    pub fn resolve(&self, from_dir: &str, specifier: &str) -> FuncliteResult<ResolvedModule> {
        if specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')
        {
            return self.resolve_file(from_dir, specifier);
        }

        let bare = specifier.strip_prefix("node:").unwrap_or(specifier);
        if BUILTIN_MODULES.contains(&bare) {
            return Ok(ResolvedModule::Builtin(bare.to_string()));
        }
        Err(FuncliteError::ModuleDenied(format!(
            "module is not available in this environment: {}",
            specifier
        )))
    }

    fn resolve_file(&self, from_dir: &str, specifier: &str) -> FuncliteResult<ResolvedModule> {
        let base = if specifier.starts_with('/') {
            specifier.to_string()
        } else {
            format!("{}/{}", from_dir, specifier)
        };
        let exact = normalize_guest_path(&base);

        // Exact path, then `.js`, then `/index.js`.
        for candidate in [
            exact.clone(),
            format!("{}.js", exact),
            format!("{}/index.js", exact),
        ] {
            // Confinement first: an escaping candidate is an error, not a miss.
            self.vfs.resolve(&candidate)?;
            if self.vfs.is_file(&candidate) {
                return Ok(ResolvedModule::File(candidate));
            }
        }
        Err(FuncliteError::NotFound(format!(
            "cannot resolve module: {}",
            specifier
        )))
    }

    /// Produce the compiled factory for a resolved file, via the cache.
    ///
    /// The returned value is the factory function
    /// `(module, exports, require, __filename, __dirname) => …`, replayed
    /// into the caller's context.
    pub fn factory<'js>(&self, ctx: &Ctx<'js>, virtual_path: &str) -> FuncliteResult<Value<'js>> {
        let key = ScriptKey::new(&self.function_id, &self.package_digest, virtual_path);
        let bytecode = match self.cache.get(&key) {
            Some(hit) => hit,
            None => {
                let compiled = self.compile(ctx, virtual_path)?;
                self.cache.insert(key, Arc::clone(&compiled));
                compiled
            }
        };
        bytecode::evaluate(ctx, &bytecode)
    }

    fn compile(&self, ctx: &Ctx<'_>, virtual_path: &str) -> FuncliteResult<Arc<[u8]>> {
        let source = self.vfs.read_file_string(virtual_path, "utf8")?;
        let wrapped = wrap_commonjs(&source);
        let bytes = bytecode::compile(ctx, &wrapped, virtual_path)?;
        Ok(Arc::from(bytes))
    }
}

/// Node-style module wrapper. The trailing newline protects a final line
/// comment in the source from eating the closing brace.
fn wrap_commonjs(source: &str) -> String {
    format!(
        "(function (module, exports, require, __filename, __dirname) {{ {}\n }})",
        source
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use funclite_shared::ErrorKind;
    use tempfile::TempDir;

    fn loader() -> (TempDir, ModuleLoader) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.js"), b"module.exports = 1;").unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/helper.js"), b"module.exports = 2;").unwrap();
        std::fs::create_dir(dir.path().join("pkg")).unwrap();
        std::fs::write(dir.path().join("pkg/index.js"), b"module.exports = 3;").unwrap();
        let vfs = VirtualFs::new(dir.path()).unwrap();
        let loader = ModuleLoader::new(vfs, ScriptCache::new(16, true), "fn-1", "sha256:x");
        (dir, loader)
    }

    #[test]
    fn relative_specifiers_try_exact_then_js_then_index() {
        let (_dir, loader) = loader();
        assert_eq!(
            loader.resolve("/app", "./index.js").unwrap(),
            ResolvedModule::File("/app/index.js".into())
        );
        assert_eq!(
            loader.resolve("/app", "./lib/helper").unwrap(),
            ResolvedModule::File("/app/lib/helper.js".into())
        );
        assert_eq!(
            loader.resolve("/app", "./pkg").unwrap(),
            ResolvedModule::File("/app/pkg/index.js".into())
        );
        assert_eq!(
            loader.resolve("/app/lib", "../index").unwrap(),
            ResolvedModule::File("/app/index.js".into())
        );
    }

    #[test]
    fn builtins_and_node_aliases_resolve() {
        let (_dir, loader) = loader();
        assert_eq!(
            loader.resolve("/app", "crypto").unwrap(),
            ResolvedModule::Builtin("crypto".into())
        );
        assert_eq!(
            loader.resolve("/app", "node:path").unwrap(),
            ResolvedModule::Builtin("path".into())
        );
    }

    #[test]
    fn unknown_bare_specifier_is_denied() {
        let (_dir, loader) = loader();
        let err = loader.resolve("/app", "express").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModuleDenied);
        // node: prefix does not widen the set
        let err = loader.resolve("/app", "node:http").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModuleDenied);
    }

    #[test]
    fn escaping_specifier_is_permission_denied() {
        let (_dir, loader) = loader();
        let err = loader.resolve("/app", "../../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn missing_module_is_not_found() {
        let (_dir, loader) = loader();
        let err = loader.resolve("/app", "./nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn wrapper_guards_trailing_line_comment() {
        let wrapped = wrap_commonjs("module.exports = 1; // end");
        assert!(wrapped.ends_with("\n })"));
    }
}
