//! Pre-compiled bootstrap script.
//!
//! The embedded `bootstrap.js` installs the guest-side standard-library
//! shims over the flattened bridge references. It is compiled to bytecode
//! once per process and replayed into every fresh guest context.

use std::sync::{Arc, OnceLock};

use funclite_shared::{FuncliteError, FuncliteResult};
use rquickjs::{Context, Ctx, Runtime};

use super::bytecode;

const BOOTSTRAP_SOURCE: &str = include_str!("js/bootstrap.js");
const BOOTSTRAP_NAME: &str = "funclite:bootstrap";

/// Shared compiled bootstrap, one per process.
pub struct BootstrapScript {
    bytecode: Arc<[u8]>,
}

impl BootstrapScript {
    /// Get the process-wide instance, compiling it on first use.
    pub fn shared() -> FuncliteResult<Arc<Self>> {
        static CACHE: OnceLock<Arc<BootstrapScript>> = OnceLock::new();
        if let Some(script) = CACHE.get() {
            return Ok(Arc::clone(script));
        }
        // A lost race compiles twice; the cache keeps one.
        let compiled = Arc::new(Self::compile()?);
        Ok(Arc::clone(CACHE.get_or_init(|| compiled)))
    }

    fn compile() -> FuncliteResult<Self> {
        // Compile-only needs a context, not a guest; a scratch runtime is
        // dropped as soon as the bytecode exists.
        let runtime = Runtime::new()
            .map_err(|e| FuncliteError::Internal(format!("bootstrap compile runtime: {}", e)))?;
        let context = Context::full(&runtime)
            .map_err(|e| FuncliteError::Internal(format!("bootstrap compile context: {}", e)))?;
        let bytes = context
            .with(|ctx| bytecode::compile(&ctx, BOOTSTRAP_SOURCE, BOOTSTRAP_NAME))
            .map_err(|e| FuncliteError::Internal(format!("bootstrap failed to compile: {}", e)))?;
        Ok(Self { bytecode: Arc::from(bytes) })
    }

    /// Replay the bootstrap into a fresh context.
    pub fn run(&self, ctx: &Ctx<'_>) -> FuncliteResult<()> {
        bytecode::evaluate(ctx, &self.bytecode)
            .map(|_| ())
            .map_err(|e| FuncliteError::Internal(format!("bootstrap failed to run: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_compiles_once_and_is_reused() {
        let first = BootstrapScript::shared().unwrap();
        let second = BootstrapScript::shared().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
