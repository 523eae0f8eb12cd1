//! Guest sandbox.
//!
//! Long-lived QuickJS guests, the pre-compiled bootstrap, bytecode
//! serialization and the per-invocation execution context.

pub mod bytecode;

mod bootstrap;
mod context;
mod guest;

pub use bootstrap::BootstrapScript;
pub use context::{ExecutionContext, HandlerOutcome, InvocationSpec};
pub use guest::{Guest, GuestInterrupt};
