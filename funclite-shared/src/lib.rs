//! Funclite shared types - common code for the engine and embedders.
//!
//! This crate contains the error model, the invocation records that cross
//! the engine boundary, and the configuration constants.

pub mod constants;
pub mod errors;
pub mod invocation;

pub use errors::{ErrorKind, FuncliteError, FuncliteResult};
pub use invocation::{
    FunctionFailure, FunctionOutcome, FunctionRequest, FunctionResponse, LogEntry, LogLevel,
    ResponseData,
};
