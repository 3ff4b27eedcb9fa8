//! Lua evaluation for REPL sessions.

pub mod host_api;
pub mod runtime;

pub use runtime::{EvalLimits, LuaEvalResult, LuaRuntime};
