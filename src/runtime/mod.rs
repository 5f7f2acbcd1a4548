//! The sandboxed script-execution runtime: message protocol, engine factory,
//! compile cache, storage mirrors, HTTP bridge, execution unit and invoker.

pub mod bridge;
pub mod compiler;
pub mod conversions;
pub mod engine;
pub mod invoker;
pub mod mirror;
pub mod protocol;
pub mod unit;

pub use compiler::ScriptCompiler;
pub use invoker::ScriptInvoker;
