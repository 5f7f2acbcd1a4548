#![warn(missing_docs)]
//! Courier scripting is the sandboxed script-execution runtime of the Courier
//! API client. It runs user-authored pre-request and after-response scripts in
//! an isolated engine on a dedicated thread, streams storage mutations back to
//! the host eagerly, and reconciles script results into the request model.

pub mod cache;
pub mod config;
pub mod models;
pub mod reconcile;
pub mod runtime;
