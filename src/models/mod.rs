//! Core data model shared across the scripting runtime.

pub mod context;
pub mod patch;
pub mod result;
pub mod storage;

pub use context::{NodeKind, RequestView, ResponseView, ScriptContext, ScriptPhase};
pub use patch::RequestPatch;
pub use result::{
    FailureKind, GlobalSnapshot, ScriptFailure, ScriptResult, ScriptSuccess, UpdatedStorage,
};
pub use storage::{MutationKind, StorageMutation, StorageScope};

/// A JSON object map, the common currency for variables, headers, cookies and
/// storage snapshots crossing the host/sandbox boundary.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
