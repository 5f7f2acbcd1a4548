//! The invoker's single terminal output per invocation.

use serde::{Deserialize, Serialize};

use super::{JsonMap, RequestPatch};

/// Classification of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The script source failed to compile; detected before any execution.
    Syntax,
    /// The script threw during execution, including unhandled bridge failures.
    Runtime,
    /// The execution unit itself failed outside the normal message protocol.
    Infrastructure,
    /// No terminal message arrived within the execution timeout. The only
    /// kind the invoker manufactures itself rather than relays from the unit.
    Timeout,
}

/// Details of a failed invocation. Side effects already streamed before the
/// failure are never rolled back, regardless of kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptFailure {
    /// What class of failure occurred.
    pub kind: FailureKind,

    /// Human-readable failure message.
    pub message: String,

    /// Script position information, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Storage contents after a successful invocation, per scope. Only scopes the
/// script actually changed are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatedStorage {
    /// Final session-scoped map, if the script changed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<JsonMap>,

    /// Final durable map, if the script changed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<JsonMap>,
}

impl UpdatedStorage {
    /// Returns true when neither scope changed.
    pub fn is_empty(&self) -> bool {
        self.session.is_none() && self.local.is_none()
    }
}

/// Outcome of a successful invocation. Absent fields mean "unchanged".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptSuccess {
    /// Final variables map, if the script changed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_variables: Option<JsonMap>,

    /// Final storage maps, if the script changed them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_storage: Option<UpdatedStorage>,

    /// Sparse request patch built from the fields a pre script touched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_patch: Option<RequestPatch>,
}

/// The invoker's terminal result. Produced exactly once per invocation and
/// consumed once by the reconciler; callers branch on the variant rather than
/// handling exceptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ScriptResult {
    /// The script ran to completion.
    Success(ScriptSuccess),
    /// The script failed; see [`FailureKind`] for the taxonomy.
    Failure(ScriptFailure),
}

impl ScriptResult {
    /// A success carrying no updates, e.g. for an empty script source.
    pub fn success_empty() -> Self {
        Self::Success(ScriptSuccess::default())
    }

    /// Builds a failure result.
    pub fn failure(kind: FailureKind, message: impl Into<String>, stack: Option<String>) -> Self {
        Self::Failure(ScriptFailure { kind, message: message.into(), stack })
    }

    /// Returns true for the success variant.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// JSON-safe deep copy of the curated global object after a successful eval,
/// serialized by the execution unit before it reports `EvalSuccess`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSnapshot {
    /// Final request map, present for pre scripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<JsonMap>,

    /// Final variables map.
    #[serde(default)]
    pub variables: JsonMap,

    /// Final cookies map.
    #[serde(default)]
    pub cookies: JsonMap,

    /// Final session-scoped storage, as last mirrored to the host cache;
    /// size-suppressed writes keep the key's previous value.
    #[serde(default)]
    pub session_storage: JsonMap,

    /// Final durable storage, as last mirrored to the host cache;
    /// size-suppressed writes keep the key's previous value.
    #[serde(default)]
    pub local_storage: JsonMap,
}
