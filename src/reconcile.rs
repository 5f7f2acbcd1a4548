//! Merges a script's terminal result back into the live node model.
//!
//! Reconciliation is a merge, not a replace: only the sub-trees a pre script
//! may influence are read from the final global snapshot, fields the script
//! never touched stay untouched on the live model, and map-valued fields are
//! merged entry-by-entry, so the mechanism cannot express deletion by
//! omission. After scripts never alter the already-delivered response;
//! script failure is additive information only.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{
    FailureKind, JsonMap, RequestPatch, RequestView, ResponseView, ScriptResult, UpdatedStorage,
};

/// A failure annotation shown alongside the node's response panel. Never a
/// reason to discard or retry the primary request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptAnnotation {
    /// What class of failure occurred.
    pub kind: FailureKind,

    /// Human-readable failure message.
    pub message: String,
}

/// The live model of a saved request node, as far as reconciliation is
/// concerned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeModel {
    /// The authoritative request definition.
    pub request: RequestView,

    /// The most recently delivered response, if any. Reconciliation never
    /// writes to this field.
    pub last_response: Option<ResponseView>,

    /// Failure annotation from the most recent script run, if it failed.
    pub script_annotation: Option<ScriptAnnotation>,
}

/// Final variables and storage maps a successful script produced, for the
/// variable/cache collaborator to persist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptUpdates {
    /// Final variables map, if changed.
    pub variables: Option<JsonMap>,

    /// Final storage maps, if changed.
    pub storage: Option<UpdatedStorage>,
}

/// Builds a sparse patch from the fields whose final value differs from the
/// original request. Returns `None` when the script changed nothing.
pub fn build_request_patch(original: &RequestView, final_request: &JsonMap) -> Option<RequestPatch> {
    let final_str = |field: &str| final_request.get(field).and_then(Value::as_str);
    let changed_string = |field: &str, current: &str| {
        final_str(field).filter(|value| *value != current).map(str::to_string)
    };

    let port = final_request
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| Some(*p) != original.port);

    let changed_map = |field: &str, current: &JsonMap| {
        final_request
            .get(field)
            .and_then(Value::as_object)
            .filter(|map| *map != current)
            .cloned()
    };

    let patch = RequestPatch {
        protocol: changed_string("protocol", &original.protocol),
        method: changed_string("method", &original.method),
        host: changed_string("host", &original.host),
        path: changed_string("path", &original.path),
        port,
        headers: changed_map("headers", &original.headers),
        query: changed_map("query", &original.query),
    };

    (!patch.is_empty()).then_some(patch)
}

/// Applies a patch to the live request. Scalar fields are overwritten;
/// headers and query parameters are merged key-by-key, preserving keys the
/// patch does not mention.
pub fn apply_patch(request: &mut RequestView, patch: &RequestPatch) {
    if let Some(protocol) = &patch.protocol {
        request.protocol = protocol.clone();
    }
    if let Some(method) = &patch.method {
        request.method = method.clone();
    }
    if let Some(host) = &patch.host {
        request.host = host.clone();
    }
    if let Some(path) = &patch.path {
        request.path = path.clone();
    }
    if let Some(port) = patch.port {
        request.port = Some(port);
    }
    if let Some(headers) = &patch.headers {
        for (name, value) in headers {
            request.headers.insert(name.clone(), value.clone());
        }
    }
    if let Some(query) = &patch.query {
        for (name, value) in query {
            request.query.insert(name.clone(), value.clone());
        }
    }
}

/// Consumes the invoker's terminal result for a node.
///
/// On success the request patch (pre scripts only) is merged into the live
/// request and the final variables/storage maps are handed back for the
/// variable/cache collaborator. On failure the node gets an annotation; the
/// delivered response is never altered or hidden in either case.
pub fn reconcile(node: &mut NodeModel, result: &ScriptResult) -> Option<ScriptUpdates> {
    match result {
        ScriptResult::Success(success) => {
            node.script_annotation = None;
            if let Some(patch) = &success.request_patch {
                apply_patch(&mut node.request, patch);
            }
            Some(ScriptUpdates {
                variables: success.updated_variables.clone(),
                storage: success.updated_storage.clone(),
            })
        }
        ScriptResult::Failure(failure) => {
            tracing::debug!(kind = ?failure.kind, "Annotating node with script failure");
            node.script_annotation = Some(ScriptAnnotation {
                kind: failure.kind,
                message: failure.message.clone(),
            });
            None
        }
    }
}
