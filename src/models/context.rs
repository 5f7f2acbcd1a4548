//! The immutable per-invocation snapshot handed to the execution unit.

use serde::{Deserialize, Serialize};

use super::JsonMap;

/// The phase a script runs in relative to the main request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptPhase {
    /// Runs before the request is dispatched; may mutate request fields.
    Pre,
    /// Runs after a response or message was received; read-only response view.
    After,
}

/// The kind of saved node the script belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// A saved HTTP request definition.
    Http,
    /// A saved WebSocket connection definition.
    WebSocket,
}

/// The request fields a script can observe, and (in the pre phase) influence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestView {
    /// Protocol scheme, e.g. `http`, `https`, `ws`, `wss`.
    pub protocol: String,

    /// HTTP method. Empty for WebSocket nodes.
    #[serde(default)]
    pub method: String,

    /// Target host name.
    pub host: String,

    /// Request path.
    pub path: String,

    /// Target port, when explicitly set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Query parameters, keyed by name.
    #[serde(default)]
    pub query: JsonMap,

    /// Request headers, keyed by name.
    #[serde(default)]
    pub headers: JsonMap,
}

/// The already-delivered response, exposed read-only to after scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseView {
    /// Response status code, or the close code for WebSocket nodes.
    pub status: u16,

    /// Response headers.
    #[serde(default)]
    pub headers: JsonMap,

    /// Response body or received message, as text.
    pub body: String,
}

/// Immutable snapshot passed at invocation. Built by value from the live
/// model, consumed once by the execution unit, and discarded afterwards; the
/// host's live model is never shared by reference with the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptContext {
    /// Which phase this invocation runs in.
    pub phase: ScriptPhase,

    /// The kind of node the script belongs to.
    pub node_kind: NodeKind,

    /// The request view. Mutable-intent for pre scripts, informational for
    /// after scripts.
    pub request: RequestView,

    /// The delivered response. Present for after scripts only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseView>,

    /// Environment variables visible to the script.
    #[serde(default)]
    pub variables: JsonMap,

    /// Cookies visible to the script.
    #[serde(default)]
    pub cookies: JsonMap,

    /// Session-scoped storage contents at invocation time.
    #[serde(default)]
    pub session_storage: JsonMap,

    /// Durable (local) storage contents at invocation time.
    #[serde(default)]
    pub local_storage: JsonMap,

    /// Identifier of the project the node belongs to.
    pub project_id: String,

    /// Identifier of the node the script is attached to.
    pub node_id: String,
}

impl ScriptContext {
    /// Creates a pre-request context for the given node.
    pub fn pre(
        node_kind: NodeKind,
        request: RequestView,
        project_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            phase: ScriptPhase::Pre,
            node_kind,
            request,
            response: None,
            variables: JsonMap::new(),
            cookies: JsonMap::new(),
            session_storage: JsonMap::new(),
            local_storage: JsonMap::new(),
            project_id: project_id.into(),
            node_id: node_id.into(),
        }
    }

    /// Creates an after-script context for the given node and delivered
    /// response.
    pub fn after(
        node_kind: NodeKind,
        request: RequestView,
        response: ResponseView,
        project_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            phase: ScriptPhase::After,
            node_kind,
            request,
            response: Some(response),
            variables: JsonMap::new(),
            cookies: JsonMap::new(),
            session_storage: JsonMap::new(),
            local_storage: JsonMap::new(),
            project_id: project_id.into(),
            node_id: node_id.into(),
        }
    }
}
