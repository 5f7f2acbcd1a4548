//! Sparse request patch covering only the fields a pre script may influence.

use serde::{Deserialize, Serialize};

use super::JsonMap;

/// A sparse patch over the live request model. Absent fields mean
/// "unchanged"; map-valued fields are merged key-by-key when applied, never
/// replaced wholesale, so keys the script did not touch survive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPatch {
    /// New protocol scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// New HTTP method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// New host name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// New request path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// New port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Final header map from the script; merged entry-by-entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<JsonMap>,

    /// Final query-parameter map from the script; merged entry-by-entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<JsonMap>,
}

impl RequestPatch {
    /// Returns true when the patch carries no changes at all.
    pub fn is_empty(&self) -> bool {
        self.protocol.is_none()
            && self.method.is_none()
            && self.host.is_none()
            && self.path.is_none()
            && self.port.is_none()
            && self.headers.is_none()
            && self.query.is_none()
    }
}
