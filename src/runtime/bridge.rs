//! The sandbox-exposed capability for issuing independent HTTP calls.
//!
//! Bridge calls run on the execution unit's own thread and share nothing with
//! the host's primary transport: no connection reuse, no inherited headers,
//! no retries. A transport failure surfaces as a script error carrying the
//! underlying error text verbatim; unhandled, it becomes the invocation's
//! runtime failure.

use std::sync::Arc;

use rhai::{Dynamic, Engine, EvalAltResult, Map, Position};
use thiserror::Error;

use super::conversions::{dynamic_to_json, json_to_dynamic};
use crate::config::ScriptConfig;

/// Errors that can occur while building or using the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The underlying HTTP client could not be constructed.
    #[error("Failed to build bridge HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),

    /// The method name passed by the script is not supported.
    #[error("Unsupported bridge method: {0}")]
    UnsupportedMethod(String),
}

/// Script-side HTTP client, registered on the engine as the `bridge` global.
#[derive(Clone)]
pub struct HttpBridge {
    client: Arc<reqwest::blocking::Client>,
}

impl HttpBridge {
    /// Builds a bridge with its own client, configured independently of the
    /// host transport.
    pub fn new(config: &ScriptConfig) -> Result<Self, BridgeError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(config.bridge_connect_timeout)
            .timeout(config.bridge_request_timeout)
            .build()?;
        Ok(Self { client: Arc::new(client) })
    }

    #[cfg(test)]
    fn with_timeouts(connect: std::time::Duration, total: std::time::Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect)
            .timeout(total)
            .build()
            .unwrap();
        Self { client: Arc::new(client) }
    }

    fn method_from(name: &str) -> Result<reqwest::Method, BridgeError> {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Ok(reqwest::Method::GET),
            "POST" => Ok(reqwest::Method::POST),
            "PUT" => Ok(reqwest::Method::PUT),
            "DELETE" => Ok(reqwest::Method::DELETE),
            other => Err(BridgeError::UnsupportedMethod(other.to_string())),
        }
    }

    /// Performs a blocking request and shapes the response for script use:
    /// `#{ status_code, body, headers }`.
    fn perform(
        &self,
        method: reqwest::Method,
        url: &str,
        options: &Map,
    ) -> Result<Map, Box<EvalAltResult>> {
        let mut request = self.client.request(method.clone(), url);

        if let Some(headers) = options.get("headers").and_then(|v| v.read_lock::<Map>()) {
            for (name, value) in headers.iter() {
                if let Some(serde_json::Value::String(text)) = dynamic_to_json(value) {
                    request = request.header(name.as_str(), text);
                }
            }
        }

        if let Some(body) = options.get("body") {
            match dynamic_to_json(body) {
                Some(serde_json::Value::String(text)) => request = request.body(text),
                Some(json) => request = request.json(&json),
                None => {}
            }
        }

        tracing::debug!(%method, url, "Bridge request");

        // Transport failures keep the reqwest error text verbatim so script
        // authors see the real cause (refused connection, DNS, timeout).
        let response = request.send().map_err(|e| runtime_error(e.to_string()))?;

        let status_code = response.status().as_u16() as i64;
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                headers.insert(name.as_str().into(), Dynamic::from(text.to_string()));
            }
        }
        let body = response.text().map_err(|e| runtime_error(e.to_string()))?;

        let mut shaped = Map::new();
        shaped.insert("status_code".into(), Dynamic::from(status_code));
        shaped.insert("body".into(), Dynamic::from(body.clone()));
        shaped.insert("headers".into(), Dynamic::from_map(headers));
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(json) => shaped.insert("json".into(), json_to_dynamic(&json)),
            Err(_) => shaped.insert("json".into(), Dynamic::UNIT),
        };

        tracing::debug!(%method, url, status_code, "Bridge response");
        Ok(shaped)
    }

    /// Entry point for the generic `bridge.request(method, url, options)`
    /// form.
    pub fn request(
        &mut self,
        method: &str,
        url: &str,
        options: Map,
    ) -> Result<Map, Box<EvalAltResult>> {
        let method = Self::method_from(method).map_err(|e| runtime_error(e.to_string()))?;
        self.perform(method, url, &options)
    }
}

fn runtime_error(message: String) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(Dynamic::from(message), Position::NONE))
}

/// Registers the bridge type and its request methods with the engine.
pub fn register_bridge(engine: &mut Engine) {
    engine.register_type_with_name::<HttpBridge>("HttpBridge");
    engine.register_fn("request", HttpBridge::request);
    engine.register_fn("request", |bridge: &mut HttpBridge, method: &str, url: &str| {
        bridge.request(method, url, Map::new())
    });

    for method in ["get", "post", "put", "delete"] {
        engine.register_fn(method, move |bridge: &mut HttpBridge, url: &str| {
            bridge.request(method, url, Map::new())
        });
        engine.register_fn(method, move |bridge: &mut HttpBridge, url: &str, options: Map| {
            bridge.request(method, url, options)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn test_engine_with_bridge(bridge: HttpBridge) -> (Engine, rhai::Scope<'static>) {
        let kill = Arc::new(AtomicBool::new(false));
        let mut engine = super::super::engine::create_engine(&ScriptConfig::default(), kill);
        register_bridge(&mut engine);
        let mut scope = rhai::Scope::new();
        scope.push("bridge", bridge);
        (engine, scope)
    }

    fn quick_bridge() -> HttpBridge {
        HttpBridge::with_timeouts(Duration::from_millis(2_000), Duration::from_millis(2_000))
    }

    #[test]
    fn test_get_returns_shaped_response() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/ping")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{\"pong\":true}")
            .create();

        let (engine, mut scope) = test_engine_with_bridge(quick_bridge());
        let script = format!("let res = bridge.get(\"{}/ping\"); res.status_code", server.url());
        let status: i64 = engine.eval_with_scope(&mut scope, &script).unwrap();

        mock.assert();
        assert_eq!(status, 200);
    }

    #[test]
    fn test_parsed_json_is_exposed() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/data")
            .with_status(200)
            .with_body("{\"value\":41}")
            .create();

        let (engine, mut scope) = test_engine_with_bridge(quick_bridge());
        let script =
            format!("let res = bridge.get(\"{}/data\"); res.json.value + 1", server.url());
        let value: i64 = engine.eval_with_scope(&mut scope, &script).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_post_sends_body_and_headers() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/submit")
            .match_header("x-origin", "script")
            .match_body("payload")
            .with_status(201)
            .create();

        let (engine, mut scope) = test_engine_with_bridge(quick_bridge());
        let script = format!(
            "let res = bridge.post(\"{}/submit\", #{{ headers: #{{ \"x-origin\": \"script\" }}, body: \"payload\" }}); res.status_code",
            server.url()
        );
        let status: i64 = engine.eval_with_scope(&mut scope, &script).unwrap();

        mock.assert();
        assert_eq!(status, 201);
    }

    #[test]
    fn test_transport_failure_preserves_error_text() {
        // Nothing listens on this port; the connection is refused.
        let (engine, mut scope) = test_engine_with_bridge(quick_bridge());
        let result =
            engine.eval_with_scope::<Map>(&mut scope, "bridge.get(\"http://127.0.0.1:1/nope\")");

        let error = result.unwrap_err();
        assert!(error.to_string().contains("http://127.0.0.1:1/nope"));
    }

    #[test]
    fn test_unsupported_method_is_rejected() {
        let (engine, mut scope) = test_engine_with_bridge(quick_bridge());
        let result = engine
            .eval_with_scope::<Map>(&mut scope, "bridge.request(\"PATCH\", \"http://x\", #{})");
        assert!(result.unwrap_err().to_string().contains("PATCH"));
    }
}
