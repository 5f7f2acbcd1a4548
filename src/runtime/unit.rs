//! The sandboxed execution unit: one dedicated thread per invocation.
//!
//! The unit owns the curated global object (request/response view, variables,
//! cookies, the two storage mirrors, the bridge), compiles and runs the user
//! script, and reports terminal messages over its outbound channel. It is
//! single-use: the thread exits after one eval, and the host destroys it on
//! every exit path by dropping its inbound channel.

use std::sync::{
    atomic::AtomicBool,
    mpsc::Receiver,
    Arc,
};

use rhai::{Dynamic, Map, Position, Scope};
use tokio::sync::mpsc::UnboundedSender;

use super::{
    bridge::{register_bridge, HttpBridge},
    compiler::{CompileError, ScriptCompiler},
    conversions::{json_object_to_rhai_map, rhai_map_to_json_object},
    engine::create_engine,
    mirror::{register_mirror, StorageMirror},
    protocol::{ChannelFamily, Envelope, HostMessage, UnitMessage},
};
use crate::{
    config::ScriptConfig,
    models::{GlobalSnapshot, ScriptContext, ScriptPhase, StorageScope},
};

/// Spawns a fresh execution unit on its own OS thread.
///
/// The unit communicates exclusively through the given channel pair and shares
/// no memory with the host. Setting `kill_flag` stops the running script at
/// its next operation boundary.
pub fn spawn_unit(
    config: ScriptConfig,
    compiler: Arc<ScriptCompiler>,
    family: ChannelFamily,
    inbound: Receiver<Envelope>,
    outbound: UnboundedSender<Envelope>,
    kill_flag: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || run_unit(config, compiler, family, inbound, outbound, kill_flag))
}

fn run_unit(
    config: ScriptConfig,
    compiler: Arc<ScriptCompiler>,
    family: ChannelFamily,
    inbound: Receiver<Envelope>,
    outbound: UnboundedSender<Envelope>,
    kill_flag: Arc<AtomicBool>,
) {
    let send = |message: UnitMessage| match message.to_envelope(family) {
        Ok(envelope) => {
            let _ = outbound.send(envelope);
        }
        Err(error) => {
            tracing::error!(%error, "Failed to encode unit message");
        }
    };

    let context = match recv_host_message(family, &inbound) {
        Some(HostMessage::InitData(context)) => *context,
        Some(other) => {
            tracing::error!(?other, "Execution unit expected init data");
            return;
        }
        None => return,
    };

    let mut engine = create_engine(&config, kill_flag);
    register_mirror(&mut engine);
    register_bridge(&mut engine);

    let bridge = match HttpBridge::new(&config) {
        Ok(bridge) => bridge,
        Err(error) => {
            // No terminal message: the host observes the closed channel and
            // classifies the invocation as an infrastructure failure.
            tracing::error!(%error, "Failed to construct HTTP bridge");
            return;
        }
    };

    let session = StorageMirror::new(
        StorageScope::Session,
        context.session_storage.clone(),
        config.storage_value_ceiling,
        family,
        outbound.clone(),
    );
    let local = StorageMirror::new(
        StorageScope::Local,
        context.local_storage.clone(),
        config.storage_value_ceiling,
        family,
        outbound.clone(),
    );

    let mut scope = Scope::new();
    scope.push("request", json_object_to_rhai_map(&request_map(&context)));
    if let Some(response) = &context.response {
        let mut map = Map::new();
        map.insert("status".into(), Dynamic::from(response.status as i64));
        map.insert("headers".into(), json_object_to_rhai_map(&response.headers).into());
        map.insert("body".into(), Dynamic::from(response.body.clone()));
        // Constants cannot be rebound; the delivered response is never read
        // back out of the sandbox either way.
        scope.push_constant("response", map);
    }
    scope.push("vars", json_object_to_rhai_map(&context.variables));
    scope.push("cookies", json_object_to_rhai_map(&context.cookies));
    scope.push("session", session.clone());
    scope.push("local", local.clone());
    scope.push("bridge", bridge);

    send(UnitMessage::InitAck);

    let source = match recv_host_message(family, &inbound) {
        Some(HostMessage::Eval(source)) => source,
        Some(other) => {
            tracing::error!(?other, "Execution unit expected eval");
            return;
        }
        None => return,
    };

    let ast = match compiler.compile(&engine, &source) {
        Ok(ast) => ast,
        Err(CompileError::Parse(error)) => {
            send(UnitMessage::EvalError {
                syntax: true,
                message: error.to_string(),
                stack: position_stack(error.1),
            });
            return;
        }
    };

    match engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast) {
        Ok(_) => {
            let snapshot = build_snapshot(&context, &scope, &session, &local);
            send(UnitMessage::EvalSuccess(Box::new(snapshot)));
        }
        Err(error) => {
            send(UnitMessage::EvalError {
                syntax: false,
                message: error.to_string(),
                stack: position_stack(error.position()),
            });
        }
    }
}

fn recv_host_message(family: ChannelFamily, inbound: &Receiver<Envelope>) -> Option<HostMessage> {
    let envelope = inbound.recv().ok()?;
    match HostMessage::from_envelope(family, envelope) {
        Ok(message) => Some(message),
        Err(error) => {
            tracing::error!(%error, "Execution unit received an undecodable envelope");
            None
        }
    }
}

/// The request view as exposed to scripts, as a JSON object.
fn request_map(context: &ScriptContext) -> crate::models::JsonMap {
    match serde_json::to_value(&context.request) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => crate::models::JsonMap::new(),
    }
}

/// Serializes the final state of the curated global object. Values the script
/// replaced with something non-map-shaped fall back to the initial context so
/// the reconciler sees "unchanged" rather than garbage.
fn build_snapshot(
    context: &ScriptContext,
    scope: &Scope<'_>,
    session: &StorageMirror,
    local: &StorageMirror,
) -> GlobalSnapshot {
    let read_map = |name: &str, fallback: &crate::models::JsonMap| {
        scope
            .get_value::<Map>(name)
            .map(|map| rhai_map_to_json_object(&map))
            .unwrap_or_else(|| fallback.clone())
    };

    let request = match context.phase {
        ScriptPhase::Pre => Some(read_map("request", &request_map(context))),
        ScriptPhase::After => None,
    };

    GlobalSnapshot {
        request,
        variables: read_map("vars", &context.variables),
        cookies: read_map("cookies", &context.cookies),
        session_storage: session.cache_view(),
        local_storage: local.cache_view(),
    }
}

fn position_stack(position: Position) -> Option<String> {
    if position.is_none() {
        None
    } else {
        Some(format!("at {position}"))
    }
}
