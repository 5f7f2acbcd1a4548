//! The script invoker: owns one execution unit's lifetime per invocation,
//! the timeout timer, and the single-resolution guard.
//!
//! `invoke` always resolves with a [`ScriptResult`]; nothing is ever raised
//! to the calling request pipeline. The first of {terminal unit message,
//! infrastructure error, timer} wins the resolution race; later arrivals are
//! no-ops. Storage mutations bypass the resolution guard entirely: they are
//! already-committed side effects and are forwarded to the cache collaborator
//! the moment they arrive, even while resolution is pending or after it
//! fired.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::Sender,
    Arc,
};

use thiserror::Error;

use super::{
    compiler::ScriptCompiler,
    protocol::{ChannelFamily, Envelope, HostMessage, ProtocolError, UnitMessage},
    unit::spawn_unit,
};
use crate::{
    cache::StorageCacheSink,
    config::ScriptConfig,
    models::{
        FailureKind, GlobalSnapshot, ScriptContext, ScriptPhase, ScriptResult, ScriptSuccess,
        StorageMutation, UpdatedStorage,
    },
    reconcile,
};

/// Internal failures on the host side of the invocation protocol. Never
/// surfaced to callers directly; they become `Infrastructure` failures.
#[derive(Debug, Error)]
enum InvokeError {
    #[error("Execution unit channel closed before a terminal message")]
    ChannelClosed,

    #[error("Failed to deliver message to execution unit")]
    SendFailed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Per-invocation lifecycle, for diagnostics. `Resolved` and `Terminated`
/// are absorbing: any message arriving afterward is discarded, except
/// storage mutations which are processed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvocationState {
    Initializing,
    AwaitingEval,
    Resolved,
    Terminated,
}

/// Race-safe single-resolution guard. The first `try_resolve` wins; all
/// later attempts are no-ops.
struct ResolveGuard(AtomicBool);

impl ResolveGuard {
    fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    fn try_resolve(&self) -> bool {
        self.0.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
}

enum Resolution {
    Success(Box<GlobalSnapshot>),
    Failure(FailureKind, String, Option<String>),
}

impl Resolution {
    fn infrastructure(error: InvokeError) -> Self {
        Self::Failure(FailureKind::Infrastructure, error.to_string(), None)
    }
}

/// Invokes pre/after scripts against fresh execution units.
pub struct ScriptInvoker {
    config: ScriptConfig,
    compiler: Arc<ScriptCompiler>,
    cache: Arc<dyn StorageCacheSink>,
}

impl ScriptInvoker {
    /// Creates an invoker forwarding storage mutations to `cache`.
    pub fn new(config: ScriptConfig, cache: Arc<dyn StorageCacheSink>) -> Self {
        Self { config, compiler: Arc::new(ScriptCompiler::new()), cache }
    }

    /// Runs `source` against a fresh execution unit and resolves exactly
    /// once. Empty or whitespace-only sources resolve immediately without
    /// spawning a unit and without any mutation events.
    #[tracing::instrument(
        skip(self, source, context),
        fields(node_id = %context.node_id, phase = ?context.phase)
    )]
    pub async fn invoke(&self, source: &str, context: ScriptContext) -> ScriptResult {
        if source.trim().is_empty() {
            tracing::debug!("Empty script source; resolving without execution");
            return ScriptResult::success_empty();
        }

        let family = ChannelFamily::for_context(&context);
        let original = context.clone();

        let (to_unit, unit_inbound) = std::sync::mpsc::channel();
        let (unit_outbound, mut from_unit) = tokio::sync::mpsc::unbounded_channel();
        let kill_flag = Arc::new(AtomicBool::new(false));

        let _unit = spawn_unit(
            self.config.clone(),
            self.compiler.clone(),
            family,
            unit_inbound,
            unit_outbound,
            kill_flag.clone(),
        );

        // The timer starts at spawn time and covers init as well as eval.
        let deadline = tokio::time::sleep(self.config.execution_timeout);
        tokio::pin!(deadline);

        let mut state = InvocationState::Initializing;
        tracing::debug!(?state, "Execution unit spawned");

        let guard = ResolveGuard::new();
        let mut resolution =
            match send_to_unit(&to_unit, family, HostMessage::InitData(Box::new(context))) {
                Ok(()) => None,
                Err(error) => guard.try_resolve().then(|| Resolution::infrastructure(error)),
            };

        while resolution.is_none() {
            tokio::select! {
                () = &mut deadline => {
                    if guard.try_resolve() {
                        resolution = Some(Resolution::Failure(
                            FailureKind::Timeout,
                            format!(
                                "Script execution timed out after {:?}",
                                self.config.execution_timeout
                            ),
                            None,
                        ));
                    }
                }
                envelope = from_unit.recv() => {
                    let Some(envelope) = envelope else {
                        resolution = guard
                            .try_resolve()
                            .then(|| Resolution::infrastructure(InvokeError::ChannelClosed));
                        continue;
                    };

                    let message = match UnitMessage::from_envelope(family, envelope) {
                        Ok(message) => message,
                        Err(error) => {
                            resolution = guard
                                .try_resolve()
                                .then(|| Resolution::infrastructure(error.into()));
                            continue;
                        }
                    };

                    match message {
                        UnitMessage::InitAck => {
                            state = InvocationState::AwaitingEval;
                            tracing::debug!(?state, "Execution unit initialized");
                            let eval = HostMessage::Eval(source.to_string());
                            if let Err(error) = send_to_unit(&to_unit, family, eval) {
                                resolution = guard
                                    .try_resolve()
                                    .then(|| Resolution::infrastructure(error));
                            }
                        }
                        UnitMessage::StorageMutation(mutation) => {
                            self.forward_mutation(&original, mutation).await;
                        }
                        UnitMessage::EvalSuccess(snapshot) => {
                            resolution =
                                guard.try_resolve().then(|| Resolution::Success(snapshot));
                        }
                        UnitMessage::EvalError { syntax, message, stack } => {
                            resolution = guard.try_resolve().then(|| {
                                let kind = if syntax {
                                    FailureKind::Syntax
                                } else {
                                    FailureKind::Runtime
                                };
                                Resolution::Failure(kind, message, stack)
                            });
                        }
                    }
                }
            }
        }

        // Resolution is final: stop the script at its next operation and
        // tear the unit down. The unit must not outlive the invocation under
        // any exit path.
        kill_flag.store(true, Ordering::Relaxed);
        state = InvocationState::Resolved;
        tracing::debug!(?state, "Invocation resolved");

        // Mutations already sent before this instant are committed side
        // effects; forward them. Every other late message is discarded.
        while let Ok(envelope) = from_unit.try_recv() {
            if let Ok(UnitMessage::StorageMutation(mutation)) =
                UnitMessage::from_envelope(family, envelope)
            {
                self.forward_mutation(&original, mutation).await;
            }
        }

        drop(to_unit);
        state = InvocationState::Terminated;
        tracing::debug!(?state, "Execution unit destroyed");

        match resolution {
            Some(Resolution::Success(snapshot)) => self.finalize_success(&original, *snapshot),
            Some(Resolution::Failure(kind, message, stack)) => {
                tracing::debug!(?kind, %message, "Script failed");
                ScriptResult::failure(kind, message, stack)
            }
            // Unreachable: the loop only exits with a resolution.
            None => ScriptResult::failure(
                FailureKind::Infrastructure,
                "Invocation ended without a resolution",
                None,
            ),
        }
    }

    /// Forwards one already-committed mutation to the cache collaborator.
    /// Cache failures are logged, never propagated into the invocation.
    async fn forward_mutation(&self, context: &ScriptContext, mutation: StorageMutation) {
        if let Err(error) = self.cache.apply(&context.project_id, &context.node_id, mutation).await
        {
            tracing::error!(%error, node_id = %context.node_id, "Storage cache rejected mutation");
        }
    }

    /// Turns the unit's final snapshot into the terminal success result,
    /// omitting everything the script left unchanged.
    fn finalize_success(&self, original: &ScriptContext, snapshot: GlobalSnapshot) -> ScriptResult {
        let updated_variables =
            (snapshot.variables != original.variables).then_some(snapshot.variables);

        let storage = UpdatedStorage {
            session: (snapshot.session_storage != original.session_storage)
                .then_some(snapshot.session_storage),
            local: (snapshot.local_storage != original.local_storage)
                .then_some(snapshot.local_storage),
        };
        let updated_storage = (!storage.is_empty()).then_some(storage);

        let request_patch = match (original.phase, &snapshot.request) {
            (ScriptPhase::Pre, Some(final_request)) => {
                reconcile::build_request_patch(&original.request, final_request)
            }
            _ => None,
        };

        ScriptResult::Success(ScriptSuccess { updated_variables, updated_storage, request_patch })
    }
}

fn send_to_unit(
    to_unit: &Sender<Envelope>,
    family: ChannelFamily,
    message: HostMessage,
) -> Result<(), InvokeError> {
    let envelope = message.to_envelope(family)?;
    to_unit.send(envelope).map_err(|_| InvokeError::SendFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{MemoryStorageCache, MockStorageCacheSink},
        models::{NodeKind, RequestView, ResponseView, StorageScope},
    };
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn invoker_with_cache(config: ScriptConfig) -> (ScriptInvoker, Arc<MemoryStorageCache>) {
        let cache = Arc::new(MemoryStorageCache::new());
        (ScriptInvoker::new(config, cache.clone()), cache)
    }

    fn short_timeout_config(millis: u64) -> ScriptConfig {
        ScriptConfig {
            execution_timeout: Duration::from_millis(millis),
            ..ScriptConfig::default()
        }
    }

    fn pre_context() -> ScriptContext {
        let request = RequestView {
            protocol: "https".into(),
            method: "GET".into(),
            host: "api.example.com".into(),
            path: "/v1/items".into(),
            ..Default::default()
        };
        ScriptContext::pre(NodeKind::Http, request, "proj", "node")
    }

    #[tokio::test]
    async fn test_empty_source_fast_path() {
        let (invoker, cache) = invoker_with_cache(ScriptConfig::default());

        for source in ["", "   ", "\n\t  \n"] {
            let result = invoker.invoke(source, pre_context()).await;
            assert_eq!(result, ScriptResult::success_empty());
        }

        assert!(cache.scope_contents("proj", "node", StorageScope::Session).await.is_none());
        assert!(cache.scope_contents("proj", "node", StorageScope::Local).await.is_none());
    }

    #[tokio::test]
    async fn test_success_builds_request_patch() {
        let (invoker, _cache) = invoker_with_cache(ScriptConfig::default());

        let result = invoker
            .invoke("request.headers[\"X-Trace\"] = \"1\";", pre_context())
            .await;

        match result {
            ScriptResult::Success(success) => {
                let patch = success.request_patch.expect("expected a patch");
                let headers = patch.headers.expect("expected headers in patch");
                assert_eq!(headers["X-Trace"], json!("1"));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_untouched_fields_omitted_from_success() {
        let (invoker, _cache) = invoker_with_cache(ScriptConfig::default());

        let result = invoker.invoke("let unused = 1;", pre_context()).await;

        match result {
            ScriptResult::Success(success) => {
                assert!(success.updated_variables.is_none());
                assert!(success.updated_storage.is_none());
                assert!(success.request_patch.is_none());
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_variable_updates_are_reported() {
        let (invoker, _cache) = invoker_with_cache(ScriptConfig::default());
        let mut context = pre_context();
        context.variables.insert("count".into(), json!(1));

        let result = invoker.invoke("vars.count = vars.count + 1;", context).await;

        match result {
            ScriptResult::Success(success) => {
                let variables = success.updated_variables.expect("expected variables");
                assert_eq!(variables["count"], json!(2));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_syntax_failure_classification() {
        let (invoker, _cache) = invoker_with_cache(ScriptConfig::default());

        let result = invoker.invoke("let x = \"unterminated", pre_context()).await;

        match result {
            ScriptResult::Failure(failure) => assert_eq!(failure.kind, FailureKind::Syntax),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runtime_failure_carries_stack() {
        let (invoker, _cache) = invoker_with_cache(ScriptConfig::default());

        let result = invoker.invoke("let x = ();\nx.missing", pre_context()).await;

        match result {
            ScriptResult::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::Runtime);
                assert!(!failure.message.is_empty());
                assert!(failure.stack.is_some());
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stalled_script_times_out() {
        let (invoker, _cache) = invoker_with_cache(short_timeout_config(300));

        let started = Instant::now();
        let result = invoker.invoke("while true {}", pre_context()).await;
        let elapsed = started.elapsed();

        match result {
            ScriptResult::Failure(failure) => assert_eq!(failure.kind, FailureKind::Timeout),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(elapsed >= Duration::from_millis(250), "resolved too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2_000), "resolved too late: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_fast_failure_beats_short_timer() {
        // The race can be won by the unit as well: an immediate throw must
        // resolve as Runtime even with the timer armed.
        let (invoker, _cache) = invoker_with_cache(short_timeout_config(5_000));

        let result = invoker.invoke("throw \"early\";", pre_context()).await;

        match result {
            ScriptResult::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::Runtime);
                assert!(failure.message.contains("early"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mutations_reach_cache_before_timeout() {
        let (invoker, cache) = invoker_with_cache(short_timeout_config(400));

        let result = invoker
            .invoke("session[\"progress\"] = \"half\"; while true {}", pre_context())
            .await;

        match result {
            ScriptResult::Failure(failure) => assert_eq!(failure.kind, FailureKind::Timeout),
            other => panic!("expected timeout, got {other:?}"),
        }

        // The write was forwarded eagerly, before the terminal result, and
        // survives the timeout with no rollback.
        let contents = cache
            .scope_contents("proj", "node", StorageScope::Session)
            .await
            .expect("mutation should have reached the cache");
        assert_eq!(contents["progress"], json!("half"));
    }

    #[tokio::test]
    async fn test_mutations_carry_node_identity() {
        let mut mock = MockStorageCacheSink::new();
        mock.expect_apply()
            .withf(|project, node, mutation| {
                project == "proj" && node == "node" && mutation.scope == StorageScope::Session
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let invoker = ScriptInvoker::new(ScriptConfig::default(), Arc::new(mock));

        let result = invoker.invoke("session[\"k\"] = \"v\";", pre_context()).await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_oversized_value_never_reaches_cache() {
        let (invoker, cache) = invoker_with_cache(ScriptConfig::default());

        // 150k characters serializes well past the 100 KB ceiling.
        let script = "
            let big = \"x\";
            let chunk = \"xxxxxxxxxx\";
            while big.len < 150_000 { big += chunk; }
            session[\"big\"] = big;
            vars.big_len = big.len;
        ";
        let result = invoker.invoke(script, pre_context()).await;

        match result {
            ScriptResult::Success(success) => {
                // The in-sandbox value was readable by the script itself.
                let variables = success.updated_variables.expect("expected variables");
                assert!(variables["big_len"].as_i64().unwrap() >= 150_000);
                // But the suppressed key never counts as a storage update.
                assert!(success.updated_storage.is_none());
            }
            other => panic!("expected success, got {other:?}"),
        }

        assert!(cache.scope_contents("proj", "node", StorageScope::Session).await.is_none());
    }

    #[tokio::test]
    async fn test_suppressed_overwrite_keeps_prior_value_in_cache() {
        let (invoker, cache) = invoker_with_cache(ScriptConfig::default());
        let mut context = pre_context();
        context.session_storage.insert("keep".into(), json!("v"));

        let script = "
            let big = \"\";
            let chunk = \"0123456789\";
            while big.len < 150_000 { big += chunk; }
            session[\"keep\"] = big;
            session[\"other\"] = 1;
        ";
        let result = invoker.invoke(script, context).await;

        match result {
            ScriptResult::Success(success) => {
                // The storage update reports the stale value, not a deletion.
                let storage = success.updated_storage.expect("expected storage update");
                let session = storage.session.expect("expected session map");
                assert_eq!(session["keep"], json!("v"));
                assert_eq!(session["other"], json!(1));
            }
            other => panic!("expected success, got {other:?}"),
        }

        let contents = cache
            .scope_contents("proj", "node", StorageScope::Session)
            .await
            .expect("mutation should have reached the cache");
        assert_eq!(contents["keep"], json!("v"));
        assert_eq!(contents["other"], json!(1));
    }

    #[tokio::test]
    async fn test_after_script_reads_response() {
        let (invoker, _cache) = invoker_with_cache(ScriptConfig::default());
        let response =
            ResponseView { status: 200, headers: Default::default(), body: "pong".into() };
        let context = ScriptContext::after(
            NodeKind::Http,
            RequestView::default(),
            response,
            "proj",
            "node",
        );

        let result = invoker.invoke("vars.body = response.body;", context).await;

        match result {
            ScriptResult::Success(success) => {
                let variables = success.updated_variables.expect("expected variables");
                assert_eq!(variables["body"], json!("pong"));
                assert!(success.request_patch.is_none());
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_guard_is_single_shot() {
        let guard = ResolveGuard::new();
        assert!(guard.try_resolve());
        assert!(!guard.try_resolve());
        assert!(!guard.try_resolve());
    }
}
