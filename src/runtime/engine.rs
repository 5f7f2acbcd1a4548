//! Engine factory applying the sandbox's security configuration.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use rhai::{Dynamic, Engine};

use crate::config::ScriptConfig;

/// Symbols with no place inside the sandbox. Scripts get their network access
/// through the bridge and their persistence through the storage mirrors only.
const DANGEROUS_SYMBOLS: &[&str] =
    &["eval", "import", "export", "debug", "File", "file", "net", "system", "process", "thread", "spawn"];

/// Creates an engine with security limits from the configuration and a kill
/// flag checked at every operation boundary.
///
/// Setting `kill_flag` terminates the running script at its next operation;
/// no shutdown signal reaches user code, execution simply stops.
pub fn create_engine(config: &ScriptConfig, kill_flag: Arc<AtomicBool>) -> Engine {
    let mut engine = Engine::new();

    engine.set_max_operations(config.max_operations);
    engine.set_max_call_levels(config.max_call_levels);
    engine.set_max_string_size(config.max_string_size);
    engine.set_max_array_size(config.max_array_size);

    for &symbol in DANGEROUS_SYMBOLS {
        engine.disable_symbol(symbol);
    }

    engine.on_progress(move |_ops| {
        if kill_flag.load(Ordering::Relaxed) {
            Some(Dynamic::from("cancelled"))
        } else {
            None
        }
    });

    engine
}
