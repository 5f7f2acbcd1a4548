//! Change-detecting storage mirrors exposed to scripts as ordinary maps.
//!
//! Each invocation gets two mirrors (session and durable scope). Scripts read
//! and write them like plain object maps; every mutation is mirrored to the
//! host as a self-contained full snapshot the moment it happens, not batched
//! and not deferred to invocation end. Writes whose serialized value exceeds
//! the configured ceiling still apply inside the sandbox but are never
//! mirrored out; the host cache keeps whatever value it last received for
//! that key, going silently stale.

use std::sync::{Arc, Mutex, PoisonError};

use rhai::{Dynamic, Engine};
use tokio::sync::mpsc::UnboundedSender;

use super::{
    conversions::{dynamic_to_json, json_to_dynamic},
    protocol::{ChannelFamily, Envelope, UnitMessage},
};
use crate::models::{JsonMap, MutationKind, StorageMutation, StorageScope};

struct MirrorState {
    entries: JsonMap,
    /// Last successfully mirrored value per key. Cache-facing snapshots are
    /// built from this map, so a size-suppressed overwrite leaves the host
    /// cache holding the key's previous value rather than dropping the key.
    mirrored: JsonMap,
}

/// A script-facing map wrapper that reports every mutation on the unit's
/// outbound channel.
#[derive(Clone)]
pub struct StorageMirror {
    scope: StorageScope,
    ceiling: usize,
    family: ChannelFamily,
    outbound: UnboundedSender<Envelope>,
    state: Arc<Mutex<MirrorState>>,
}

impl StorageMirror {
    /// Creates a mirror over `initial` contents, bound to the unit's outbound
    /// channel.
    pub fn new(
        scope: StorageScope,
        initial: JsonMap,
        ceiling: usize,
        family: ChannelFamily,
        outbound: UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            scope,
            ceiling,
            family,
            outbound,
            state: Arc::new(Mutex::new(MirrorState {
                entries: initial.clone(),
                mirrored: initial,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: MutationKind, snapshot: JsonMap) {
        let mutation = StorageMutation { scope: self.scope, kind, snapshot };
        match UnitMessage::StorageMutation(mutation).to_envelope(self.family) {
            Ok(envelope) => {
                // The host may already have resolved; a closed channel just
                // means nobody is left to observe the mutation.
                let _ = self.outbound.send(envelope);
            }
            Err(error) => {
                tracing::error!(scope = ?self.scope, %error, "Failed to encode storage mutation");
            }
        }
    }

    /// Reads a key. In-sandbox only, no channel traffic.
    pub fn get(&mut self, key: &str) -> Dynamic {
        self.lock().entries.get(key).map(json_to_dynamic).unwrap_or(Dynamic::UNIT)
    }

    /// Writes a key and mirrors the resulting snapshot, unless the serialized
    /// value exceeds the size ceiling.
    pub fn set(&mut self, key: &str, value: Dynamic) {
        let Some(json_value) = dynamic_to_json(&value) else {
            tracing::warn!(
                scope = ?self.scope,
                key,
                "Storage value has no JSON representation; write ignored"
            );
            return;
        };

        let serialized_len =
            serde_json::to_string(&json_value).map(|s| s.len()).unwrap_or(usize::MAX);

        let mut state = self.lock();
        state.entries.insert(key.to_string(), json_value.clone());

        if serialized_len > self.ceiling {
            tracing::warn!(
                scope = ?self.scope,
                key,
                serialized_len,
                ceiling = self.ceiling,
                "Storage value exceeds size ceiling; host cache not updated for this key"
            );
            return;
        }

        state.mirrored.insert(key.to_string(), json_value);
        let snapshot = state.mirrored.clone();
        drop(state);
        self.emit(MutationKind::Set, snapshot);
    }

    /// Removes a key and mirrors the remaining map.
    pub fn remove(&mut self, key: &str) {
        let mut state = self.lock();
        state.entries.remove(key);
        state.mirrored.remove(key);
        let snapshot = state.mirrored.clone();
        drop(state);
        self.emit(MutationKind::Delete, snapshot);
    }

    /// True when the key exists in the sandbox view.
    pub fn contains(&mut self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Number of entries in the sandbox view.
    pub fn len(&mut self) -> i64 {
        self.lock().entries.len() as i64
    }

    /// Key list of the sandbox view.
    pub fn keys(&mut self) -> rhai::Array {
        self.lock().entries.keys().map(|key| Dynamic::from(key.clone())).collect()
    }

    /// The cache-facing map: the last successfully mirrored value per key.
    /// This is what the host cache holds after replaying every emitted event.
    pub fn cache_view(&self) -> JsonMap {
        self.lock().mirrored.clone()
    }

    /// The full sandbox-side map, including size-suppressed keys.
    pub fn sandbox_view(&self) -> JsonMap {
        self.lock().entries.clone()
    }
}

/// Registers the mirror type and its map-like operations with the engine.
pub fn register_mirror(engine: &mut Engine) {
    engine.register_type_with_name::<StorageMirror>("Storage");
    engine.register_indexer_get(StorageMirror::get);
    engine.register_indexer_set(StorageMirror::set);
    engine.register_fn("get", StorageMirror::get);
    engine.register_fn("set", StorageMirror::set);
    engine.register_fn("remove", StorageMirror::remove);
    engine.register_fn("contains", StorageMirror::contains);
    engine.register_fn("len", StorageMirror::len);
    engine.register_fn("keys", StorageMirror::keys);
}
