//! Script compiler with a content-addressed cache.
//!
//! The same pre/after script is typically invoked many times while a user
//! iterates on a request, so compiled ASTs are cached keyed by the SHA-256 of
//! the source. Compilation failure is the invocation's syntax failure,
//! detected before any execution starts.

use std::sync::Arc;

use dashmap::DashMap;
use rhai::{Engine, AST};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A type alias for the hash of a script source.
type ScriptHash = [u8; 32];

/// Errors that can occur during script compilation.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    /// The source failed to parse.
    #[error("Script compilation error: {0}")]
    Parse(#[from] rhai::ParseError),
}

/// Compiles script sources into ASTs, caching the result per source hash.
#[derive(Default)]
pub struct ScriptCompiler {
    cache: DashMap<ScriptHash, Arc<AST>>,
}

impl ScriptCompiler {
    /// Creates a new compiler with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn hash_script(source: &str) -> ScriptHash {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.finalize().into()
    }

    /// Compiles `source` with the given engine, or returns the cached AST for
    /// an already-seen source.
    pub fn compile(&self, engine: &Engine, source: &str) -> Result<Arc<AST>, CompileError> {
        let key = Self::hash_script(source);

        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.value().clone());
        }

        let ast = Arc::new(engine.compile(source)?);
        self.cache.insert(key, ast.clone());
        Ok(ast)
    }

    /// Number of cached compilations.
    #[cfg(test)]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}
