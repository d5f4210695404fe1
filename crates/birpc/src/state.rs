//! Per-peer state slot.
//!
//! A [`State`] is an opaque bag of values a caller can bind to a single peer,
//! typically through `Server::serve_codec_with_state`. Its lifetime equals the
//! peer engine's; handlers reach it via `ctx.peer().state()`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Typed key/value storage bound to one peer.
#[derive(Default)]
pub struct State {
    entries: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl State {
    pub fn new() -> State {
        State::default()
    }

    /// Store a value under `key`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.entries.write().insert(key.into(), Arc::new(value));
    }

    /// Fetch the value under `key`, if present and of the requested type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entry = self.entries.read().get(key).cloned()?;
        entry.downcast().ok()
    }
}
