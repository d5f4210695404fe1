//! Handler registry: method name to typed handler adapter.
//!
//! Handlers are async functions over a [`Context`] and a concrete argument
//! type, returning a concrete reply type. Registration erases the types behind
//! a pair of closures: one that decodes the argument from a wire body, one
//! that invokes the handler and encodes the reply in the connection's wire
//! format. This keeps "argument type chosen per method" without runtime
//! reflection, and lets one registry serve connections of either codec family.
//!
//! The handler shape is enforced by the `handle` signature at compile time.
//! The two conditions left for runtime are programming errors and panic:
//! registering the same name twice, and registering after the first dispatch
//! (a registry is immutable once in use, since it is shared between a server
//! and every peer it serves).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;
use crate::frame::{Body, WireFormat};
use crate::peer::Context;

type DecodeFn = Box<dyn Fn(&Body) -> Result<Box<dyn Any + Send>, CodecError> + Send + Sync>;
type InvokeFn =
    Box<dyn Fn(Context, Box<dyn Any + Send>, WireFormat) -> BoxFuture<'static, Outcome> + Send + Sync>;

/// What a handler invocation produced, in wire terms: the error string
/// (empty on success) and the encoded reply. The reply is serialized even
/// when the error is non-empty, matching the wire contract.
pub(crate) struct Outcome {
    pub(crate) error: String,
    pub(crate) body: Result<Body, CodecError>,
}

pub(crate) struct Handler {
    pub(crate) decode: DecodeFn,
    pub(crate) invoke: InvokeFn,
}

/// Maps method names to handler adapters. O(1) lookup by name.
#[derive(Default)]
pub struct Registry {
    handlers: RwLock<HashMap<String, Arc<Handler>>>,
    sealed: AtomicBool,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Register a handler for `method`.
    ///
    /// The reply type needs `Default` because an error-carrying response still
    /// serializes a reply value.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered under `method`, or if the
    /// registry has already served a dispatch. Both are programming errors.
    pub fn handle<A, R, E, F, Fut>(&self, method: &str, f: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        E: fmt::Display,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        if self.sealed.load(Ordering::Acquire) {
            panic!("birpc: handler registered after first use: {method}");
        }

        let decode: DecodeFn =
            Box::new(|body| Ok(Box::new(body.decode::<A>()?) as Box<dyn Any + Send>));

        let invoke: InvokeFn = Box::new(move |ctx, args, format| {
            let args = *args
                .downcast::<A>()
                .expect("argument box holds the registered type");
            let fut = f(ctx, args);
            Box::pin(async move {
                match fut.await {
                    Ok(reply) => Outcome {
                        error: String::new(),
                        body: Body::encode(format, &reply),
                    },
                    Err(e) => Outcome {
                        error: e.to_string(),
                        body: Body::encode(format, &R::default()),
                    },
                }
            })
        });

        let mut handlers = self.handlers.write();
        if handlers.contains_key(method) {
            panic!("birpc: multiple registrations for {method}");
        }
        handlers.insert(method.to_string(), Arc::new(Handler { decode, invoke }));
    }

    /// Look up a handler by method name. The first lookup seals the registry.
    pub(crate) fn lookup(&self, method: &str) -> Option<Arc<Handler>> {
        self.sealed.store(true, Ordering::Release);
        self.handlers.read().get(method).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;

    fn echo(registry: &Registry, name: &str) {
        registry.handle(name, |_ctx: Context, n: i64| async move {
            Ok::<i64, RpcError>(n)
        });
    }

    #[test]
    fn lookup_finds_registered_handlers() {
        let registry = Registry::new();
        echo(&registry, "echo");
        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    #[should_panic(expected = "multiple registrations for echo")]
    fn duplicate_registration_panics() {
        let registry = Registry::new();
        echo(&registry, "echo");
        echo(&registry, "echo");
    }

    #[test]
    #[should_panic(expected = "after first use")]
    fn registration_after_first_lookup_panics() {
        let registry = Registry::new();
        echo(&registry, "echo");
        let _ = registry.lookup("echo");
        echo(&registry, "late");
    }
}
