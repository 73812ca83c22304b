//! Method dispatch registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use crate::context::Context;

/// The boxed future a handler returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A registered handler: consumes the request [`Context`] and responds
/// through it.
pub type HandlerFn = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync>;

/// Concurrent mapping from method name to handler.
///
/// Registration is expected to happen before a connection enters its read
/// loop; it is permitted while the connection is live (last writer wins)
/// but not recommended. Lookups take a shared lock so concurrent dispatch
/// never serializes on the registry.
///
/// # Example
///
/// ```
/// use duorpc_common::HandlerRegistry;
///
/// let registry = HandlerRegistry::new();
/// registry.register("Echo", |ctx| async move {
///     let msg = ctx.param_string("msg", "");
///     let _ = ctx.respond(msg).await;
/// });
/// assert!(registry.get("Echo").is_some());
/// assert!(registry.get("Missing").is_none());
/// ```
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, HandlerFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a handler for `method`, replacing any previous one.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers.write().unwrap().insert(method.into(), handler);
    }

    /// Looks up the handler for `method`.
    pub fn get(&self, method: &str) -> Option<HandlerFn> {
        self.handlers.read().unwrap().get(method).cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
