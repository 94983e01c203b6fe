use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ErrorEnvelope;
use crate::interpreter::Decider;

/// Maps a registered decider name to its compiled `Decider`. Held by the embedder and threaded
/// through `Engine` by reference — deliberately not a `lazy_static`/global registry the way
/// `gasoline`'s macro-populated `RegistryHandle` is, since a serverless host may cold-start a
/// fresh process with no shared global state guaranteed across invocations (REDESIGN FLAGS).
#[derive(Clone, Default)]
pub struct Registry {
    deciders: HashMap<String, Arc<Decider>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, decider: Decider) {
        self.deciders.insert(name.into(), Arc::new(decider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Decider>> {
        self.deciders.get(name).cloned()
    }
}

pub type ActivityFuture = Pin<Box<dyn Future<Output = Result<Value, ErrorEnvelope>> + Send>>;
pub type ActivityHandler = dyn Fn(Value) -> ActivityFuture + Send + Sync;

/// Maps an activity's `code.action` to a handler. Activities are opaque side-effecting
/// functions invoked by the runner on behalf of an `exec` task (§4.5); they are not part of the
/// deterministic replay surface.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, Arc<ActivityHandler>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, action: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorEnvelope>> + Send + 'static,
    {
        self.handlers
            .insert(action.into(), Arc::new(move |input| Box::pin(handler(input))));
    }

    pub fn get(&self, action: &str) -> Option<Arc<ActivityHandler>> {
        self.handlers.get(action).cloned()
    }
}
