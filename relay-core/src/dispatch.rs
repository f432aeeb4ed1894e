//! Path registry: envelope path → handler, built once at startup.
//!
//! Handlers receive a context (the relay, or a connected client) along with the envelope, so the
//! registry can be built before the context exists.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::protocol::Envelope;

type Handler<C> = Box<dyn Fn(&C, &Envelope) + Send + Sync>;

/// Whether a registered handler took the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Handled,
    Unhandled,
}

/// Maps envelope paths to handlers. Unknown paths are logged and dropped by `dispatch`.
pub struct Registry<C> {
    handlers: HashMap<String, Handler<C>>,
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `path`, replacing any previous handler.
    pub fn on<F>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&C, &Envelope) + Send + Sync + 'static,
    {
        self.handlers.insert(path.into(), Box::new(handler));
        self
    }

    /// Run the handler for the envelope's path, if any.
    pub fn try_dispatch(&self, ctx: &C, envelope: &Envelope) -> Dispatched {
        match self.handlers.get(envelope.path.as_str()) {
            Some(handler) => {
                handler(ctx, envelope);
                Dispatched::Handled
            }
            None => Dispatched::Unhandled,
        }
    }

    /// Like `try_dispatch`, dropping unhandled envelopes with a debug log.
    pub fn dispatch(&self, ctx: &C, envelope: &Envelope) -> Dispatched {
        let outcome = self.try_dispatch(ctx, envelope);
        if outcome == Dispatched::Unhandled {
            debug!(
                path = %envelope.path,
                source = %envelope.source,
                target = %envelope.target,
                "no handler for path; dropped"
            );
        }
        outcome
    }
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<&String> = self.handlers.keys().collect();
        paths.sort();
        f.debug_struct("Registry").field("paths", &paths).finish()
    }
}
