use std::collections::HashMap;
use std::sync::{Arc, Weak};

use gcs_proto::{Message, MessageKind};
use tracing::trace;

pub type Handler<C> = dyn Fn(&Message, &mut C) + Send + Sync;

/// Keeps a handler registered; dropping it unregisters the handler.
#[must_use = "the handler is unregistered when the subscription is dropped"]
pub struct Subscription<C> {
    _handler: Arc<Handler<C>>,
}

/// Demultiplexes decoded messages by kind.
///
/// The router never owns handlers: it keeps weak references and forgets a
/// handler once its [`Subscription`] is gone.
pub struct Router<C> {
    routes: HashMap<MessageKind, Vec<Weak<Handler<C>>>>,
}

impl<C> Default for Router<C> {
    fn default() -> Self {
        Self { routes: HashMap::new() }
    }
}

impl<C> Router<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, kind: MessageKind, handler: F) -> Subscription<C>
    where
        F: Fn(&Message, &mut C) + Send + Sync + 'static,
    {
        let handler: Arc<Handler<C>> = Arc::new(handler);
        self.routes.entry(kind).or_default().push(Arc::downgrade(&handler));
        Subscription { _handler: handler }
    }

    /// Invokes every live handler for the message's kind in registration
    /// order and returns how many ran.
    pub fn dispatch(&mut self, msg: &Message, ctx: &mut C) -> usize {
        let kind = msg.kind();
        let Some(handlers) = self.routes.get_mut(&kind) else {
            trace!(?kind, "router: no handler, dropping");
            return 0;
        };

        let mut invoked = 0;
        handlers.retain(|weak| match weak.upgrade() {
            Some(handler) => {
                handler(msg, ctx);
                invoked += 1;
                true
            }
            None => false,
        });
        if handlers.is_empty() {
            self.routes.remove(&kind);
        }
        invoked
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.routes
            .get(&kind)
            .map(|hs| hs.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }
}
