//! One-shot reorganization subscriptions.
//!
//! A subscription is consumed by the first event delivered to it: either
//! the next canonical-chain change or [`ChainError::ServiceStopped`].
//! Consumers wanting a stream re-subscribe from inside their handler.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ChainError;
use crate::organizer::Reorganization;

/// What a subscriber receives.
pub type ReorganizeNotice = Result<Arc<Reorganization>, ChainError>;

/// Callback form of a subscription.
pub type ReorganizeHandler = Box<dyn FnOnce(ReorganizeNotice) + Send + 'static>;

enum Target {
    Channel(oneshot::Sender<ReorganizeNotice>),
    Handler(ReorganizeHandler),
}

impl Target {
    fn deliver(self, notice: ReorganizeNotice) {
        match self {
            // A dropped receiver means the subscriber lost interest.
            Self::Channel(sender) => {
                let _ = sender.send(notice);
            }
            Self::Handler(handler) => handler(notice),
        }
    }
}

#[derive(Default)]
struct Inner {
    pending: Vec<Target>,
    stopped: bool,
}

/// Pending one-shot subscriptions.
///
/// Handlers run on the notifying thread after the registry lock has been
/// released, so a handler may subscribe again.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("pending", &inner.pending.len())
            .field("stopped", &inner.stopped)
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for the next event.
    pub fn subscribe_handler(&self, handler: ReorganizeHandler) {
        self.register(Target::Handler(handler));
    }

    /// Register for the next event and receive it on a channel.
    pub fn subscribe(&self) -> oneshot::Receiver<ReorganizeNotice> {
        let (sender, receiver) = oneshot::channel();
        self.register(Target::Channel(sender));
        receiver
    }

    fn register(&self, target: Target) {
        let mut inner = self.inner.lock();
        if inner.stopped {
            drop(inner);
            target.deliver(Err(ChainError::ServiceStopped));
            return;
        }
        inner.pending.push(target);
    }

    /// Deliver `reorganization` to every pending subscription and clear them.
    pub fn notify(&self, reorganization: Reorganization) {
        let targets = std::mem::take(&mut self.inner.lock().pending);
        if targets.is_empty() {
            return;
        }
        debug!(subscribers = targets.len(), fork_height = reorganization.fork_height, "notifying subscribers");
        let reorganization = Arc::new(reorganization);
        for target in targets {
            target.deliver(Ok(Arc::clone(&reorganization)));
        }
    }

    /// Fire [`ChainError::ServiceStopped`] to every pending subscription.
    /// Later subscriptions fire immediately until [`restart`](Self::restart).
    pub fn stop(&self) {
        let targets = {
            let mut inner = self.inner.lock();
            inner.stopped = true;
            std::mem::take(&mut inner.pending)
        };
        for target in targets {
            target.deliver(Err(ChainError::ServiceStopped));
        }
    }

    /// Accept subscriptions again after [`stop`](Self::stop).
    pub fn restart(&self) {
        self.inner.lock().stopped = false;
    }

    /// Number of subscriptions waiting for an event.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
