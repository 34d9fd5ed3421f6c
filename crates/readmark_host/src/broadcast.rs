//! Direct cross-context messaging capability.
//!
//! Broadcasts are the low-latency path between open contexts; the store's change feed remains the
//! durable one. Delivery is best-effort and a message is never echoed to the endpoint that sent it.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
};

use serde_json::Value;

use crate::{StoreError, Subscription};

/// Object-safe boxed future used by [`Broadcaster`] async methods.
pub type BroadcastFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Callback receiving messages published by other contexts.
pub type BroadcastCallback = Rc<dyn Fn(&Value)>;

/// Publish/subscribe channel between contexts.
pub trait Broadcaster {
    /// Sends `message` to every other listening context.
    ///
    /// Returns [`StoreError::NoReceivers`] when nobody else is listening; callers treat any
    /// failure here as non-fatal.
    fn publish<'a>(&'a self, message: &'a Value) -> BroadcastFuture<'a, Result<(), StoreError>>;

    /// Registers `callback` for messages from other contexts until the subscription is dropped.
    fn subscribe(&self, callback: BroadcastCallback) -> Subscription;
}

#[derive(Debug, Clone, Copy, Default)]
/// Broadcaster for single-context builds; publishing succeeds and reaches nobody.
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn publish<'a>(&'a self, _message: &'a Value) -> BroadcastFuture<'a, Result<(), StoreError>> {
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self, _callback: BroadcastCallback) -> Subscription {
        Subscription::noop()
    }
}

#[derive(Default)]
struct HubInner {
    subscribers: RefCell<BTreeMap<u64, (u64, BroadcastCallback)>>,
    next_subscriber_id: Cell<u64>,
    next_endpoint_id: Cell<u64>,
    published: RefCell<Vec<Value>>,
    failures: RefCell<VecDeque<StoreError>>,
}

#[derive(Clone, Default)]
/// In-memory message bus; each [`MemoryBroadcaster`] endpoint stands for one context.
pub struct MemoryBroadcastHub {
    inner: Rc<HubInner>,
}

impl MemoryBroadcastHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new endpoint on this hub.
    pub fn endpoint(&self) -> MemoryBroadcaster {
        let endpoint = self.inner.next_endpoint_id.get();
        self.inner.next_endpoint_id.set(endpoint + 1);
        MemoryBroadcaster {
            hub: self.inner.clone(),
            endpoint,
        }
    }

    /// Returns every message published on the hub, including failed attempts.
    pub fn published(&self) -> Vec<Value> {
        self.inner.published.borrow().clone()
    }

    /// Makes the next publish on any endpoint fail with `error`.
    pub fn fail_next_publish(&self, error: StoreError) {
        self.inner.failures.borrow_mut().push_back(error);
    }
}

impl fmt::Debug for MemoryBroadcastHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroadcastHub")
            .field("subscribers", &self.inner.subscribers.borrow().len())
            .field("published", &self.inner.published.borrow().len())
            .finish()
    }
}

#[derive(Clone)]
/// One context's endpoint on a [`MemoryBroadcastHub`].
pub struct MemoryBroadcaster {
    hub: Rc<HubInner>,
    endpoint: u64,
}

impl fmt::Debug for MemoryBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroadcaster")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Broadcaster for MemoryBroadcaster {
    fn publish<'a>(&'a self, message: &'a Value) -> BroadcastFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.hub.published.borrow_mut().push(message.clone());
            let injected = self.hub.failures.borrow_mut().pop_front();
            if let Some(error) = injected {
                return Err(error);
            }
            let recipients = self
                .hub
                .subscribers
                .borrow()
                .values()
                .filter(|(endpoint, _)| *endpoint != self.endpoint)
                .map(|(_, callback)| callback.clone())
                .collect::<Vec<_>>();
            if recipients.is_empty() {
                return Err(StoreError::NoReceivers);
            }
            for callback in recipients {
                callback(message);
            }
            Ok(())
        })
    }

    fn subscribe(&self, callback: BroadcastCallback) -> Subscription {
        let id = self.hub.next_subscriber_id.get();
        self.hub.next_subscriber_id.set(id + 1);
        self.hub
            .subscribers
            .borrow_mut()
            .insert(id, (self.endpoint, callback));
        let hub = Rc::downgrade(&self.hub);
        Subscription::new(move || {
            if let Some(hub) = hub.upgrade() {
                hub.subscribers.borrow_mut().remove(&id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use serde_json::json;

    use super::*;

    fn recorder(endpoint: &MemoryBroadcaster) -> (Rc<RefCell<Vec<Value>>>, Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let subscription = endpoint.subscribe(Rc::new(move |message: &Value| {
            sink.borrow_mut().push(message.clone());
        }));
        (seen, subscription)
    }

    #[test]
    fn messages_reach_other_endpoints_but_not_the_sender() {
        let hub = MemoryBroadcastHub::new();
        let popup = hub.endpoint();
        let background = hub.endpoint();
        let (popup_seen, _a) = recorder(&popup);
        let (background_seen, _b) = recorder(&background);

        block_on(popup.publish(&json!({"n": 1}))).expect("publish");

        assert!(popup_seen.borrow().is_empty());
        assert_eq!(*background_seen.borrow(), vec![json!({"n": 1})]);
        assert_eq!(hub.published(), vec![json!({"n": 1})]);
    }

    #[test]
    fn publishing_without_listeners_reports_no_receivers() {
        let hub = MemoryBroadcastHub::new();
        let popup = hub.endpoint();
        let (_seen, _own) = recorder(&popup);
        let err = block_on(popup.publish(&json!(1))).expect_err("nobody else listens");
        assert!(err.is_no_receivers());
    }

    #[test]
    fn injected_failure_and_cancelled_subscription() {
        let hub = MemoryBroadcastHub::new();
        let popup = hub.endpoint();
        let options = hub.endpoint();
        let (seen, subscription) = recorder(&options);

        hub.fail_next_publish(StoreError::Backend("port closed".to_string()));
        assert!(block_on(popup.publish(&json!(1))).is_err());
        block_on(popup.publish(&json!(2))).expect("publish");
        subscription.cancel();
        assert!(block_on(popup.publish(&json!(3))).is_err());

        assert_eq!(*seen.borrow(), vec![json!(2)]);
    }

    #[test]
    fn noop_broadcaster_accepts_everything() {
        let broadcaster = NoopBroadcaster;
        block_on(broadcaster.publish(&json!(null))).expect("publish");
        drop(broadcaster.subscribe(Rc::new(|_: &Value| {})));
    }
}
