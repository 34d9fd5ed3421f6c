//! Generic synchronized field: local cache of one store key, kept consistent across contexts.
//!
//! A write updates the local value first, fans out to local listeners, broadcasts to sibling
//! contexts, then persists. Changes arriving from the store's feed or from a broadcast go through
//! the same update path, which only notifies listeners when the value structurally changed.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    rc::{Rc, Weak},
};

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use readmark_host::{Broadcaster, KeyValueStore, StoreChange, Subscription};
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::message::{ContextId, SyncMessage};
use crate::{SyncError, SyncServices, SyncedState};

/// Local observer of a synchronized field; receives `None` when the field is cleared.
pub type StateListener<T> = Rc<dyn Fn(Option<&T>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Handle returned by [`StateSynchronizer::add_listener`].
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of a synchronized field.
pub enum Lifecycle {
    /// Not loaded from the store yet (or reset).
    Uninitialized,
    /// The initial load is in flight.
    Loading,
    /// Loaded and subscribed to change feeds.
    Ready,
    /// Torn down; no further work is accepted.
    TornDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Side-effect-free view of a synchronized field.
pub struct StateSummary {
    /// Store key of the field.
    pub key: String,
    /// Current lifecycle stage.
    pub lifecycle: Lifecycle,
    /// Whether the initial load has completed.
    pub initialized: bool,
    /// Whether a value is present.
    pub present: bool,
}

type InitFuture = Shared<LocalBoxFuture<'static, Result<(), SyncError>>>;

enum InitState {
    Uninitialized,
    Loading(InitFuture),
    Ready,
    TornDown,
}

impl InitState {
    fn lifecycle(&self) -> Lifecycle {
        match self {
            Self::Uninitialized => Lifecycle::Uninitialized,
            Self::Loading(_) => Lifecycle::Loading,
            Self::Ready => Lifecycle::Ready,
            Self::TornDown => Lifecycle::TornDown,
        }
    }
}

struct SyncInner<T> {
    key: String,
    context: ContextId,
    store: Rc<dyn KeyValueStore>,
    broadcaster: Rc<dyn Broadcaster>,
    current: RefCell<Option<T>>,
    init: RefCell<InitState>,
    // Bumped on reset/teardown so an in-flight load cannot resurrect stale state.
    generation: Cell<u64>,
    listeners: RefCell<BTreeMap<ListenerId, StateListener<T>>>,
    next_listener_id: Cell<u64>,
    subscriptions: RefCell<Vec<Subscription>>,
    // Local writes whose persist has not completed, keyed by write sequence.
    pending_writes: RefCell<BTreeMap<u64, Option<Value>>>,
    next_write_seq: Cell<u64>,
}

/// Removes a local write from the in-flight set once its persist settles or is dropped.
struct PendingWrite<'a, T> {
    inner: &'a SyncInner<T>,
    seq: u64,
}

impl<T> Drop for PendingWrite<'_, T> {
    fn drop(&mut self) {
        self.inner.pending_writes.borrow_mut().remove(&self.seq);
    }
}

impl<T: SyncedState> SyncInner<T> {
    fn torn_down(&self) -> SyncError {
        SyncError::TornDown {
            key: self.key.clone(),
        }
    }

    fn is_torn_down(&self) -> bool {
        matches!(*self.init.borrow(), InitState::TornDown)
    }

    fn decode(&self, raw: Option<Value>) -> Result<Option<T>, SyncError> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        let value = serde_json::from_value::<T>(raw).map_err(|e| SyncError::InvalidPayload {
            key: self.key.clone(),
            reason: e.to_string(),
        })?;
        value
            .validate()
            .map_err(|reason| SyncError::InvalidPayload {
                key: self.key.clone(),
                reason,
            })?;
        Ok(Some(value))
    }

    fn encode(&self, value: Option<&T>) -> Result<Option<Value>, SyncError> {
        let Some(value) = value else {
            return Ok(None);
        };
        value.validate().map_err(|reason| SyncError::InvalidPayload {
            key: self.key.clone(),
            reason,
        })?;
        serde_json::to_value(value)
            .map(Some)
            .map_err(|e| SyncError::NotSerializable {
                key: self.key.clone(),
                reason: e.to_string(),
            })
    }

    fn begin_write(&self, raw: Option<Value>) -> PendingWrite<'_, T> {
        let seq = self.next_write_seq.get();
        self.next_write_seq.set(seq + 1);
        self.pending_writes.borrow_mut().insert(seq, raw);
        PendingWrite { inner: self, seq }
    }

    /// Whether a store change only echoes a local write that a newer local write superseded.
    fn is_superseded_echo(&self, raw: &Option<Value>) -> bool {
        let pending = self.pending_writes.borrow();
        let Some(latest) = pending.keys().next_back().copied() else {
            return false;
        };
        pending
            .range(..latest)
            .any(|(_, written)| written == raw)
    }

    /// The single update path: replaces `current` and notifies only on structural change.
    fn apply(&self, next: Option<T>) -> bool {
        {
            let mut current = self.current.borrow_mut();
            if *current == next {
                trace!(key = %self.key, context = %self.context, "value unchanged; listeners not notified");
                return false;
            }
            *current = next.clone();
        }
        self.notify(next.as_ref());
        true
    }

    fn notify(&self, value: Option<&T>) {
        let listeners = self
            .listeners
            .borrow()
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect::<Vec<_>>();
        for (id, listener) in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(value))) {
                warn!(
                    key = %self.key,
                    context = %self.context,
                    listener = id.0,
                    "listener panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    fn receive(&self, raw: Option<Value>, via: &'static str) {
        if self.is_torn_down() {
            return;
        }
        match self.decode(raw) {
            Ok(next) => {
                if self.apply(next) {
                    debug!(key = %self.key, context = %self.context, via, "applied external change");
                }
            }
            Err(err) => {
                warn!(key = %self.key, context = %self.context, via, error = %err, "ignoring external change");
            }
        }
    }

    async fn broadcast(&self, value: Option<Value>) {
        let message = SyncMessage::StateChanged {
            key: self.key.clone(),
            origin: self.context.clone(),
            value,
        };
        let message = match serde_json::to_value(&message) {
            Ok(message) => message,
            Err(err) => {
                debug!(key = %self.key, error = %err, "broadcast message not encodable");
                return;
            }
        };
        if let Err(err) = self.broadcaster.publish(&message).await {
            debug!(key = %self.key, context = %self.context, error = %err, "broadcast not delivered");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

fn subscribe_feeds<T: SyncedState>(inner: &Rc<SyncInner<T>>) -> Vec<Subscription> {
    let store_target = Rc::downgrade(inner);
    let store_subscription = inner.store.subscribe(Rc::new(move |change: &StoreChange| {
        let Some(inner) = store_target.upgrade() else {
            return;
        };
        if change.key != inner.key {
            return;
        }
        if inner.is_superseded_echo(&change.new_value) {
            trace!(key = %inner.key, context = %inner.context, "ignoring echo of a superseded local write");
            return;
        }
        inner.receive(change.new_value.clone(), "store");
    }));

    let broadcast_target = Rc::downgrade(inner);
    let broadcast_subscription = inner.broadcaster.subscribe(Rc::new(move |message: &Value| {
        let Some(inner) = broadcast_target.upgrade() else {
            return;
        };
        match SyncMessage::from_value(message) {
            Some(SyncMessage::StateChanged { key, origin, value })
                if key == inner.key && origin != inner.context =>
            {
                inner.receive(value, "broadcast");
            }
            _ => {}
        }
    }));

    vec![store_subscription, broadcast_subscription]
}

// Holds the field weakly: the in-flight future is owned by the field's own init state.
async fn load<T: SyncedState>(
    target: Weak<SyncInner<T>>,
    key: String,
) -> Result<(), SyncError> {
    let Some((store, generation)) = target
        .upgrade()
        .map(|inner| (inner.store.clone(), inner.generation.get()))
    else {
        return Err(SyncError::TornDown { key });
    };
    let loaded = store.get(&key).await;
    let Some(inner) = target.upgrade() else {
        return Err(SyncError::TornDown { key });
    };
    if inner.generation.get() != generation {
        // Reset or torn down while the read was in flight.
        return if inner.is_torn_down() {
            Err(inner.torn_down())
        } else {
            Ok(())
        };
    }

    let raw = match loaded {
        Ok(raw) => raw,
        Err(source) => {
            warn!(key = %inner.key, context = %inner.context, error = %source, "initial load failed");
            *inner.init.borrow_mut() = InitState::Uninitialized;
            return Err(SyncError::Load {
                key: inner.key.clone(),
                source,
            });
        }
    };
    let value = inner.decode(raw).unwrap_or_else(|err| {
        warn!(key = %inner.key, context = %inner.context, error = %err, "discarding invalid persisted value");
        None
    });

    let subscriptions = subscribe_feeds(&inner);
    inner.subscriptions.borrow_mut().extend(subscriptions);
    *inner.init.borrow_mut() = InitState::Ready;
    inner.apply(value);
    debug!(key = %inner.key, context = %inner.context, "synchronized field ready");
    Ok(())
}

/// One synchronized field of type `T`, owned by a single context.
///
/// Clones are handles to the same field. Within a context, a write is visible to subsequent
/// reads immediately, even while the store write is still pending. Across contexts the store's
/// last write wins and each context converges once it sees the change.
pub struct StateSynchronizer<T> {
    inner: Rc<SyncInner<T>>,
}

impl<T> Clone for StateSynchronizer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for StateSynchronizer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSynchronizer")
            .field("key", &self.inner.key)
            .field("context", &self.inner.context)
            .field("listeners", &self.inner.listeners.borrow().len())
            .finish_non_exhaustive()
    }
}

impl<T: SyncedState> StateSynchronizer<T> {
    /// Creates an uninitialized field bound to `key` in the given context.
    pub fn new(key: impl Into<String>, services: &SyncServices) -> Self {
        Self {
            inner: Rc::new(SyncInner {
                key: key.into(),
                context: services.context.clone(),
                store: services.store.clone(),
                broadcaster: services.broadcaster.clone(),
                current: RefCell::new(None),
                init: RefCell::new(InitState::Uninitialized),
                generation: Cell::new(0),
                listeners: RefCell::new(BTreeMap::new()),
                next_listener_id: Cell::new(0),
                subscriptions: RefCell::new(Vec::new()),
                pending_writes: RefCell::new(BTreeMap::new()),
                next_write_seq: Cell::new(0),
            }),
        }
    }

    /// Returns the store key of this field.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Returns the current lifecycle stage.
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.init.borrow().lifecycle()
    }

    /// Returns whether the initial load has completed.
    pub fn is_initialized(&self) -> bool {
        self.lifecycle() == Lifecycle::Ready
    }

    /// Loads the persisted value once and subscribes to the store and broadcast feeds.
    ///
    /// Concurrent callers share the single in-flight load. Once ready, further calls return
    /// immediately. A [`Self::reset`] while the load is in flight makes waiting callers start
    /// (or join) a fresh load.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Load`] when the store read fails (the field stays uninitialized and
    /// a later call retries), or [`SyncError::TornDown`].
    pub async fn initialize(&self) -> Result<(), SyncError> {
        loop {
            let pending = {
                let mut init = self.inner.init.borrow_mut();
                let in_flight = match &*init {
                    InitState::Ready => return Ok(()),
                    InitState::TornDown => return Err(self.inner.torn_down()),
                    InitState::Loading(pending) => Some(pending.clone()),
                    InitState::Uninitialized => None,
                };
                match in_flight {
                    Some(pending) => pending,
                    None => {
                        trace!(key = %self.inner.key, context = %self.inner.context, "starting initial load");
                        let pending = load(Rc::downgrade(&self.inner), self.inner.key.clone())
                            .boxed_local()
                            .shared();
                        *init = InitState::Loading(pending.clone());
                        pending
                    }
                }
            };
            pending.await?;
        }
    }

    /// Returns the current value, initializing first if needed.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::initialize`] failures.
    pub async fn get_value(&self) -> Result<Option<T>, SyncError> {
        self.initialize().await?;
        Ok(self.peek())
    }

    /// Returns the current local value without initializing.
    pub fn peek(&self) -> Option<T> {
        self.inner.current.borrow().clone()
    }

    /// Writes `value`: local update and listener fan-out first, then broadcast, then persist.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPayload`] or [`SyncError::NotSerializable`] before anything
    /// changes, or [`SyncError::Persist`] after the local value and broadcast already took
    /// effect; the local value is not rolled back.
    pub async fn set_value(&self, value: T) -> Result<(), SyncError> {
        self.write(Some(value)).await
    }

    /// Clears the field locally, notifies, broadcasts, and removes the persisted key.
    ///
    /// # Errors
    ///
    /// Same as [`Self::set_value`].
    pub async fn clear(&self) -> Result<(), SyncError> {
        self.write(None).await
    }

    async fn write(&self, next: Option<T>) -> Result<(), SyncError> {
        self.initialize().await?;
        let inner = &self.inner;
        let raw = inner.encode(next.as_ref())?;
        let _pending = inner.begin_write(raw.clone());

        inner.apply(next);
        inner.broadcast(raw.clone()).await;

        let persisted = match &raw {
            Some(value) => inner.store.set(&inner.key, value).await,
            None => inner.store.remove(&inner.key).await,
        };
        persisted.map_err(|source| {
            warn!(key = %inner.key, context = %inner.context, error = %source, "persist failed; keeping local value");
            SyncError::Persist {
                key: inner.key.clone(),
                source,
            }
        })
    }

    /// Reconciles a value observed from another context.
    ///
    /// Returns whether the value changed (and listeners were notified). Values failing
    /// validation and calls after teardown are ignored.
    pub fn on_external_change(&self, value: Option<T>) -> bool {
        if self.inner.is_torn_down() {
            return false;
        }
        if let Some(Err(reason)) = value.as_ref().map(SyncedState::validate) {
            warn!(key = %self.inner.key, %reason, "ignoring invalid external value");
            return false;
        }
        self.inner.apply(value)
    }

    /// Reconciles a raw JSON payload observed from another context.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPayload`] when the payload does not decode or validate.
    pub fn on_external_json(&self, raw: Option<Value>) -> Result<bool, SyncError> {
        let value = self.inner.decode(raw)?;
        Ok(self.on_external_change(value))
    }

    /// Registers a local listener.
    pub fn add_listener(&self, listener: impl Fn(Option<&T>) + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_listener_id.get());
        self.inner.next_listener_id.set(id.0 + 1);
        self.inner
            .listeners
            .borrow_mut()
            .insert(id, Rc::new(listener));
        id
    }

    /// Unregisters a listener; returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.borrow_mut().remove(&id).is_some()
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// Returns a side-effect-free summary of the field.
    pub fn summary(&self) -> StateSummary {
        let lifecycle = self.lifecycle();
        StateSummary {
            key: self.inner.key.clone(),
            lifecycle,
            initialized: lifecycle == Lifecycle::Ready,
            present: self.inner.current.borrow().is_some(),
        }
    }

    /// Forgets the local value and unsubscribes so the next access reloads from the store.
    ///
    /// Listeners stay registered. Has no effect after teardown.
    pub fn reset(&self) {
        if self.inner.is_torn_down() {
            return;
        }
        self.inner.generation.set(self.inner.generation.get() + 1);
        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.borrow_mut());
        drop(subscriptions);
        *self.inner.init.borrow_mut() = InitState::Uninitialized;
        *self.inner.current.borrow_mut() = None;
        debug!(key = %self.inner.key, context = %self.inner.context, "synchronized field reset");
    }

    /// Drops listeners, cancels subscriptions, and refuses further work.
    pub fn teardown(&self) {
        self.inner.generation.set(self.inner.generation.get() + 1);
        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.borrow_mut());
        drop(subscriptions);
        self.inner.listeners.borrow_mut().clear();
        *self.inner.init.borrow_mut() = InitState::TornDown;
        *self.inner.current.borrow_mut() = None;
        debug!(key = %self.inner.key, context = %self.inner.context, "synchronized field torn down");
    }
}
