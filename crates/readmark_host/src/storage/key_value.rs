//! Persistent key-value store contract shared by every extension context, plus adapters.
//!
//! The store is the ground truth shared across contexts. Values are JSON documents; writes from
//! any context surface in every subscribed context through [`KeyValueStore::subscribe`].

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
};

use futures::channel::oneshot;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{StoreError, Subscription};

/// Object-safe boxed future used by [`KeyValueStore`] async methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

#[derive(Debug, Clone, PartialEq)]
/// One change observed on the store's change feed.
pub struct StoreChange {
    /// Key that changed.
    pub key: String,
    /// Value before the change, `None` when the key was absent.
    pub old_value: Option<Value>,
    /// Value after the change, `None` when the key was removed.
    pub new_value: Option<Value>,
}

/// Callback registered on a store change feed.
pub type ChangeCallback = Rc<dyn Fn(&StoreChange)>;

/// Asynchronous key-value store shared by all extension contexts.
pub trait KeyValueStore {
    /// Loads the JSON value stored under `key`.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Result<Option<Value>, StoreError>>;

    /// Stores `value` under `key`.
    ///
    /// Implementations reject payloads over their quota with [`StoreError::QuotaExceeded`].
    fn set<'a>(&'a self, key: &'a str, value: &'a Value)
        -> StoreFuture<'a, Result<(), StoreError>>;

    /// Deletes `key`.
    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Result<(), StoreError>>;

    /// Registers `callback` for every change to any key until the subscription is dropped.
    fn subscribe(&self, callback: ChangeCallback) -> Subscription;
}

#[derive(Debug, Clone, Copy, Default)]
/// No-op store for unsupported targets and baseline tests.
pub struct NoopKeyValueStore;

impl KeyValueStore for NoopKeyValueStore {
    fn get<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, Result<Option<Value>, StoreError>> {
        Box::pin(async { Ok(None) })
    }

    fn set<'a>(
        &'a self,
        _key: &'a str,
        _value: &'a Value,
    ) -> StoreFuture<'a, Result<(), StoreError>> {
        Box::pin(async { Ok(()) })
    }

    fn remove<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, Result<(), StoreError>> {
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self, _callback: ChangeCallback) -> Subscription {
        Subscription::noop()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Number of calls a [`MemoryKeyValueStore`] has received, across all handles.
pub struct StoreCallCounts {
    /// `get` calls.
    pub gets: usize,
    /// `set` calls.
    pub sets: usize,
    /// `remove` calls.
    pub removes: usize,
}

#[derive(Clone, Copy)]
enum Gate {
    Reads,
    Writes,
}

#[derive(Default)]
struct MemoryStoreInner {
    values: RefCell<HashMap<String, Value>>,
    subscribers: RefCell<BTreeMap<u64, ChangeCallback>>,
    next_subscriber_id: Cell<u64>,
    quota_bytes: Cell<Option<usize>>,
    read_failures: RefCell<VecDeque<StoreError>>,
    write_failures: RefCell<VecDeque<StoreError>>,
    reads_held: Cell<bool>,
    writes_held: Cell<bool>,
    held_reads: RefCell<Vec<oneshot::Sender<()>>>,
    held_writes: RefCell<Vec<oneshot::Sender<()>>>,
    calls: Cell<StoreCallCounts>,
    write_log: RefCell<Vec<(String, Value)>>,
}

impl MemoryStoreInner {
    fn count(&self, update: impl FnOnce(&mut StoreCallCounts)) {
        let mut calls = self.calls.get();
        update(&mut calls);
        self.calls.set(calls);
    }

    async fn wait_if_held(&self, gate: Gate) {
        let receiver = {
            let (held, waiters) = match gate {
                Gate::Reads => (&self.reads_held, &self.held_reads),
                Gate::Writes => (&self.writes_held, &self.held_writes),
            };
            if !held.get() {
                return;
            }
            let (sender, receiver) = oneshot::channel();
            waiters.borrow_mut().push(sender);
            receiver
        };
        // A dropped sender only happens when the store itself is gone; proceed either way.
        let _ = receiver.await;
    }

    fn release(&self, gate: Gate) {
        let (held, waiters) = match gate {
            Gate::Reads => (&self.reads_held, &self.held_reads),
            Gate::Writes => (&self.writes_held, &self.held_writes),
        };
        held.set(false);
        let pending = waiters.borrow_mut().drain(..).collect::<Vec<_>>();
        for sender in pending {
            let _ = sender.send(());
        }
    }

    fn check_quota(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let Some(quota) = self.quota_bytes.get() else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StoreError::NotSerializable(e.to_string()))?
            .len();
        if bytes > quota {
            return Err(StoreError::QuotaExceeded {
                key: key.to_string(),
                bytes,
                quota,
            });
        }
        Ok(())
    }

    fn apply(&self, key: &str, new_value: Option<Value>) {
        let old_value = match &new_value {
            Some(value) => self
                .values
                .borrow_mut()
                .insert(key.to_string(), value.clone()),
            None => self.values.borrow_mut().remove(key),
        };
        if old_value == new_value {
            return;
        }
        let change = StoreChange {
            key: key.to_string(),
            old_value,
            new_value,
        };
        let subscribers = self
            .subscribers
            .borrow()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for callback in subscribers {
            callback(&change);
        }
    }
}

#[derive(Clone, Default)]
/// In-memory store shared by every clone, standing in for the extension storage area.
///
/// Clones model separate contexts attached to the same store: a write through one clone reaches
/// the subscribers of all clones. Test hooks cover quotas, injected failures, held operations,
/// and call accounting.
pub struct MemoryKeyValueStore {
    inner: Rc<MemoryStoreInner>,
}

impl MemoryKeyValueStore {
    /// Creates an empty store with no quota.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the store with a per-item quota of `bytes` (serialized JSON length).
    pub fn with_quota(self, bytes: usize) -> Self {
        self.inner.quota_bytes.set(Some(bytes));
        self
    }

    /// Inserts a value without counting a call or notifying subscribers.
    pub fn seed(&self, key: impl Into<String>, value: Value) {
        self.inner.values.borrow_mut().insert(key.into(), value);
    }

    /// Reads the current value without counting a call.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.inner.values.borrow().get(key).cloned()
    }

    /// Applies a change made by some other writer and notifies subscribers.
    pub fn apply_external(&self, key: &str, new_value: Option<Value>) {
        self.inner.apply(key, new_value);
    }

    /// Makes the next `get` fail with `error`.
    pub fn fail_next_get(&self, error: StoreError) {
        self.inner.read_failures.borrow_mut().push_back(error);
    }

    /// Makes the next `set` or `remove` fail with `error`.
    pub fn fail_next_write(&self, error: StoreError) {
        self.inner.write_failures.borrow_mut().push_back(error);
    }

    /// Parks subsequent `get` calls until [`Self::release_reads`].
    pub fn hold_reads(&self) {
        self.inner.reads_held.set(true);
    }

    /// Resumes every parked `get` call.
    pub fn release_reads(&self) {
        self.inner.release(Gate::Reads);
    }

    /// Parks subsequent `set`/`remove` calls until [`Self::release_writes`].
    pub fn hold_writes(&self) {
        self.inner.writes_held.set(true);
    }

    /// Resumes every parked write.
    pub fn release_writes(&self) {
        self.inner.release(Gate::Writes);
    }

    /// Returns call counts across all clones.
    pub fn call_counts(&self) -> StoreCallCounts {
        self.inner.calls.get()
    }

    /// Returns every `(key, value)` passed to `set`, in call order.
    pub fn write_log(&self) -> Vec<(String, Value)> {
        self.inner.write_log.borrow().clone()
    }

    /// Returns the number of live change-feed subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }
}

impl fmt::Debug for MemoryKeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryKeyValueStore")
            .field("keys", &self.inner.values.borrow().len())
            .field("subscribers", &self.subscriber_count())
            .field("calls", &self.call_counts())
            .finish()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Result<Option<Value>, StoreError>> {
        Box::pin(async move {
            self.inner.count(|calls| calls.gets += 1);
            self.inner.wait_if_held(Gate::Reads).await;
            let injected = self.inner.read_failures.borrow_mut().pop_front();
            if let Some(error) = injected {
                return Err(error);
            }
            Ok(self.peek(key))
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a Value,
    ) -> StoreFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.inner.count(|calls| calls.sets += 1);
            self.inner
                .write_log
                .borrow_mut()
                .push((key.to_string(), value.clone()));
            self.inner.wait_if_held(Gate::Writes).await;
            let injected = self.inner.write_failures.borrow_mut().pop_front();
            if let Some(error) = injected {
                return Err(error);
            }
            self.inner.check_quota(key, value)?;
            self.inner.apply(key, Some(value.clone()));
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.inner.count(|calls| calls.removes += 1);
            self.inner.wait_if_held(Gate::Writes).await;
            let injected = self.inner.write_failures.borrow_mut().pop_front();
            if let Some(error) = injected {
                return Err(error);
            }
            self.inner.apply(key, None);
            Ok(())
        })
    }

    fn subscribe(&self, callback: ChangeCallback) -> Subscription {
        let id = self.inner.next_subscriber_id.get();
        self.inner.next_subscriber_id.set(id + 1);
        self.inner.subscribers.borrow_mut().insert(id, callback);
        let inner = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.subscribers.borrow_mut().remove(&id);
            }
        })
    }
}

/// Loads and deserializes a typed value through a [`KeyValueStore`] implementation.
///
/// # Errors
///
/// Returns the store error, or [`StoreError::Corrupt`] when the stored JSON does not decode.
pub async fn load_typed_with<S: KeyValueStore + ?Sized, T: DeserializeOwned>(
    store: &S,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_value(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Some(value))
}

/// Serializes and saves a typed value through a [`KeyValueStore`] implementation.
///
/// # Errors
///
/// Returns [`StoreError::NotSerializable`] or the store's own write error.
pub async fn save_typed_with<S: KeyValueStore + ?Sized, T: Serialize>(
    store: &S,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let raw = serde_json::to_value(value).map_err(|e| StoreError::NotSerializable(e.to_string()))?;
    store.set(key, &raw).await
}

#[cfg(test)]
mod tests {
    use futures::{executor::block_on, FutureExt};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct PrefThing {
        badge: bool,
    }

    fn recording_subscriber(store: &MemoryKeyValueStore) -> (Rc<RefCell<Vec<StoreChange>>>, Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let subscription = store.subscribe(Rc::new(move |change: &StoreChange| {
            sink.borrow_mut().push(change.clone());
        }));
        (seen, subscription)
    }

    #[test]
    fn memory_store_round_trip_and_remove() {
        let store = MemoryKeyValueStore::new();
        let store_obj: &dyn KeyValueStore = &store;

        block_on(store_obj.set("k", &json!({"a": 1}))).expect("set");
        assert_eq!(block_on(store_obj.get("k")).expect("get"), Some(json!({"a": 1})));
        block_on(store_obj.remove("k")).expect("remove");
        assert_eq!(block_on(store_obj.get("k")).expect("get"), None);
        assert_eq!(
            store.call_counts(),
            StoreCallCounts {
                gets: 2,
                sets: 1,
                removes: 1
            }
        );
    }

    #[test]
    fn clones_share_values_and_change_feed() {
        let popup = MemoryKeyValueStore::new();
        let background = popup.clone();
        let (seen, _subscription) = recording_subscriber(&background);

        block_on(popup.set("k", &json!(1))).expect("set");
        block_on(popup.set("k", &json!(1))).expect("same value");
        block_on(popup.remove("k")).expect("remove");

        assert_eq!(
            *seen.borrow(),
            vec![
                StoreChange {
                    key: "k".to_string(),
                    old_value: None,
                    new_value: Some(json!(1)),
                },
                StoreChange {
                    key: "k".to_string(),
                    old_value: Some(json!(1)),
                    new_value: None,
                },
            ]
        );
    }

    #[test]
    fn dropped_subscription_stops_notifications() {
        let store = MemoryKeyValueStore::new();
        let (seen, subscription) = recording_subscriber(&store);
        assert_eq!(store.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(store.subscriber_count(), 0);
        store.apply_external("k", Some(json!("x")));
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn quota_rejects_oversized_payloads_without_storing() {
        let store = MemoryKeyValueStore::new().with_quota(8);
        let err = block_on(store.set("k", &json!("this string is too long"))).expect_err("quota");
        assert!(matches!(err, StoreError::QuotaExceeded { quota: 8, .. }));
        assert_eq!(store.peek("k"), None);
        block_on(store.set("k", &json!(1))).expect("small payload fits");
    }

    #[test]
    fn injected_failures_apply_once() {
        let store = MemoryKeyValueStore::new();
        store.fail_next_get(StoreError::Unavailable("offline".to_string()));
        store.fail_next_write(StoreError::Backend("boom".to_string()));

        assert!(block_on(store.get("k")).is_err());
        assert!(block_on(store.get("k")).is_ok());
        assert!(block_on(store.set("k", &json!(1))).is_err());
        assert_eq!(store.peek("k"), None);
        assert!(block_on(store.set("k", &json!(1))).is_ok());
    }

    #[test]
    fn held_writes_stay_pending_until_released() {
        let store = MemoryKeyValueStore::new();
        store.hold_writes();
        let value = json!(7);
        let mut write = store.set("k", &value);
        assert!((&mut write).now_or_never().is_none());
        assert_eq!(store.peek("k"), None);
        assert_eq!(store.write_log(), vec![("k".to_string(), json!(7))]);

        store.release_writes();
        block_on(write).expect("released write completes");
        assert_eq!(store.peek("k"), Some(json!(7)));
    }

    #[test]
    fn typed_helpers_round_trip_and_report_corruption() {
        let store = MemoryKeyValueStore::new();
        block_on(save_typed_with(&store, "prefs", &PrefThing { badge: true })).expect("save");
        let loaded: Option<PrefThing> = block_on(load_typed_with(&store, "prefs")).expect("load");
        assert_eq!(loaded, Some(PrefThing { badge: true }));

        store.seed("prefs", json!({"badge": "yes"}));
        let err = block_on(load_typed_with::<_, PrefThing>(&store, "prefs")).expect_err("corrupt");
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn noop_store_is_empty_and_successful() {
        let store = NoopKeyValueStore;
        let store_obj: &dyn KeyValueStore = &store;
        assert_eq!(block_on(store_obj.get("k")).expect("get"), None);
        block_on(store_obj.set("k", &json!({}))).expect("set");
        block_on(store_obj.remove("k")).expect("remove");
        drop(store_obj.subscribe(Rc::new(|_: &StoreChange| {})));
    }
}
