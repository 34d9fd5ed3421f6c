//! `localStorage`-backed implementation of [`readmark_host::KeyValueStore`].
//!
//! Values are stored as JSON text. Browsers only fire `storage` events in *other* documents, so
//! writes made through this handle are also announced to its own subscribers; together the two
//! sources give every context the full change feed.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt,
    rc::Rc,
};

use readmark_host::{ChangeCallback, KeyValueStore, StoreChange, StoreError, StoreFuture, Subscription};
use serde_json::Value;
use tracing::warn;

/// Nominal per-origin `localStorage` budget reported in quota errors.
pub const LOCAL_STORAGE_QUOTA_BYTES: usize = 5 * 1024 * 1024;

#[derive(Default)]
struct LocalSubscribers {
    callbacks: RefCell<BTreeMap<u64, ChangeCallback>>,
    next_id: Cell<u64>,
}

impl LocalSubscribers {
    fn register(&self, callback: ChangeCallback) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.callbacks.borrow_mut().insert(id, callback);
        id
    }

    fn notify(&self, change: &StoreChange) {
        let callbacks = self.callbacks.borrow().values().cloned().collect::<Vec<_>>();
        for callback in callbacks {
            callback(change);
        }
    }
}

#[derive(Clone, Default)]
/// Shared store backed by `window.localStorage`.
///
/// Clones share one set of local subscribers.
pub struct WebKeyValueStore {
    subscribers: Rc<LocalSubscribers>,
}

impl fmt::Debug for WebKeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebKeyValueStore")
            .field("subscribers", &self.subscribers.callbacks.borrow().len())
            .finish()
    }
}

impl WebKeyValueStore {
    /// Creates a store handle with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the raw JSON text stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when `localStorage` cannot be reached.
    pub fn load_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        #[cfg(target_arch = "wasm32")]
        {
            local_storage()?
                .get_item(key)
                .map_err(|e| StoreError::Backend(format!("localStorage get_item failed: {e:?}")))
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = key;
            Ok(None)
        }
    }

    /// Writes raw JSON text under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::QuotaExceeded`] when the browser rejects the write for size, or
    /// another [`StoreError`] when `localStorage` is unavailable or fails.
    pub fn save_raw(&self, key: &str, raw_json: &str) -> Result<(), StoreError> {
        #[cfg(target_arch = "wasm32")]
        {
            use wasm_bindgen::JsCast;

            local_storage()?.set_item(key, raw_json).map_err(|e| {
                let quota = e
                    .dyn_ref::<web_sys::DomException>()
                    .is_some_and(|exception| exception.name() == "QuotaExceededError");
                if quota {
                    StoreError::QuotaExceeded {
                        key: key.to_string(),
                        bytes: raw_json.len(),
                        quota: LOCAL_STORAGE_QUOTA_BYTES,
                    }
                } else {
                    StoreError::Backend(format!("localStorage set_item failed: {e:?}"))
                }
            })
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = (key, raw_json);
            Ok(())
        }
    }

    /// Deletes `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when `localStorage` cannot be reached.
    pub fn delete_raw(&self, key: &str) -> Result<(), StoreError> {
        #[cfg(target_arch = "wasm32")]
        {
            local_storage()?
                .remove_item(key)
                .map_err(|e| StoreError::Backend(format!("localStorage remove_item failed: {e:?}")))
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = key;
            Ok(())
        }
    }

    fn read(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let Some(raw) = self.load_raw(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn announce(&self, key: &str, old_value: Option<Value>, new_value: Option<Value>) {
        if old_value == new_value {
            return;
        }
        self.subscribers.notify(&StoreChange {
            key: key.to_string(),
            old_value,
            new_value,
        });
    }
}

impl KeyValueStore for WebKeyValueStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Result<Option<Value>, StoreError>> {
        Box::pin(async move { self.read(key) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a Value,
    ) -> StoreFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let raw = serde_json::to_string(value)
                .map_err(|e| StoreError::NotSerializable(e.to_string()))?;
            let old_value = self.read(key).unwrap_or_else(|err| {
                warn!(key, error = %err, "previous value unreadable; overwriting");
                None
            });
            self.save_raw(key, &raw)?;
            self.announce(key, old_value, Some(value.clone()));
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let old_value = self.read(key).unwrap_or(None);
            self.delete_raw(key)?;
            self.announce(key, old_value, None);
            Ok(())
        })
    }

    fn subscribe(&self, callback: ChangeCallback) -> Subscription {
        let id = self.subscribers.register(callback.clone());
        let subscribers = Rc::downgrade(&self.subscribers);

        #[cfg(target_arch = "wasm32")]
        let remote = listen_storage_events(callback);
        #[cfg(not(target_arch = "wasm32"))]
        let remote = {
            let _ = callback;
            Subscription::noop()
        };

        Subscription::new(move || {
            if let Some(subscribers) = subscribers.upgrade() {
                subscribers.callbacks.borrow_mut().remove(&id);
            }
            remote.cancel();
        })
    }
}

#[cfg(target_arch = "wasm32")]
fn local_storage() -> Result<web_sys::Storage, StoreError> {
    web_sys::window()
        .and_then(|w| w.local_storage().ok().flatten())
        .ok_or_else(|| StoreError::Unavailable("localStorage unavailable".to_string()))
}

#[cfg(target_arch = "wasm32")]
fn parse_event_value(key: &str, raw: Option<String>) -> Option<Value> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, error = %err, "ignoring undecodable storage event value");
            None
        }
    }
}

/// Forwards `storage` events raised by writes in other documents of the same origin.
#[cfg(target_arch = "wasm32")]
fn listen_storage_events(callback: ChangeCallback) -> Subscription {
    use wasm_bindgen::{closure::Closure, JsCast};

    let Some(window) = web_sys::window() else {
        return Subscription::noop();
    };
    let on_storage = Closure::<dyn FnMut(web_sys::StorageEvent)>::wrap(Box::new(
        move |event: web_sys::StorageEvent| {
            // A `None` key means the whole area was cleared; nothing reads that as a change.
            let Some(key) = event.key() else {
                return;
            };
            let change = StoreChange {
                old_value: parse_event_value(&key, event.old_value()),
                new_value: parse_event_value(&key, event.new_value()),
                key,
            };
            callback(&change);
        },
    ));
    if let Err(err) =
        window.add_event_listener_with_callback("storage", on_storage.as_ref().unchecked_ref())
    {
        warn!(error = ?err, "could not listen for storage events");
        return Subscription::noop();
    }
    Subscription::new(move || {
        let _ = window
            .remove_event_listener_with_callback("storage", on_storage.as_ref().unchecked_ref());
        drop(on_storage);
    })
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use std::cell::RefCell;

    use futures::executor::block_on;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn local_writes_are_announced_to_every_handle() {
        let store = WebKeyValueStore::new();
        let other_handle = store.clone();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let subscription = other_handle.subscribe(Rc::new(move |change: &StoreChange| {
            sink.borrow_mut().push(change.clone());
        }));

        block_on(store.set("k", &json!({"a": 1}))).expect("set");
        block_on(store.remove("k")).expect("remove");
        subscription.cancel();
        block_on(store.set("k", &json!(2))).expect("set after cancel");

        assert_eq!(
            *seen.borrow(),
            vec![StoreChange {
                key: "k".to_string(),
                old_value: None,
                new_value: Some(json!({"a": 1})),
            }]
        );
    }

    #[test]
    fn native_builds_read_nothing() {
        let store = WebKeyValueStore::new();
        let store_obj: &dyn KeyValueStore = &store;
        assert_eq!(block_on(store_obj.get("k")), Ok(None));
        assert_eq!(store.load_raw("k"), Ok(None));
    }
}
