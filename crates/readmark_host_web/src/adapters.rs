use readmark_host::{
    BroadcastCallback, BroadcastFuture, Broadcaster, ChangeCallback, KeyValueStore,
    MemoryBroadcastHub, MemoryBroadcaster, MemoryKeyValueStore, StoreError, StoreFuture,
    Subscription,
};
use serde_json::Value;

use crate::{WebBroadcaster, WebKeyValueStore, DEFAULT_CHANNEL_NAME};

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Compile-time selected host strategy for `readmark_host_web` adapters.
pub enum HostStrategy {
    /// `localStorage` and `BroadcastChannel` adapters.
    Browser,
    /// Process-local in-memory adapters for native harnesses and previews.
    InMemory,
}

/// Returns the compile-time selected host strategy for the active build.
pub const fn selected_host_strategy() -> HostStrategy {
    #[cfg(feature = "in-memory-host")]
    {
        HostStrategy::InMemory
    }

    #[cfg(not(feature = "in-memory-host"))]
    {
        HostStrategy::Browser
    }
}

/// Returns the selected host strategy as a stable string token.
pub fn host_strategy_name() -> &'static str {
    match selected_host_strategy() {
        HostStrategy::Browser => "browser",
        HostStrategy::InMemory => "in-memory",
    }
}

thread_local! {
    static IN_MEMORY_STORE: MemoryKeyValueStore = MemoryKeyValueStore::new();
    static IN_MEMORY_HUB: MemoryBroadcastHub = MemoryBroadcastHub::new();
}

/// Adapter enum that erases the concrete store backend behind [`KeyValueStore`].
#[derive(Debug, Clone)]
pub enum KeyValueStoreAdapter {
    /// Browser `localStorage` persistence.
    Browser(WebKeyValueStore),
    /// Process-local store shared by every adapter created on this thread.
    InMemory(MemoryKeyValueStore),
}

impl KeyValueStore for KeyValueStoreAdapter {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Result<Option<Value>, StoreError>> {
        match self {
            Self::Browser(store) => store.get(key),
            Self::InMemory(store) => store.get(key),
        }
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a Value,
    ) -> StoreFuture<'a, Result<(), StoreError>> {
        match self {
            Self::Browser(store) => store.set(key, value),
            Self::InMemory(store) => store.set(key, value),
        }
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Result<(), StoreError>> {
        match self {
            Self::Browser(store) => store.remove(key),
            Self::InMemory(store) => store.remove(key),
        }
    }

    fn subscribe(&self, callback: ChangeCallback) -> Subscription {
        match self {
            Self::Browser(store) => store.subscribe(callback),
            Self::InMemory(store) => store.subscribe(callback),
        }
    }
}

/// Adapter enum that erases the concrete messaging backend behind [`Broadcaster`].
#[derive(Debug, Clone)]
pub enum BroadcasterAdapter {
    /// Browser `BroadcastChannel` messaging.
    Browser(WebBroadcaster),
    /// Endpoint on the process-local hub.
    InMemory(MemoryBroadcaster),
}

impl Broadcaster for BroadcasterAdapter {
    fn publish<'a>(&'a self, message: &'a Value) -> BroadcastFuture<'a, Result<(), StoreError>> {
        match self {
            Self::Browser(broadcaster) => broadcaster.publish(message),
            Self::InMemory(broadcaster) => broadcaster.publish(message),
        }
    }

    fn subscribe(&self, callback: BroadcastCallback) -> Subscription {
        match self {
            Self::Browser(broadcaster) => broadcaster.subscribe(callback),
            Self::InMemory(broadcaster) => broadcaster.subscribe(callback),
        }
    }
}

/// Builds the persistent store adapter for the selected host strategy.
pub fn key_value_store() -> KeyValueStoreAdapter {
    match selected_host_strategy() {
        HostStrategy::Browser => KeyValueStoreAdapter::Browser(WebKeyValueStore::new()),
        HostStrategy::InMemory => {
            KeyValueStoreAdapter::InMemory(IN_MEMORY_STORE.with(|store| store.clone()))
        }
    }
}

/// Builds the broadcaster for the selected host strategy on the default channel.
pub fn broadcaster() -> BroadcasterAdapter {
    broadcaster_on(DEFAULT_CHANNEL_NAME)
}

/// Builds the broadcaster for the selected host strategy on `channel_name`.
///
/// The in-memory strategy has a single hub, so `channel_name` only applies to the browser.
pub fn broadcaster_on(channel_name: &str) -> BroadcasterAdapter {
    match selected_host_strategy() {
        HostStrategy::Browser => BroadcasterAdapter::Browser(WebBroadcaster::open(channel_name)),
        HostStrategy::InMemory => {
            BroadcasterAdapter::InMemory(IN_MEMORY_HUB.with(MemoryBroadcastHub::endpoint))
        }
    }
}
