//! Browser (`wasm32`) implementations of [`readmark_host`] service contracts.
//!
//! `localStorage` provides the shared persistent store and its cross-document `storage` events;
//! a named `BroadcastChannel` provides direct context-to-context messaging. Native builds compile
//! inert stand-ins so the workspace can be tested without a browser, and the `in-memory-host`
//! feature swaps the adapter factories to process-local memory backends.

#![warn(missing_docs, rustdoc::broken_intra_doc_links)]

/// Compile-time host-strategy selection and concrete adapter factories for runtime wiring.
pub mod adapters;
pub mod broadcast_channel;
pub mod storage;

pub use adapters::{
    broadcaster, broadcaster_on, host_strategy_name, key_value_store, selected_host_strategy,
    BroadcasterAdapter, HostStrategy, KeyValueStoreAdapter,
};
pub use broadcast_channel::{WebBroadcaster, DEFAULT_CHANNEL_NAME};
pub use storage::local_store::{WebKeyValueStore, LOCAL_STORAGE_QUOTA_BYTES};
