//! Typed host-domain contracts shared by the extension contexts and their storage adapters.
//!
//! This crate is the API-first boundary between the synchronization layer and whatever hosts it.
//! It exposes the persistent key-value store contract, the cross-context broadcast capability,
//! the clock abstraction, the persisted key layout, and in-memory/no-op adapters used by native
//! builds and tests. Concrete browser adapters live in `readmark_host_web`.

#![warn(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod broadcast;
pub mod error;
pub mod storage;
pub mod subscription;
pub mod time;

pub use broadcast::{
    BroadcastCallback, BroadcastFuture, Broadcaster, MemoryBroadcastHub, MemoryBroadcaster,
    NoopBroadcaster,
};
pub use error::StoreError;
pub use storage::key_value::{
    load_typed_with, save_typed_with, ChangeCallback, KeyValueStore, MemoryKeyValueStore,
    NoopKeyValueStore, StoreCallCounts, StoreChange, StoreFuture,
};
pub use storage::schema::{
    check_schema_version, mark_schema_current, SchemaStatus, CURRENT_SCHEMA_VERSION,
    PREFERENCES_KEY, SCHEMA_VERSION_KEY, SESSION_KEY,
};
pub use subscription::Subscription;
pub use time::{unix_time_ms_now, Clock, ManualClock, SystemClock};
