//! Cross-context state cache and synchronization layer for the readmark extension.
//!
//! Each extension context (popup, settings surface, background worker) builds its own
//! [`ContextStateBundle`] over the shared [`readmark_host::KeyValueStore`] and
//! [`readmark_host::Broadcaster`]. Writes are applied locally first, broadcast to sibling
//! contexts, then persisted; changes observed from other contexts go through the same
//! change-detecting update path, so listeners only fire when a value actually changed.
//!
//! The [`cache`] module holds the bounded TTL/LRU cache used for record collections. Everything
//! here runs on a single logical thread per context and holds no global state.

#![warn(missing_docs, rustdoc::broken_intra_doc_links)]

mod bundle;
pub mod cache;
mod config;
mod configuration;
mod error;
mod model;
mod services;
mod session;
pub mod sync;

pub use bundle::ContextStateBundle;
pub use cache::{
    BoundedTtlCache, CacheStats, CachedCollection, EvictionCause, EvictionHook, OperationSerializer,
    RecencyEntry, Ticket,
};
pub use config::{
    ConfigError, SyncConfig, DEFAULT_RECORD_CACHE_CAPACITY, DEFAULT_RECORD_CACHE_TTL_SECS,
};
pub use configuration::{ConfigurationState, PreferencesSummary};
pub use error::{CollectionError, SyncError};
pub use model::{
    ContentRecord, Preferences, ReadStatus, Session, SyncedState, UserProfile,
    MAX_SYNC_INTERVAL_SECS, MIN_SYNC_INTERVAL_SECS,
};
pub use services::SyncServices;
pub use session::{SessionState, SessionSummary};
pub use sync::{
    ContextId, Lifecycle, ListenerId, StateListener, StateSummary, StateSynchronizer, SyncMessage,
};
