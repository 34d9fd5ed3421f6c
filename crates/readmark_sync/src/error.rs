//! Error types surfaced to callers of the synchronization layer.
//!
//! Only failures that affect the caller's own request appear here. Broadcast and listener
//! failures are side-channel problems: they are logged where they happen and never returned.

use readmark_host::StoreError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Failures returned by [`crate::StateSynchronizer`] and the state bundles built on it.
pub enum SyncError {
    /// Reading the persisted value during initialization failed; the field stays uninitialized.
    #[error("failed to load `{key}`: {source}")]
    Load {
        /// Store key being loaded.
        key: String,
        /// Underlying store failure.
        #[source]
        source: StoreError,
    },
    /// Writing or removing the persisted value failed; the local value was kept.
    #[error("failed to persist `{key}`: {source}")]
    Persist {
        /// Store key being written.
        key: String,
        /// Underlying store failure, unchanged (for example a quota rejection).
        #[source]
        source: StoreError,
    },
    /// The value could not be converted to JSON for storage.
    #[error("value for `{key}` is not serializable: {reason}")]
    NotSerializable {
        /// Store key being written.
        key: String,
        /// Serializer diagnostic.
        reason: String,
    },
    /// A loaded or received payload failed to decode or validate.
    #[error("invalid payload for `{key}`: {reason}")]
    InvalidPayload {
        /// Store key the payload belongs to.
        key: String,
        /// Decoder or validation diagnostic.
        reason: String,
    },
    /// Persisted state was written by another layout version and must be migrated first.
    #[error("stored schema version {stored} does not match expected version {expected}")]
    SchemaMismatch {
        /// Version found in the store.
        stored: u32,
        /// Version this release expects.
        expected: u32,
    },
    /// The synchronizer was torn down and accepts no further work.
    #[error("synchronizer for `{key}` has been torn down")]
    TornDown {
        /// Store key of the torn-down field.
        key: String,
    },
}

impl SyncError {
    /// Returns the underlying store error for load and persist failures.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Load { source, .. } | Self::Persist { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Validation failures for [`crate::CachedCollection`] writes.
pub enum CollectionError {
    /// The owner id was empty or whitespace.
    #[error("owner id must not be empty")]
    EmptyOwnerId,
    /// The payload was not an array.
    #[error("expected an array of records, found {found}")]
    NotACollection {
        /// JSON kind actually received.
        found: &'static str,
    },
    /// An array item did not decode as a record.
    #[error("record collection did not decode: {0}")]
    Decode(String),
}
