//! Error type shared by every host storage and messaging contract.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Failures reported by [`crate::KeyValueStore`] and [`crate::Broadcaster`] implementations.
pub enum StoreError {
    /// The serialized payload exceeds the store's per-item quota.
    #[error("payload for `{key}` is {bytes} bytes, exceeding the {quota} byte quota")]
    QuotaExceeded {
        /// Key the write targeted.
        key: String,
        /// Serialized payload size.
        bytes: usize,
        /// Maximum accepted payload size.
        quota: usize,
    },
    /// The payload cannot be represented in the store's wire format.
    #[error("payload is not serializable: {0}")]
    NotSerializable(String),
    /// A stored value exists but cannot be interpreted.
    #[error("stored value for `{key}` is corrupt: {reason}")]
    Corrupt {
        /// Key holding the unreadable value.
        key: String,
        /// Decoder diagnostic.
        reason: String,
    },
    /// The backing storage API is not reachable in this context.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// A broadcast found no other context listening.
    #[error("no receiving context is listening")]
    NoReceivers,
    /// Any other backend failure, carried as the host's own message.
    #[error("storage backend failed: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns whether this error only means "nobody else is currently listening".
    pub const fn is_no_receivers(&self) -> bool {
        matches!(self, Self::NoReceivers)
    }
}
