//! Cross-context synchronization of individual store keys.

mod message;
mod synchronizer;

pub use message::{ContextId, SyncMessage};
pub use synchronizer::{Lifecycle, ListenerId, StateListener, StateSummary, StateSynchronizer};
