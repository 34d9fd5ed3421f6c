//! In-process caching primitives: the operation serializer, the bounded TTL cache, and the
//! owner-keyed collection cache built on it.

mod bounded;
mod collection;
mod serializer;

pub use bounded::{BoundedTtlCache, CacheStats, EvictionCause, EvictionHook, RecencyEntry};
pub use collection::CachedCollection;
pub use serializer::{OperationSerializer, Ticket};
