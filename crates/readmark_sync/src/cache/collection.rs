//! Per-owner cache of whole record collections.
//!
//! Collections are cached wholesale, one entry per owner, and must be invalidated whenever any
//! record of that owner changes. The cache never loads anything itself.

use std::{rc::Rc, time::Duration};

use readmark_host::Clock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::bounded::{BoundedTtlCache, CacheStats};
use crate::error::CollectionError;

/// Owner-keyed cache of record collections.
pub struct CachedCollection<T> {
    cache: BoundedTtlCache<String, Vec<T>>,
    ttl: Duration,
}

impl<T> Clone for CachedCollection<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            ttl: self.ttl,
        }
    }
}

impl<T> std::fmt::Debug for CachedCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedCollection")
            .field("cache", &self.cache)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<T: Clone + 'static> CachedCollection<T> {
    /// Creates a cache for up to `capacity` owners, each entry living for `ttl`.
    pub fn new(capacity: usize, ttl: Duration, clock: Rc<dyn Clock>) -> Self {
        Self {
            cache: BoundedTtlCache::new(capacity, clock),
            ttl,
        }
    }

    /// Returns the cached collection for `owner_id`.
    ///
    /// `Some(vec![])` means "loaded and empty"; `None` means "not loaded".
    pub fn get(&self, owner_id: &str) -> Option<Vec<T>> {
        self.cache.get(&owner_id.to_string())
    }

    /// Caches `collection` for `owner_id`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError::EmptyOwnerId`] when `owner_id` is blank.
    pub fn set(&self, owner_id: &str, collection: Vec<T>) -> Result<(), CollectionError> {
        let owner_id = validate_owner_id(owner_id)?;
        debug!(owner = owner_id, records = collection.len(), "caching collection");
        self.cache.set(owner_id.to_string(), collection, self.ttl);
        Ok(())
    }

    /// Drops the cached collection for `owner_id`.
    pub fn invalidate(&self, owner_id: &str) {
        self.cache.remove(&owner_id.to_string());
    }

    /// Drops every cached collection.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    /// Returns owners with a resident entry, least recently used first.
    pub fn owners(&self) -> Vec<String> {
        self.cache.stats().keys
    }

    /// Returns the underlying cache statistics.
    pub fn stats(&self) -> CacheStats<String> {
        self.cache.stats()
    }
}

impl<T: Clone + DeserializeOwned + 'static> CachedCollection<T> {
    /// Caches a collection received as raw JSON.
    ///
    /// # Errors
    ///
    /// Rejects blank owner ids, payloads that are not arrays (including `null`), and arrays whose
    /// items do not decode as `T`.
    pub fn set_json(&self, owner_id: &str, collection: Value) -> Result<(), CollectionError> {
        validate_owner_id(owner_id)?;
        if !collection.is_array() {
            return Err(CollectionError::NotACollection {
                found: json_kind(&collection),
            });
        }
        let records = serde_json::from_value::<Vec<T>>(collection)
            .map_err(|e| CollectionError::Decode(e.to_string()))?;
        self.set(owner_id, records)
    }
}

fn validate_owner_id(owner_id: &str) -> Result<&str, CollectionError> {
    if owner_id.trim().is_empty() {
        return Err(CollectionError::EmptyOwnerId);
    }
    Ok(owner_id)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
