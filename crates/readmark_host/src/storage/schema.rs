//! Persisted key layout and the stored schema-version gate.
//!
//! Keys are stable across releases. The schema version tells the composition root whether an
//! external migration routine has to run before cached state loaded from the store is trusted.

use crate::{load_typed_with, save_typed_with, KeyValueStore, StoreError};

/// Key holding the authentication session blob.
pub const SESSION_KEY: &str = "readmark.session";
/// Key holding the user-preferences blob.
pub const PREFERENCES_KEY: &str = "readmark.preferences";
/// Key holding the integer layout version of the persisted blobs.
pub const SCHEMA_VERSION_KEY: &str = "readmark.schema_version";
/// Layout version written by this release.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of comparing the stored schema version with [`CURRENT_SCHEMA_VERSION`].
pub enum SchemaStatus {
    /// No version recorded yet (fresh install).
    Fresh,
    /// Stored version matches this release.
    Current,
    /// Stored data was written by another layout version.
    NeedsMigration {
        /// Version found in the store.
        stored: u32,
        /// Version this release expects.
        expected: u32,
    },
}

impl SchemaStatus {
    /// Returns whether persisted state can be loaded as-is.
    pub const fn is_trusted(self) -> bool {
        matches!(self, Self::Fresh | Self::Current)
    }
}

/// Reads the stored schema version and classifies it.
///
/// # Errors
///
/// Returns the store error on read failure, or [`StoreError::Corrupt`] when the stored value is
/// not a non-negative integer that fits in `u32`.
pub async fn check_schema_version<S: KeyValueStore + ?Sized>(
    store: &S,
) -> Result<SchemaStatus, StoreError> {
    let Some(stored) = load_typed_with::<_, u32>(store, SCHEMA_VERSION_KEY).await? else {
        return Ok(SchemaStatus::Fresh);
    };
    if stored == CURRENT_SCHEMA_VERSION {
        Ok(SchemaStatus::Current)
    } else {
        Ok(SchemaStatus::NeedsMigration {
            stored,
            expected: CURRENT_SCHEMA_VERSION,
        })
    }
}

/// Records [`CURRENT_SCHEMA_VERSION`] as the stored layout version.
///
/// # Errors
///
/// Returns the store's write error.
pub async fn mark_schema_current<S: KeyValueStore + ?Sized>(store: &S) -> Result<(), StoreError> {
    save_typed_with(store, SCHEMA_VERSION_KEY, &CURRENT_SCHEMA_VERSION).await
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use serde_json::json;

    use super::*;
    use crate::MemoryKeyValueStore;

    #[test]
    fn missing_version_is_fresh_and_marking_makes_it_current() {
        let store = MemoryKeyValueStore::new();
        assert_eq!(block_on(check_schema_version(&store)), Ok(SchemaStatus::Fresh));
        block_on(mark_schema_current(&store)).expect("mark");
        assert_eq!(store.peek(SCHEMA_VERSION_KEY), Some(json!(1)));
        assert_eq!(block_on(check_schema_version(&store)), Ok(SchemaStatus::Current));
    }

    #[test]
    fn other_versions_need_migration() {
        let store = MemoryKeyValueStore::new();
        store.seed(SCHEMA_VERSION_KEY, json!(0));
        let status = block_on(check_schema_version(&store)).expect("status");
        assert_eq!(
            status,
            SchemaStatus::NeedsMigration {
                stored: 0,
                expected: CURRENT_SCHEMA_VERSION
            }
        );
        assert!(!status.is_trusted());
    }

    #[test]
    fn non_integer_version_is_corrupt() {
        let store = MemoryKeyValueStore::new();
        for raw in [json!("one"), json!(-1), json!(u64::from(u32::MAX) + 1)] {
            store.seed(SCHEMA_VERSION_KEY, raw.clone());
            assert!(
                matches!(
                    block_on(check_schema_version(&store)),
                    Err(StoreError::Corrupt { ref key, .. }) if key == SCHEMA_VERSION_KEY
                ),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn keys_are_distinct() {
        assert_ne!(SESSION_KEY, PREFERENCES_KEY);
        assert_ne!(PREFERENCES_KEY, SCHEMA_VERSION_KEY);
    }
}
