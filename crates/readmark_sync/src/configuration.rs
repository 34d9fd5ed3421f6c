//! User preferences shared by every context, plus the record cache they scope.

use std::{cell::RefCell, rc::Rc};

use readmark_host::PREFERENCES_KEY;
use tracing::debug;

use crate::{
    CachedCollection, ContentRecord, ListenerId, Preferences, StateSummary, StateSynchronizer,
    SyncConfig, SyncError, SyncServices,
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Side-effect-free view of the preferences field and its record cache.
pub struct PreferencesSummary {
    /// Whether preferences have been loaded from the store.
    pub initialized: bool,
    /// Whether the user saved preferences (as opposed to running on defaults).
    pub customized: bool,
    /// Backend in effect, defaulted when nothing is stored.
    pub api_base_url: String,
    /// Owners with a cached record collection.
    pub cached_owners: usize,
}

/// Synchronized preferences with an owner-keyed record cache.
///
/// Cached records belong to the backend named by `api_base_url`, so the whole record cache is
/// dropped whenever that URL changes in any context and when preferences are cleared.
#[derive(Clone, Debug)]
pub struct ConfigurationState {
    sync: StateSynchronizer<Preferences>,
    records: CachedCollection<ContentRecord>,
    invalidation_listener: ListenerId,
}

impl ConfigurationState {
    /// Binds the preferences key in the given context.
    pub fn new(services: &SyncServices, config: &SyncConfig) -> Self {
        let sync = StateSynchronizer::new(PREFERENCES_KEY, services);
        let records = CachedCollection::new(
            config.record_cache_capacity,
            config.record_cache_ttl(),
            services.clock.clone(),
        );

        let last_base_url = Rc::new(RefCell::new(None::<String>));
        let cache = records.clone();
        let invalidation_listener = sync.add_listener(move |prefs: Option<&Preferences>| {
            let next = prefs.map(|prefs| prefs.api_base_url.clone());
            let previous = last_base_url.replace(next.clone());
            if previous != next {
                debug!(previous = ?previous, next = ?next, "backend changed; dropping cached records");
                cache.invalidate_all();
            }
        });

        Self {
            sync,
            records,
            invalidation_listener,
        }
    }

    /// Returns the underlying synchronizer.
    pub fn synchronizer(&self) -> &StateSynchronizer<Preferences> {
        &self.sync
    }

    /// Loads the persisted preferences.
    ///
    /// # Errors
    ///
    /// See [`StateSynchronizer::initialize`].
    pub async fn initialize(&self) -> Result<(), SyncError> {
        self.sync.initialize().await
    }

    /// Returns the stored preferences; `None` when the user never saved any.
    ///
    /// # Errors
    ///
    /// See [`StateSynchronizer::get_value`].
    pub async fn preferences(&self) -> Result<Option<Preferences>, SyncError> {
        self.sync.get_value().await
    }

    /// Returns the stored preferences, or defaults when none are stored.
    ///
    /// # Errors
    ///
    /// See [`StateSynchronizer::get_value`].
    pub async fn effective_preferences(&self) -> Result<Preferences, SyncError> {
        Ok(self.preferences().await?.unwrap_or_default())
    }

    /// Replaces the stored preferences.
    ///
    /// # Errors
    ///
    /// See [`StateSynchronizer::set_value`].
    pub async fn set_preferences(&self, prefs: Preferences) -> Result<(), SyncError> {
        self.sync.set_value(prefs).await
    }

    /// Read-modify-write helper starting from the effective preferences.
    ///
    /// # Errors
    ///
    /// See [`StateSynchronizer::set_value`].
    pub async fn update(&self, edit: impl FnOnce(&mut Preferences)) -> Result<(), SyncError> {
        let mut prefs = self.effective_preferences().await?;
        edit(&mut prefs);
        self.sync.set_value(prefs).await
    }

    /// Removes stored preferences and drops every cached record collection.
    ///
    /// # Errors
    ///
    /// See [`StateSynchronizer::clear`].
    pub async fn clear(&self) -> Result<(), SyncError> {
        let cleared = self.sync.clear().await;
        self.records.invalidate_all();
        cleared
    }

    /// Returns the record cache scoped to the current backend.
    pub fn records(&self) -> &CachedCollection<ContentRecord> {
        &self.records
    }

    /// Registers a listener for preference changes.
    pub fn add_listener(&self, listener: impl Fn(Option<&Preferences>) + 'static) -> ListenerId {
        self.sync.add_listener(listener)
    }

    /// Unregisters a listener; the internal cache-invalidation listener cannot be removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        if id == self.invalidation_listener {
            return false;
        }
        self.sync.remove_listener(id)
    }

    /// Returns the generic field summary.
    pub fn state_summary(&self) -> StateSummary {
        self.sync.summary()
    }

    /// Returns a side-effect-free preferences summary.
    pub fn summary(&self) -> PreferencesSummary {
        let stored = self.sync.peek();
        PreferencesSummary {
            initialized: self.sync.is_initialized(),
            customized: stored.is_some(),
            api_base_url: stored.unwrap_or_default().api_base_url,
            cached_owners: self.records.stats().size,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use pretty_assertions::assert_eq;
    use readmark_host::{MemoryBroadcastHub, MemoryKeyValueStore};
    use serde_json::json;

    use super::*;
    use crate::{ContextId, ReadStatus};

    fn record(url: &str) -> ContentRecord {
        ContentRecord {
            url: url.to_string(),
            title: String::new(),
            status: ReadStatus::Unread,
            updated_at_ms: 0,
        }
    }

    fn configuration(
        context: ContextId,
        store: &MemoryKeyValueStore,
        hub: &MemoryBroadcastHub,
    ) -> ConfigurationState {
        ConfigurationState::new(
            &SyncServices::in_memory(context, store, hub),
            &SyncConfig::default(),
        )
    }

    #[test]
    fn effective_preferences_fall_back_to_defaults() {
        let store = MemoryKeyValueStore::new();
        let state = configuration(ContextId::options(), &store, &MemoryBroadcastHub::new());

        assert_eq!(block_on(state.preferences()), Ok(None));
        assert_eq!(block_on(state.effective_preferences()), Ok(Preferences::default()));
        let summary = state.summary();
        assert!(summary.initialized);
        assert!(!summary.customized);
        assert_eq!(summary.api_base_url, Preferences::default().api_base_url);
    }

    #[test]
    fn update_persists_the_edited_preferences() {
        let store = MemoryKeyValueStore::new();
        let state = configuration(ContextId::options(), &store, &MemoryBroadcastHub::new());

        block_on(state.update(|prefs| prefs.show_badge = false)).expect("update");

        assert_eq!(
            store.peek(PREFERENCES_KEY).expect("stored")["show_badge"],
            json!(false)
        );
        assert!(state.summary().customized);
    }

    #[test]
    fn invalid_update_is_rejected() {
        let store = MemoryKeyValueStore::new();
        let state = configuration(ContextId::options(), &store, &MemoryBroadcastHub::new());
        let err = block_on(state.update(|prefs| prefs.sync_interval_secs = 0)).expect_err("invalid");
        assert!(matches!(err, SyncError::InvalidPayload { .. }));
        assert_eq!(store.call_counts().sets, 0);
    }

    #[test]
    fn changing_the_backend_in_another_context_drops_cached_records() {
        let store = MemoryKeyValueStore::new();
        let hub = MemoryBroadcastHub::new();
        let options = configuration(ContextId::options(), &store, &hub);
        let popup = configuration(ContextId::popup(), &store, &hub);
        block_on(options.initialize()).expect("options");
        block_on(popup.initialize()).expect("popup");

        popup
            .records()
            .set("u-1", vec![record("https://a.example")])
            .expect("cache");
        block_on(options.update(|prefs| prefs.show_badge = false)).expect("unrelated edit");
        // First stored preferences carry the default URL, which counts as a change from "none".
        assert_eq!(popup.records().get("u-1"), None);

        popup
            .records()
            .set("u-1", vec![record("https://a.example")])
            .expect("cache");
        block_on(options.update(|prefs| prefs.auto_tag_on_visit = true)).expect("unrelated edit");
        assert!(popup.records().get("u-1").is_some());

        block_on(options.update(|prefs| prefs.api_base_url = "https://eu.readmark.app".to_string()))
            .expect("backend edit");
        assert_eq!(popup.records().get("u-1"), None);
        assert_eq!(popup.summary().api_base_url, "https://eu.readmark.app");
    }

    #[test]
    fn clear_drops_records_and_internal_listener_stays() {
        let store = MemoryKeyValueStore::new();
        let state = configuration(ContextId::options(), &store, &MemoryBroadcastHub::new());
        block_on(state.initialize()).expect("init");
        state
            .records()
            .set("u-1", Vec::new())
            .expect("cache empty collection");
        assert_eq!(state.records().get("u-1"), Some(Vec::new()));

        block_on(state.clear()).expect("clear");

        assert_eq!(state.records().get("u-1"), None);
        assert!(!state.remove_listener(state.invalidation_listener));
        assert_eq!(state.synchronizer().listener_count(), 1);
    }
}
