//! Composition of every synchronized field one context needs.

use futures::future::try_join;
use readmark_host::{
    check_schema_version, mark_schema_current, SchemaStatus, SCHEMA_VERSION_KEY,
};
use tracing::{debug, warn};

use crate::{ConfigurationState, ContextId, SessionState, SyncConfig, SyncError, SyncServices};

/// Session and preferences state for one context, built from one set of services.
#[derive(Clone, Debug)]
pub struct ContextStateBundle {
    services: SyncServices,
    session: SessionState,
    configuration: ConfigurationState,
}

impl ContextStateBundle {
    /// Builds the session and preferences fields on `services`.
    pub fn new(services: SyncServices, config: &SyncConfig) -> Self {
        let session = SessionState::new(&services);
        let configuration = ConfigurationState::new(&services, config);
        Self {
            services,
            session,
            configuration,
        }
    }

    /// Returns the context this bundle belongs to.
    pub fn context(&self) -> &ContextId {
        &self.services.context
    }

    /// Returns the injected services.
    pub fn services(&self) -> &SyncServices {
        &self.services
    }

    /// Returns the session field.
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Returns the preferences field and record cache.
    pub fn configuration(&self) -> &ConfigurationState {
        &self.configuration
    }

    /// Checks the stored schema version, then loads every field.
    ///
    /// A fresh store is stamped with the current schema version first.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SchemaMismatch`] while a migration is pending, [`SyncError::Load`]
    /// when the version cannot be read, or the first field initialization error.
    pub async fn initialize(&self) -> Result<(), SyncError> {
        let store = self.services.store.as_ref();
        let status = check_schema_version(store)
            .await
            .map_err(|source| SyncError::Load {
                key: SCHEMA_VERSION_KEY.to_string(),
                source,
            })?;
        match status {
            SchemaStatus::Current => {}
            SchemaStatus::Fresh => {
                if let Err(err) = mark_schema_current(store).await {
                    // Loading still works; the stamp is retried on the next start.
                    warn!(context = %self.services.context, error = %err, "could not record schema version");
                }
            }
            SchemaStatus::NeedsMigration { stored, expected } => {
                warn!(context = %self.services.context, stored, expected, "persisted state needs migration");
                return Err(SyncError::SchemaMismatch { stored, expected });
            }
        }

        try_join(self.session.initialize(), self.configuration.initialize()).await?;
        debug!(context = %self.services.context, "context state ready");
        Ok(())
    }

    /// Tears down every field; the bundle accepts no further work.
    pub fn teardown(&self) {
        self.session.synchronizer().teardown();
        self.configuration.synchronizer().teardown();
        debug!(context = %self.services.context, "context state torn down");
    }
}
