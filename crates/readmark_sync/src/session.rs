//! Authentication session shared by every context.

use std::{fmt, rc::Rc};

use readmark_host::{Clock, SESSION_KEY};

use crate::{
    ListenerId, Session, StateSummary, StateSynchronizer, SyncError, SyncServices, UserProfile,
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Side-effect-free view of the session, for badges and headers.
pub struct SessionSummary {
    /// Whether the session has been loaded from the store.
    pub initialized: bool,
    /// Whether a non-expired authenticated session is present.
    pub authenticated: bool,
    /// Signed-in user id.
    pub user_id: Option<String>,
    /// Signed-in user's display name.
    pub display_name: Option<String>,
}

#[derive(Clone)]
/// Synchronized authentication session.
pub struct SessionState {
    sync: StateSynchronizer<Session>,
    clock: Rc<dyn Clock>,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

impl SessionState {
    /// Binds the session key in the given context.
    pub fn new(services: &SyncServices) -> Self {
        Self {
            sync: StateSynchronizer::new(SESSION_KEY, services),
            clock: services.clock.clone(),
        }
    }

    /// Returns the underlying synchronizer.
    pub fn synchronizer(&self) -> &StateSynchronizer<Session> {
        &self.sync
    }

    /// Loads the persisted session.
    ///
    /// # Errors
    ///
    /// See [`StateSynchronizer::initialize`].
    pub async fn initialize(&self) -> Result<(), SyncError> {
        self.sync.initialize().await
    }

    /// Returns the current session; `None` when nothing was ever stored.
    ///
    /// # Errors
    ///
    /// See [`StateSynchronizer::get_value`].
    pub async fn session(&self) -> Result<Option<Session>, SyncError> {
        self.sync.get_value().await
    }

    /// Stores an authenticated session for `user`.
    ///
    /// # Errors
    ///
    /// See [`StateSynchronizer::set_value`].
    pub async fn sign_in(
        &self,
        token: impl Into<String>,
        user: UserProfile,
        expires_at_ms: Option<u64>,
    ) -> Result<(), SyncError> {
        self.sync
            .set_value(Session::Authenticated {
                token: token.into(),
                user,
                expires_at_ms,
            })
            .await
    }

    /// Stores an explicit anonymous session.
    ///
    /// # Errors
    ///
    /// See [`StateSynchronizer::set_value`].
    pub async fn sign_out(&self) -> Result<(), SyncError> {
        self.sync.set_value(Session::Anonymous).await
    }

    /// Removes the session from the store entirely.
    ///
    /// # Errors
    ///
    /// See [`StateSynchronizer::clear`].
    pub async fn clear(&self) -> Result<(), SyncError> {
        self.sync.clear().await
    }

    /// Returns whether the locally known session is authenticated and not expired.
    pub fn is_authenticated_now(&self) -> bool {
        self.sync.peek().is_some_and(|session| {
            session.user().is_some() && !session.is_expired_at(self.clock.now_ms())
        })
    }

    /// Registers a listener for session changes.
    pub fn add_listener(&self, listener: impl Fn(Option<&Session>) + 'static) -> ListenerId {
        self.sync.add_listener(listener)
    }

    /// Unregisters a listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.sync.remove_listener(id)
    }

    /// Returns the generic field summary.
    pub fn state_summary(&self) -> StateSummary {
        self.sync.summary()
    }

    /// Returns a side-effect-free session summary.
    pub fn summary(&self) -> SessionSummary {
        let session = self.sync.peek();
        let user = session.as_ref().and_then(Session::user);
        SessionSummary {
            initialized: self.sync.is_initialized(),
            authenticated: self.is_authenticated_now(),
            user_id: user.map(|user| user.id.clone()),
            display_name: user.and_then(|user| user.display_name.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::executor::block_on;
    use pretty_assertions::assert_eq;
    use readmark_host::{ManualClock, MemoryBroadcastHub, MemoryKeyValueStore};
    use serde_json::json;

    use super::*;
    use crate::ContextId;

    fn ada() -> UserProfile {
        UserProfile {
            id: "u-1".to_string(),
            email: Some("ada@example.com".to_string()),
            display_name: Some("Ada".to_string()),
        }
    }

    fn session_state(store: &MemoryKeyValueStore, clock: &ManualClock) -> SessionState {
        let services = SyncServices::in_memory(ContextId::popup(), store, &MemoryBroadcastHub::new())
            .with_clock(Rc::new(clock.clone()));
        SessionState::new(&services)
    }

    #[test]
    fn sign_in_and_out_round_trip_through_the_store() {
        let store = MemoryKeyValueStore::new();
        let clock = ManualClock::starting_at(0);
        let state = session_state(&store, &clock);

        block_on(state.sign_in("tok", ada(), None)).expect("sign in");
        assert_eq!(
            state.summary(),
            SessionSummary {
                initialized: true,
                authenticated: true,
                user_id: Some("u-1".to_string()),
                display_name: Some("Ada".to_string()),
            }
        );
        assert_eq!(store.peek(SESSION_KEY).expect("stored")["status"], json!("authenticated"));

        block_on(state.sign_out()).expect("sign out");
        assert_eq!(store.peek(SESSION_KEY), Some(json!({"status": "anonymous"})));
        assert!(!state.summary().authenticated);
        assert_eq!(block_on(state.session()), Ok(Some(Session::Anonymous)));
    }

    #[test]
    fn expiry_is_evaluated_against_the_clock() {
        let store = MemoryKeyValueStore::new();
        let clock = ManualClock::starting_at(1_000);
        let state = session_state(&store, &clock);

        block_on(state.sign_in("tok", ada(), Some(2_000))).expect("sign in");
        assert!(state.is_authenticated_now());
        clock.advance(Duration::from_secs(1));
        assert!(!state.is_authenticated_now());
        assert_eq!(state.summary().user_id.as_deref(), Some("u-1"));
    }

    #[test]
    fn blank_token_is_rejected_before_anything_changes() {
        let store = MemoryKeyValueStore::new();
        let clock = ManualClock::starting_at(0);
        let state = session_state(&store, &clock);

        let err = block_on(state.sign_in(" ", ada(), None)).expect_err("invalid");
        assert!(matches!(err, SyncError::InvalidPayload { .. }));
        assert_eq!(store.call_counts().sets, 0);
        assert_eq!(block_on(state.session()), Ok(None));
    }

    #[test]
    fn clear_removes_the_key() {
        let store = MemoryKeyValueStore::new();
        store.seed(SESSION_KEY, json!({"status": "anonymous"}));
        let clock = ManualClock::starting_at(0);
        let state = session_state(&store, &clock);

        block_on(state.clear()).expect("clear");
        assert_eq!(store.peek(SESSION_KEY), None);
        assert!(!state.state_summary().present);
    }
}
