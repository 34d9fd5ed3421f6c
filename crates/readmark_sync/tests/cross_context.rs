use std::cell::RefCell;
use std::rc::Rc;

use futures::executor::block_on;
use futures::FutureExt;
use pretty_assertions::assert_eq;
use readmark_host::{
    MemoryBroadcastHub, MemoryKeyValueStore, StoreError, PREFERENCES_KEY, SESSION_KEY,
};
use readmark_sync::{
    ContextId, ContextStateBundle, Session, StateSynchronizer, SyncConfig, SyncError,
    SyncMessage, SyncServices, UserProfile,
};
use serde_json::{json, Value};

fn bundle(context: ContextId, store: &MemoryKeyValueStore, hub: &MemoryBroadcastHub) -> ContextStateBundle {
    let config = SyncConfig::for_context(context);
    ContextStateBundle::new(
        SyncServices::in_memory(config.context.clone(), store, hub),
        &config,
    )
}

fn user(id: &str) -> UserProfile {
    UserProfile {
        id: id.to_string(),
        email: None,
        display_name: None,
    }
}

#[test]
fn session_write_is_persisted_broadcast_and_deduplicated() {
    let store = MemoryKeyValueStore::new();
    let hub = MemoryBroadcastHub::new();
    let services = SyncServices::in_memory(ContextId::popup(), &store, &hub);
    let session = StateSynchronizer::<Value>::new(SESSION_KEY, &services);
    let calls = Rc::new(RefCell::new(Vec::new()));
    let sink = calls.clone();
    session.add_listener(move |value| sink.borrow_mut().push(value.cloned()));

    block_on(session.initialize()).expect("initialize");
    assert_eq!(block_on(session.get_value()), Ok(None));
    assert!(session.summary().initialized);

    let payload = json!({"user": {"id": "1"}});
    block_on(session.set_value(payload.clone())).expect("set");
    assert_eq!(store.write_log(), vec![(SESSION_KEY.to_string(), payload.clone())]);
    assert_eq!(hub.published().len(), 1);
    assert_eq!(
        SyncMessage::from_value(&hub.published()[0]),
        Some(SyncMessage::StateChanged {
            key: SESSION_KEY.to_string(),
            origin: ContextId::popup(),
            value: Some(payload.clone()),
        })
    );
    assert_eq!(*calls.borrow(), vec![Some(payload.clone())]);

    store.apply_external(SESSION_KEY, Some(json!({"user": {"id": "1"}})));
    assert_eq!(calls.borrow().len(), 1);

    store.apply_external(SESSION_KEY, Some(json!({"user": {"id": "2"}})));
    assert_eq!(calls.borrow().len(), 2);
    assert_eq!(
        block_on(session.get_value()),
        Ok(Some(json!({"user": {"id": "2"}})))
    );
}

#[test]
fn sign_in_reaches_every_open_context() {
    let store = MemoryKeyValueStore::new();
    let hub = MemoryBroadcastHub::new();
    let popup = bundle(ContextId::popup(), &store, &hub);
    let options = bundle(ContextId::options(), &store, &hub);
    let background = bundle(ContextId::background(), &store, &hub);
    for context in [&popup, &options, &background] {
        block_on(context.initialize()).expect("initialize");
    }

    block_on(popup.session().sign_in("tok", user("u-9"), None)).expect("sign in");

    for context in [&options, &background] {
        assert_eq!(context.session().summary().user_id.as_deref(), Some("u-9"));
    }
    assert_eq!(store.call_counts().sets, 2, "schema stamp plus one session write");
}

#[test]
fn store_feed_alone_propagates_when_broadcasts_fail() {
    let store = MemoryKeyValueStore::new();
    let hub = MemoryBroadcastHub::new();
    let popup = bundle(ContextId::popup(), &store, &hub);
    let background = bundle(ContextId::background(), &store, &hub);
    block_on(popup.initialize()).expect("popup");
    block_on(background.initialize()).expect("background");

    hub.fail_next_publish(StoreError::Backend("channel closed".to_string()));
    block_on(background.configuration().update(|prefs| prefs.show_badge = false))
        .expect("write succeeds without broadcast");

    let prefs = block_on(popup.configuration().effective_preferences()).expect("prefs");
    assert!(!prefs.show_badge);
}

#[test]
fn late_context_loads_what_others_persisted() {
    let store = MemoryKeyValueStore::new();
    let hub = MemoryBroadcastHub::new();
    let options = bundle(ContextId::options(), &store, &hub);
    block_on(options.configuration().update(|prefs| prefs.auto_tag_on_visit = true))
        .expect("update");

    let popup = bundle(ContextId::popup(), &store, &hub);
    block_on(popup.initialize()).expect("initialize");

    assert!(store.peek(PREFERENCES_KEY).is_some());
    assert!(block_on(popup.configuration().effective_preferences())
        .expect("prefs")
        .auto_tag_on_visit);
}

#[test]
fn read_after_write_holds_while_the_store_is_stuck() {
    let store = MemoryKeyValueStore::new();
    let hub = MemoryBroadcastHub::new();
    let popup = bundle(ContextId::popup(), &store, &hub);
    let background = bundle(ContextId::background(), &store, &hub);
    block_on(popup.initialize()).expect("popup");
    block_on(background.initialize()).expect("background");
    store.hold_writes();

    let mut write = Box::pin(popup.session().sign_out());
    assert!((&mut write).now_or_never().is_none());

    assert_eq!(block_on(popup.session().session()), Ok(Some(Session::Anonymous)));
    // The broadcast already reached the sibling even though nothing is persisted yet.
    assert_eq!(
        block_on(background.session().session()),
        Ok(Some(Session::Anonymous))
    );
    assert_eq!(store.peek(SESSION_KEY), None);

    store.release_writes();
    block_on(write).expect("persisted after release");
    assert_eq!(store.peek(SESSION_KEY), Some(json!({"status": "anonymous"})));
}

#[test]
fn quota_rejection_surfaces_verbatim_and_keeps_the_local_value() {
    let store = MemoryKeyValueStore::new().with_quota(64);
    let hub = MemoryBroadcastHub::new();
    let popup = bundle(ContextId::popup(), &store, &hub);
    block_on(popup.initialize()).expect("initialize");

    let long_name = "x".repeat(128);
    let profile = UserProfile {
        id: "u-1".to_string(),
        email: None,
        display_name: Some(long_name.clone()),
    };
    let err = block_on(popup.session().sign_in("tok", profile, None)).expect_err("quota");

    assert!(matches!(
        err.store_error(),
        Some(StoreError::QuotaExceeded { quota: 64, .. })
    ));
    assert!(matches!(err, SyncError::Persist { .. }));
    assert_eq!(popup.session().summary().display_name, Some(long_name));
    assert_eq!(store.peek(SESSION_KEY), None);
}

#[test]
fn concurrent_first_reads_share_one_store_load() {
    let store = MemoryKeyValueStore::new();
    store.seed(SESSION_KEY, json!({"status": "anonymous"}));
    let hub = MemoryBroadcastHub::new();
    let popup = bundle(ContextId::popup(), &store, &hub);
    let session = popup.session();
    store.hold_reads();

    let (first, second, ()) = block_on(async {
        futures::join!(session.session(), session.session(), async {
            store.release_reads();
        })
    });

    assert_eq!(first, Ok(Some(Session::Anonymous)));
    assert_eq!(second, Ok(Some(Session::Anonymous)));
    assert_eq!(store.call_counts().gets, 1);
}
