//! Host services injected into every synchronizer of one context.

use std::{fmt, rc::Rc};

use readmark_host::{
    Broadcaster, Clock, KeyValueStore, MemoryBroadcastHub, MemoryKeyValueStore, SystemClock,
};

use crate::ContextId;

#[derive(Clone)]
/// Store, broadcast channel, and clock as seen from one context.
pub struct SyncServices {
    /// Context these services belong to.
    pub context: ContextId,
    /// Shared persistent store.
    pub store: Rc<dyn KeyValueStore>,
    /// Direct channel to sibling contexts.
    pub broadcaster: Rc<dyn Broadcaster>,
    /// Time source for cache expiry and session checks.
    pub clock: Rc<dyn Clock>,
}

impl SyncServices {
    /// Bundles explicit service implementations.
    pub fn new(
        context: ContextId,
        store: Rc<dyn KeyValueStore>,
        broadcaster: Rc<dyn Broadcaster>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        Self {
            context,
            store,
            broadcaster,
            clock,
        }
    }

    /// Attaches a context to an in-memory store and hub, using the wall clock.
    ///
    /// Calling this once per simulated context with clones of the same store and hub gives
    /// contexts that share storage and can message each other.
    pub fn in_memory(context: ContextId, store: &MemoryKeyValueStore, hub: &MemoryBroadcastHub) -> Self {
        Self::new(
            context,
            Rc::new(store.clone()),
            Rc::new(hub.endpoint()),
            Rc::new(SystemClock),
        )
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl fmt::Debug for SyncServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncServices")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
