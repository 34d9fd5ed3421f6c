//! Time helpers and the injectable clock used by caches and synchronizers.

use std::{cell::Cell, rc::Rc, time::Duration};
#[cfg(not(target_arch = "wasm32"))]
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current unix timestamp in milliseconds.
pub fn unix_time_ms_now() -> u64 {
    #[cfg(target_arch = "wasm32")]
    {
        js_sys::Date::now().max(0.0) as u64
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Source of unix millisecond timestamps.
pub trait Clock {
    /// Returns the current time in unix milliseconds.
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
/// Wall clock backed by [`unix_time_ms_now`].
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        unix_time_ms_now()
    }
}

#[derive(Debug, Clone, Default)]
/// Manually driven clock for deterministic tests; clones share the same time.
pub struct ManualClock {
    now_ms: Rc<Cell<u64>>,
}

impl ManualClock {
    /// Creates a clock frozen at `now_ms`.
    pub fn starting_at(now_ms: u64) -> Self {
        Self {
            now_ms: Rc::new(Cell::new(now_ms)),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let step = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now_ms.set(self.now_ms.get().saturating_add(step));
    }

    /// Jumps the clock to an absolute time.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.set(now_ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }
}
