//! Cancellation handle returned by change-feed and broadcast subscriptions.

use std::fmt;

/// Live registration with a change feed; cancelled explicitly or when dropped.
#[must_use = "dropping a subscription cancels it immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// Creates a subscription that runs `cancel` exactly once when cancelled or dropped.
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Creates a subscription with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Cancels the registration now.
    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
