//! `BroadcastChannel`-backed implementation of [`readmark_host::Broadcaster`].

use std::fmt;

use readmark_host::{BroadcastCallback, BroadcastFuture, Broadcaster, StoreError, Subscription};
use serde_json::Value;

/// Channel name shared by every context of the extension.
pub const DEFAULT_CHANNEL_NAME: &str = "readmark.sync";

#[derive(Clone)]
/// Direct messaging between contexts over a named `BroadcastChannel`.
///
/// Messages travel as JSON text. A channel object never receives its own posts, so publishing
/// and subscribing through the same handle gives no self-delivery.
pub struct WebBroadcaster {
    name: String,
    #[cfg(target_arch = "wasm32")]
    channel: Option<web_sys::BroadcastChannel>,
}

impl fmt::Debug for WebBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebBroadcaster")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

impl WebBroadcaster {
    /// Opens the channel `name`; an unsupported environment yields a closed broadcaster.
    pub fn open(name: &str) -> Self {
        #[cfg(target_arch = "wasm32")]
        {
            let channel = match web_sys::BroadcastChannel::new(name) {
                Ok(channel) => Some(channel),
                Err(err) => {
                    tracing::warn!(channel = name, error = ?err, "BroadcastChannel unavailable");
                    None
                }
            };
            Self {
                name: name.to_string(),
                channel,
            }
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            Self {
                name: name.to_string(),
            }
        }
    }

    /// Returns the channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether the underlying channel could be opened.
    pub fn is_open(&self) -> bool {
        #[cfg(target_arch = "wasm32")]
        {
            self.channel.is_some()
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            false
        }
    }

    fn post(&self, message: &Value) -> Result<(), StoreError> {
        let raw =
            serde_json::to_string(message).map_err(|e| StoreError::NotSerializable(e.to_string()))?;

        #[cfg(target_arch = "wasm32")]
        {
            let channel = self.channel.as_ref().ok_or_else(|| {
                StoreError::Unavailable(format!("channel `{}` is not open", self.name))
            })?;
            channel
                .post_message(&wasm_bindgen::JsValue::from_str(&raw))
                .map_err(|e| StoreError::Backend(format!("post_message failed: {e:?}")))
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = raw;
            Err(StoreError::NoReceivers)
        }
    }
}

impl Broadcaster for WebBroadcaster {
    fn publish<'a>(&'a self, message: &'a Value) -> BroadcastFuture<'a, Result<(), StoreError>> {
        Box::pin(async move { self.post(message) })
    }

    fn subscribe(&self, callback: BroadcastCallback) -> Subscription {
        #[cfg(target_arch = "wasm32")]
        {
            use wasm_bindgen::{closure::Closure, JsCast};

            let Some(channel) = self.channel.clone() else {
                return Subscription::noop();
            };
            let channel_name = self.name.clone();
            let on_message = Closure::<dyn FnMut(web_sys::MessageEvent)>::wrap(Box::new(
                move |event: web_sys::MessageEvent| {
                    let Some(raw) = event.data().as_string() else {
                        return;
                    };
                    match serde_json::from_str::<Value>(&raw) {
                        Ok(message) => callback(&message),
                        Err(err) => {
                            tracing::debug!(channel = %channel_name, error = %err, "ignoring non-JSON message");
                        }
                    }
                },
            ));
            if let Err(err) = channel
                .add_event_listener_with_callback("message", on_message.as_ref().unchecked_ref())
            {
                tracing::warn!(channel = %self.name, error = ?err, "could not listen on channel");
                return Subscription::noop();
            }
            Subscription::new(move || {
                let _ = channel.remove_event_listener_with_callback(
                    "message",
                    on_message.as_ref().unchecked_ref(),
                );
                drop(on_message);
            })
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = callback;
            Subscription::noop()
        }
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use std::rc::Rc;

    use futures::executor::block_on;
    use serde_json::json;

    use super::*;

    #[test]
    fn native_builds_have_a_closed_channel_with_no_receivers() {
        let broadcaster = WebBroadcaster::open(DEFAULT_CHANNEL_NAME);
        assert_eq!(broadcaster.name(), DEFAULT_CHANNEL_NAME);
        assert!(!broadcaster.is_open());
        drop(broadcaster.subscribe(Rc::new(|_: &Value| {})));
        let err = block_on(broadcaster.publish(&json!({"type": "state_changed"})))
            .expect_err("nobody listens natively");
        assert!(err.is_no_receivers());
    }
}
