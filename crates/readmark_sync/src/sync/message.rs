//! Wire format of direct cross-context notifications.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// Name of an isolated execution context (popup, settings page, background worker).
pub struct ContextId(String);

impl ContextId {
    /// Creates a context id from any name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Toolbar popup surface.
    pub fn popup() -> Self {
        Self::new("popup")
    }

    /// Settings surface.
    pub fn options() -> Self {
        Self::new("options")
    }

    /// Long-lived background worker.
    pub fn background() -> Self {
        Self::new("background")
    }

    /// Returns the context name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Message exchanged over the [`readmark_host::Broadcaster`].
pub enum SyncMessage {
    /// A synchronized field changed in `origin`.
    StateChanged {
        /// Store key of the field.
        key: String,
        /// Context that made the change.
        origin: ContextId,
        /// New value, `None` when cleared.
        value: Option<Value>,
    },
}

impl SyncMessage {
    /// Decodes a broadcast payload; anything that is not a sync message yields `None`.
    pub fn from_value(message: &Value) -> Option<Self> {
        Self::deserialize(message).ok()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn message_wire_shape_is_stable() {
        let message = SyncMessage::StateChanged {
            key: "readmark.session".to_string(),
            origin: ContextId::popup(),
            value: Some(json!({"status": "anonymous"})),
        };
        let wire = serde_json::to_value(&message).expect("serialize");
        assert_eq!(
            wire,
            json!({
                "type": "state_changed",
                "key": "readmark.session",
                "origin": "popup",
                "value": {"status": "anonymous"}
            })
        );
        assert_eq!(SyncMessage::from_value(&wire), Some(message));
    }

    #[test]
    fn foreign_messages_are_ignored() {
        assert_eq!(SyncMessage::from_value(&json!({"type": "open_tab"})), None);
        assert_eq!(SyncMessage::from_value(&json!("hello")), None);
    }

    #[test]
    fn cleared_value_round_trips_as_null() {
        let wire = json!({"type": "state_changed", "key": "k", "origin": "options", "value": null});
        assert_eq!(
            SyncMessage::from_value(&wire),
            Some(SyncMessage::StateChanged {
                key: "k".to_string(),
                origin: ContextId::options(),
                value: None,
            })
        );
    }
}
