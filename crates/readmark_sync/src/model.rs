//! Typed payloads persisted in the shared store and validated on every load.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Value that can be kept in sync across contexts through a [`crate::StateSynchronizer`].
///
/// Equality must be structural: two contexts decode the same stored JSON into distinct
/// instances and must still consider them equal.
pub trait SyncedState: Clone + PartialEq + Serialize + DeserializeOwned + 'static {
    /// Rejects decoded values that violate domain rules.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the value must not be accepted.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl SyncedState for Value {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Identity of the signed-in user.
pub struct UserProfile {
    /// Backend user id.
    pub id: String,
    /// Account email, when the backend shares it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Name shown in the popup header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
/// Authentication session shared by every context.
pub enum Session {
    /// The user explicitly signed out or never signed in.
    Anonymous,
    /// A backend session is active.
    Authenticated {
        /// Bearer token for backend calls.
        token: String,
        /// Signed-in user.
        user: UserProfile,
        /// Token expiry in unix milliseconds, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at_ms: Option<u64>,
    },
}

impl Session {
    /// Returns the signed-in user, if any.
    pub fn user(&self) -> Option<&UserProfile> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated { user, .. } => Some(user),
        }
    }

    /// Returns whether the token is known to have expired at `now_ms`.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        match self {
            Self::Anonymous => false,
            Self::Authenticated { expires_at_ms, .. } => {
                expires_at_ms.is_some_and(|expires_at_ms| now_ms >= expires_at_ms)
            }
        }
    }
}

impl SyncedState for Session {
    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Anonymous => Ok(()),
            Self::Authenticated { token, user, .. } => {
                if token.trim().is_empty() {
                    return Err("authenticated session has an empty token".to_string());
                }
                if user.id.trim().is_empty() {
                    return Err("authenticated session has an empty user id".to_string());
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Read-status tag attached to a visited page.
pub enum ReadStatus {
    /// Saved but not opened yet.
    #[default]
    Unread,
    /// Opened, not finished.
    Reading,
    /// Finished.
    Read,
}

/// Shortest accepted background sync interval.
pub const MIN_SYNC_INTERVAL_SECS: u64 = 30;
/// Longest accepted background sync interval.
pub const MAX_SYNC_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// User configuration edited on the settings surface.
pub struct Preferences {
    /// Backend the records are synced with.
    pub api_base_url: String,
    /// Status given to newly tagged pages.
    pub default_status: ReadStatus,
    /// Tag pages automatically when they are visited.
    pub auto_tag_on_visit: bool,
    /// Show the unread count on the toolbar badge.
    pub show_badge: bool,
    /// Background sync period.
    pub sync_interval_secs: u64,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.readmark.app".to_string(),
            default_status: ReadStatus::Unread,
            auto_tag_on_visit: false,
            show_badge: true,
            sync_interval_secs: 300,
        }
    }
}

impl SyncedState for Preferences {
    fn validate(&self) -> Result<(), String> {
        if !(self.api_base_url.starts_with("https://") || self.api_base_url.starts_with("http://"))
        {
            return Err(format!(
                "api_base_url must be an http(s) URL, got `{}`",
                self.api_base_url
            ));
        }
        if !(MIN_SYNC_INTERVAL_SECS..=MAX_SYNC_INTERVAL_SECS).contains(&self.sync_interval_secs) {
            return Err(format!(
                "sync_interval_secs must be within {MIN_SYNC_INTERVAL_SECS}..={MAX_SYNC_INTERVAL_SECS}, got {}",
                self.sync_interval_secs
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One tagged page as returned by the backend.
pub struct ContentRecord {
    /// Page URL.
    pub url: String,
    /// Page title at tagging time.
    #[serde(default)]
    pub title: String,
    /// Current read status.
    pub status: ReadStatus,
    /// Last status change in unix milliseconds.
    #[serde(default)]
    pub updated_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn session_serialization_shape_is_tagged() {
        let session = Session::Authenticated {
            token: "t".to_string(),
            user: UserProfile {
                id: "1".to_string(),
                email: None,
                display_name: Some("Ada".to_string()),
            },
            expires_at_ms: None,
        };
        assert_eq!(
            serde_json::to_value(&session).expect("serialize"),
            json!({"status": "authenticated", "token": "t", "user": {"id": "1", "display_name": "Ada"}})
        );
        assert_eq!(
            serde_json::to_value(Session::Anonymous).expect("serialize"),
            json!({"status": "anonymous"})
        );
    }

    #[test]
    fn session_validation_rejects_blank_credentials() {
        let blank = Session::Authenticated {
            token: " ".to_string(),
            user: UserProfile {
                id: "1".to_string(),
                email: None,
                display_name: None,
            },
            expires_at_ms: None,
        };
        assert!(blank.validate().is_err());
        assert!(Session::Anonymous.validate().is_ok());
    }

    #[test]
    fn session_expiry_is_inclusive() {
        let session = Session::Authenticated {
            token: "t".to_string(),
            user: UserProfile {
                id: "1".to_string(),
                email: None,
                display_name: None,
            },
            expires_at_ms: Some(100),
        };
        assert!(!session.is_expired_at(99));
        assert!(session.is_expired_at(100));
        assert!(!Session::Anonymous.is_expired_at(u64::MAX));
    }

    #[test]
    fn preferences_fill_missing_fields_with_defaults() {
        let prefs: Preferences =
            serde_json::from_value(json!({"show_badge": false})).expect("decode");
        assert_eq!(
            prefs,
            Preferences {
                show_badge: false,
                ..Preferences::default()
            }
        );
        assert!(prefs.validate().is_ok());
    }

    #[test]
    fn preferences_validation_checks_url_and_interval() {
        let bad_url = Preferences {
            api_base_url: "ftp://example.com".to_string(),
            ..Preferences::default()
        };
        assert!(bad_url.validate().is_err());
        let too_fast = Preferences {
            sync_interval_secs: 1,
            ..Preferences::default()
        };
        assert!(too_fast.validate().is_err());
    }

    #[test]
    fn content_record_status_uses_snake_case() {
        let record: ContentRecord =
            serde_json::from_value(json!({"url": "https://a.example", "status": "reading"}))
                .expect("decode");
        assert_eq!(record.status, ReadStatus::Reading);
        assert_eq!(record.title, "");
    }
}
