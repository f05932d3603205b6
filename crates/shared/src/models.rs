//! Notification data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// --- Notifications ---

/// Severity of a notification as shown to the user.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// A single notification pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    #[serde(rename = "type", default)]
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// What happened to an existing notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Read,
    Deleted,
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateKind::Read => f.write_str("read"),
            UpdateKind::Deleted => f.write_str("deleted"),
        }
    }
}

// --- Identifiers ---

/// Identifiers arrive as either JSON strings or numbers depending on the
/// backend; normalize both to `String`.
#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

impl From<StringOrNumber> for String {
    fn from(value: StringOrNumber) -> Self {
        match value {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        }
    }
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    StringOrNumber::deserialize(deserializer).map(String::from)
}

pub(crate) fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<StringOrNumber>::deserialize(deserializer).map(|v| v.map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_accepts_numeric_ids() {
        let json = r#"{
            "id": 7,
            "userId": 42,
            "type": "warning",
            "title": "Deadline",
            "message": "Report due tomorrow",
            "isRead": false,
            "createdAt": "2024-03-01T10:00:00Z"
        }"#;

        let notification: Notification = serde_json::from_str(json).expect("valid notification");
        assert_eq!(notification.id, "7");
        assert_eq!(notification.user_id, "42");
        assert_eq!(notification.level, NotificationLevel::Warning);
        assert!(notification.read_at.is_none());
    }

    #[test]
    fn notification_level_defaults_to_info() {
        let json = r#"{
            "id": "n-1",
            "userId": "42",
            "title": "Hello",
            "message": "World",
            "createdAt": "2024-03-01T10:00:00Z"
        }"#;

        let notification: Notification = serde_json::from_str(json).expect("valid notification");
        assert_eq!(notification.level, NotificationLevel::Info);
        assert!(!notification.is_read);
    }

    #[test]
    fn update_kind_display() {
        assert_eq!(UpdateKind::Read.to_string(), "read");
        assert_eq!(UpdateKind::Deleted.to_string(), "deleted");
    }
}
