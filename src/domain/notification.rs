use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Success,
}

/// A user-visible event, bounded per-account ring, retained 7 days in the
/// durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub account_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: NotificationLevel,
    pub message: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}
