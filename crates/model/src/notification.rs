//! Audit record of outbound notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationOutcome {
    Sent,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationLogEntry {
    pub id: Uuid,
    pub order_id: Option<Uuid>,
    pub kind: String,
    pub recipient: String,
    pub outcome: NotificationOutcome,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
