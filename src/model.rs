use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a scheduled item. Transitions go through the store's
/// compare-and-swap `transition`; `Success` and `Failed` are terminal apart
/// from an explicit manual retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Publishing,
    Success,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Publishing => "publishing",
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "publishing" => Some(ItemStatus::Publishing),
            "success" => Some(ItemStatus::Success),
            "failed" => Some(ItemStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Draft,
    Scheduled,
    Published,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Draft => "draft",
            ContentStatus::Scheduled => "scheduled",
            ContentStatus::Published => "published",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ContentStatus::Draft),
            "scheduled" => Some(ContentStatus::Scheduled),
            "published" => Some(ContentStatus::Published),
            _ => None,
        }
    }
}

/// Classification of a publish failure. Permanent failures are never
/// retried; transient ones are retried until the attempt budget runs out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PublishSucceeded,
    PublishFailed,
    PageDeactivated,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PublishSucceeded => "publish_succeeded",
            NotificationKind::PublishFailed => "publish_failed",
            NotificationKind::PageDeactivated => "page_deactivated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publish_succeeded" => Some(NotificationKind::PublishSucceeded),
            "publish_failed" => Some(NotificationKind::PublishFailed),
            "page_deactivated" => Some(NotificationKind::PageDeactivated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub display_name: String,
    pub credential_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: i64,
    pub external_id: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageAssignment {
    pub id: i64,
    pub page_id: i64,
    pub account_id: i64,
    pub is_primary: bool,
}

/// A recurring posting window for a page. `day_of_week` runs 0 = Monday
/// through 6 = Sunday. A non-recurring slot applies only to the first
/// matching weekday on or after the requested date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: i64,
    pub page_id: i64,
    pub day_of_week: u8,
    pub time_of_day: NaiveTime,
    pub recurring: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub id: i64,
    pub body: String,
    pub media_refs: Vec<String>,
    pub status: ContentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledItem {
    pub id: i64,
    pub content_id: i64,
    pub page_id: i64,
    pub scheduled_time: DateTime<Utc>,
    pub status: ItemStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub external_post_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}
