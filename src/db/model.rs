//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business
//! logic should live in higher layers.

use chrono::{DateTime, Utc};

/// Scheduled-item slice used by the dispatch worker: the item joined with
/// the content to publish and the page's external identifier.
#[derive(Debug, Clone)]
pub struct DueItem {
    pub id: i64,
    pub content_id: i64,
    pub page_id: i64,
    pub scheduled_time: DateTime<Utc>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub body: String,
    pub media_refs: Vec<String>,
    pub page_external_id: String,
}

/// One row of the per-attempt delivery audit trail.
#[derive(Debug, Clone)]
pub struct DeliveryLog {
    pub id: i64,
    pub scheduled_item_id: i64,
    pub page_id: i64,
    pub status: String,
    pub external_post_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}
