//! Notification emitter: the only writer of user-visible events. Rows are
//! append-only; the read flag is the single mutable bit.

use crate::db::{self, Pool};
use crate::error::SchedulerError;
use crate::model::{Notification, NotificationKind};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, instrument};

/// Days a notification is kept before pruning removes it.
const RETENTION_DAYS: i64 = 30;

#[instrument(skip_all)]
pub async fn publish_succeeded(
    pool: &Pool,
    scheduled_item_id: i64,
    content_id: i64,
    page_id: i64,
    external_post_id: &str,
) -> Result<i64, SchedulerError> {
    let payload = json!({
        "scheduled_item_id": scheduled_item_id,
        "content_id": content_id,
        "page_id": page_id,
        "external_post_id": external_post_id,
    });
    db::insert_notification(pool, NotificationKind::PublishSucceeded, &payload).await
}

#[instrument(skip_all)]
pub async fn publish_failed(
    pool: &Pool,
    scheduled_item_id: i64,
    content_id: i64,
    page_id: i64,
    error: &str,
) -> Result<i64, SchedulerError> {
    let payload = json!({
        "scheduled_item_id": scheduled_item_id,
        "content_id": content_id,
        "page_id": page_id,
        "error": error,
    });
    db::insert_notification(pool, NotificationKind::PublishFailed, &payload).await
}

/// Deactivate a page and record one warning per pending item stranded on
/// it. Returns the affected item ids.
#[instrument(skip_all)]
pub async fn page_deactivated(pool: &Pool, page_id: i64) -> Result<Vec<i64>, SchedulerError> {
    let pending = db::deactivate_page(pool, page_id).await?;
    for item_id in &pending {
        let payload = json!({
            "scheduled_item_id": item_id,
            "page_id": page_id,
            "warning": "page deactivated while item pending",
        });
        db::insert_notification(pool, NotificationKind::PageDeactivated, &payload).await?;
    }
    info!(page = page_id, stranded = pending.len(), "page deactivated");
    Ok(pending)
}

pub async fn unread_count(pool: &Pool) -> Result<i64, SchedulerError> {
    db::unread_notification_count(pool).await
}

pub async fn mark_read(pool: &Pool, id: i64) -> Result<(), SchedulerError> {
    db::mark_notification_read(pool, id).await
}

pub async fn mark_all_read(pool: &Pool) -> Result<(), SchedulerError> {
    db::mark_all_notifications_read(pool).await
}

pub async fn list(pool: &Pool, limit: i64, offset: i64) -> Result<Vec<Notification>, SchedulerError> {
    db::list_notifications(pool, limit, offset).await
}

pub async fn list_unread(pool: &Pool) -> Result<Vec<Notification>, SchedulerError> {
    db::list_unread_notifications(pool).await
}

/// Drop notifications past the retention window.
#[instrument(skip_all)]
pub async fn prune(pool: &Pool, now: DateTime<Utc>) -> Result<u64, SchedulerError> {
    db::prune_notifications_before(pool, now - Duration::days(RETENTION_DAYS)).await
}
