use super::model::{DeliveryLog, DueItem};
use crate::error::SchedulerError;
use crate::model::{
    Account, Content, ContentStatus, ItemStatus, Notification, NotificationKind, Page,
    PageAssignment, ScheduledItem, TimeSlot,
};
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

type Result<T> = std::result::Result<T, SchedulerError>;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rel), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rel),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| SchedulerError::Db(sqlx::Error::Migrate(Box::new(e))))?;
    Ok(())
}

// ---- accounts and pages ----

#[instrument(skip_all)]
pub async fn create_account(
    pool: &Pool,
    display_name: &str,
    credential_ref: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO accounts (display_name, credential_ref) VALUES (?, ?) RETURNING id",
    )
    .bind(display_name)
    .bind(credential_ref)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn get_account(pool: &Pool, id: i64) -> Result<Account> {
    let row = sqlx::query(
        "SELECT id, display_name, credential_ref, created_at FROM accounts WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| SchedulerError::NotFound(format!("account {}", id)))?;
    Ok(Account {
        id: row.get("id"),
        display_name: row.get("display_name"),
        credential_ref: row.try_get("credential_ref").ok(),
        created_at: row.get("created_at"),
    })
}

#[instrument(skip_all)]
pub async fn create_page(pool: &Pool, external_id: &str, name: &str) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO pages (external_id, name) VALUES (?, ?) RETURNING id")
        .bind(external_id)
        .bind(name)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn get_page(pool: &Pool, id: i64) -> Result<Page> {
    let row =
        sqlx::query("SELECT id, external_id, name, is_active, created_at FROM pages WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("page {}", id)))?;
    Ok(page_from_row(&row))
}

pub async fn list_pages(pool: &Pool, active_only: bool) -> Result<Vec<Page>> {
    let rows = sqlx::query(
        "SELECT id, external_id, name, is_active, created_at FROM pages \
         WHERE (?1 = 0 OR is_active = 1) ORDER BY id ASC",
    )
    .bind(active_only)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(page_from_row).collect())
}

fn page_from_row(row: &SqliteRow) -> Page {
    Page {
        id: row.get("id"),
        external_id: row.get("external_id"),
        name: row.get("name"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    }
}

/// Deactivate a page and collect the ids of its still-pending items, in one
/// transaction. The caller emits one warning notification per item.
#[instrument(skip_all)]
pub async fn deactivate_page(pool: &Pool, page_id: i64) -> Result<Vec<i64>> {
    let mut tx = pool.begin().await?;
    let updated = sqlx::query("UPDATE pages SET is_active = 0 WHERE id = ?")
        .bind(page_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(SchedulerError::NotFound(format!("page {}", page_id)));
    }
    let pending: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM scheduled_items WHERE page_id = ? AND status = 'pending' ORDER BY id",
    )
    .bind(page_id)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(pending)
}

// ---- page assignments ----

/// Assign a page to an account. The first assignment of a page always
/// becomes primary; assigning with `is_primary = true` swaps the primary in
/// the same transaction so the page never observes zero or two primaries.
#[instrument(skip_all)]
pub async fn assign_page(pool: &Pool, page_id: i64, account_id: i64, is_primary: bool) -> Result<()> {
    let mut tx = pool.begin().await?;
    let make_primary = if is_primary {
        sqlx::query("UPDATE page_assignments SET is_primary = 0 WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;
        true
    } else {
        let has_primary: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM page_assignments WHERE page_id = ? AND is_primary = 1",
        )
        .bind(page_id)
        .fetch_optional(&mut *tx)
        .await?;
        has_primary.is_none()
    };
    sqlx::query(
        "INSERT INTO page_assignments (page_id, account_id, is_primary) VALUES (?, ?, ?) \
         ON CONFLICT (page_id, account_id) \
         DO UPDATE SET is_primary = MAX(page_assignments.is_primary, excluded.is_primary)",
    )
    .bind(page_id)
    .bind(account_id)
    .bind(make_primary)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Swap the primary assignment of a page in a single transaction.
#[instrument(skip_all)]
pub async fn set_primary_assignment(pool: &Pool, page_id: i64, account_id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE page_assignments SET is_primary = 0 WHERE page_id = ?")
        .bind(page_id)
        .execute(&mut *tx)
        .await?;
    let updated = sqlx::query(
        "UPDATE page_assignments SET is_primary = 1 WHERE page_id = ? AND account_id = ?",
    )
    .bind(page_id)
    .bind(account_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(SchedulerError::NotFound(format!(
            "assignment of page {} to account {}",
            page_id, account_id
        )));
    }
    tx.commit().await?;
    Ok(())
}

/// Remove an assignment. When the removed assignment was the primary, the
/// lowest remaining account id is promoted so the invariant holds.
#[instrument(skip_all)]
pub async fn unassign_page(pool: &Pool, page_id: i64, account_id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    let was_primary: Option<bool> = sqlx::query_scalar(
        "SELECT is_primary FROM page_assignments WHERE page_id = ? AND account_id = ?",
    )
    .bind(page_id)
    .bind(account_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(was_primary) = was_primary else {
        return Err(SchedulerError::NotFound(format!(
            "assignment of page {} to account {}",
            page_id, account_id
        )));
    };
    sqlx::query("DELETE FROM page_assignments WHERE page_id = ? AND account_id = ?")
        .bind(page_id)
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
    if was_primary {
        sqlx::query(
            "UPDATE page_assignments SET is_primary = 1 WHERE id = \
             (SELECT id FROM page_assignments WHERE page_id = ? ORDER BY account_id ASC LIMIT 1)",
        )
        .bind(page_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn assignments_for_page(pool: &Pool, page_id: i64) -> Result<Vec<PageAssignment>> {
    let rows = sqlx::query(
        "SELECT id, page_id, account_id, is_primary FROM page_assignments \
         WHERE page_id = ? ORDER BY is_primary DESC, account_id ASC",
    )
    .bind(page_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| PageAssignment {
            id: row.get("id"),
            page_id: row.get("page_id"),
            account_id: row.get("account_id"),
            is_primary: row.get("is_primary"),
        })
        .collect())
}

pub async fn primary_account_for_page(pool: &Pool, page_id: i64) -> Result<Option<Account>> {
    let row = sqlx::query(
        "SELECT a.id, a.display_name, a.credential_ref, a.created_at \
         FROM accounts a \
         JOIN page_assignments pa ON pa.account_id = a.id \
         WHERE pa.page_id = ? AND pa.is_primary = 1",
    )
    .bind(page_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| Account {
        id: row.get("id"),
        display_name: row.get("display_name"),
        credential_ref: row.try_get("credential_ref").ok(),
        created_at: row.get("created_at"),
    }))
}

// ---- time slots ----

#[instrument(skip_all)]
pub async fn create_time_slot(
    pool: &Pool,
    page_id: i64,
    day_of_week: u8,
    time_of_day: NaiveTime,
    recurring: bool,
) -> Result<i64> {
    if day_of_week > 6 {
        return Err(SchedulerError::Validation(format!(
            "day_of_week {} out of range 0..=6",
            day_of_week
        )));
    }
    let rec = sqlx::query(
        "INSERT INTO time_slots (page_id, day_of_week, time_of_day, recurring) \
         VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(page_id)
    .bind(day_of_week as i64)
    .bind(time_of_day.format("%H:%M").to_string())
    .bind(recurring)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn delete_time_slot(pool: &Pool, id: i64) -> Result<()> {
    let deleted = sqlx::query("DELETE FROM time_slots WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(SchedulerError::NotFound(format!("time slot {}", id)));
    }
    Ok(())
}

pub async fn slots_for_page(pool: &Pool, page_id: i64) -> Result<Vec<TimeSlot>> {
    let rows = sqlx::query(
        "SELECT id, page_id, day_of_week, time_of_day, recurring FROM time_slots \
         WHERE page_id = ? ORDER BY day_of_week, time_of_day",
    )
    .bind(page_id)
    .fetch_all(pool)
    .await?;
    let mut slots = Vec::with_capacity(rows.len());
    for row in rows {
        let raw: String = row.get("time_of_day");
        let time_of_day = NaiveTime::parse_from_str(&raw, "%H:%M")
            .map_err(|_| SchedulerError::Validation(format!("bad time_of_day {:?}", raw)))?;
        slots.push(TimeSlot {
            id: row.get("id"),
            page_id: row.get("page_id"),
            day_of_week: row.get::<i64, _>("day_of_week") as u8,
            time_of_day,
            recurring: row.get("recurring"),
        });
    }
    Ok(slots)
}

// ---- contents ----

#[instrument(skip_all)]
pub async fn create_content(pool: &Pool, body: &str, media_refs: &[String]) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO contents (body, media_refs) VALUES (?, ?) RETURNING id")
        .bind(body)
        .bind(serde_json::to_string(media_refs).unwrap_or_else(|_| "[]".into()))
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn get_content(pool: &Pool, id: i64) -> Result<Content> {
    let row = sqlx::query("SELECT id, body, media_refs, status, created_at FROM contents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| SchedulerError::NotFound(format!("content {}", id)))?;
    content_from_row(&row)
}

fn content_from_row(row: &SqliteRow) -> Result<Content> {
    let status_raw: String = row.get("status");
    let status = ContentStatus::parse(&status_raw)
        .ok_or_else(|| SchedulerError::Validation(format!("unknown content status {:?}", status_raw)))?;
    let media_raw: String = row.get("media_refs");
    Ok(Content {
        id: row.get("id"),
        body: row.get("body"),
        media_refs: serde_json::from_str(&media_raw).unwrap_or_default(),
        status,
        created_at: row.get("created_at"),
    })
}

/// Edit a content's body and media. Rejected once any referencing scheduled
/// item has left `pending`, so in-flight or delivered posts stay immutable.
#[instrument(skip_all)]
pub async fn update_content(pool: &Pool, id: i64, body: &str, media_refs: &[String]) -> Result<()> {
    let mut tx = pool.begin().await?;
    let locked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM scheduled_items WHERE content_id = ? AND status != 'pending'",
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;
    if locked > 0 {
        return Err(SchedulerError::Conflict(format!(
            "content {} is referenced by {} non-pending items",
            id, locked
        )));
    }
    let updated = sqlx::query("UPDATE contents SET body = ?, media_refs = ? WHERE id = ?")
        .bind(body)
        .bind(serde_json::to_string(media_refs).unwrap_or_else(|_| "[]".into()))
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(SchedulerError::NotFound(format!("content {}", id)));
    }
    tx.commit().await?;
    Ok(())
}

pub async fn set_content_status(pool: &Pool, id: i64, status: ContentStatus) -> Result<()> {
    sqlx::query("UPDATE contents SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Move a draft content to `scheduled` as part of a confirm transaction.
/// A content that is already scheduled or published is left untouched.
pub async fn mark_content_scheduled_tx(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<()> {
    sqlx::query("UPDATE contents SET status = 'scheduled' WHERE id = ? AND status = 'draft'")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Mark a content published. Returns true only for the first delivery that
/// flips it, so the caller can act once per content.
pub async fn mark_content_published(pool: &Pool, id: i64) -> Result<bool> {
    let updated = sqlx::query("UPDATE contents SET status = 'published' WHERE id = ? AND status != 'published'")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(updated > 0)
}

// ---- scheduled items ----

/// Optional field updates applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub retry_count: Option<i32>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub external_post_id: Option<String>,
    pub last_error: Option<String>,
}

#[instrument(skip_all)]
pub async fn insert_scheduled_item(
    pool: &Pool,
    content_id: i64,
    page_id: i64,
    scheduled_time: DateTime<Utc>,
    max_retries: i32,
    last_error: Option<&str>,
) -> Result<ScheduledItem> {
    if scheduled_time <= Utc::now() {
        return Err(SchedulerError::Validation(format!(
            "scheduled_time {} is in the past",
            scheduled_time
        )));
    }
    let mut tx = pool.begin().await?;
    let item = insert_scheduled_item_tx(&mut tx, content_id, page_id, scheduled_time, max_retries, last_error).await?;
    tx.commit().await?;
    Ok(item)
}

pub async fn insert_scheduled_item_tx(
    tx: &mut Transaction<'_, Sqlite>,
    content_id: i64,
    page_id: i64,
    scheduled_time: DateTime<Utc>,
    max_retries: i32,
    last_error: Option<&str>,
) -> Result<ScheduledItem> {
    let row = sqlx::query(
        "INSERT INTO scheduled_items (content_id, page_id, scheduled_time, max_retries, last_error) \
         VALUES (?, ?, ?, ?, ?) \
         RETURNING id, content_id, page_id, scheduled_time, status, retry_count, max_retries, \
                   external_post_id, last_error, created_at, updated_at",
    )
    .bind(content_id)
    .bind(page_id)
    .bind(scheduled_time)
    .bind(max_retries)
    .bind(last_error)
    .fetch_one(&mut **tx)
    .await?;
    item_from_row(&row)
}

pub async fn get_scheduled_item(pool: &Pool, id: i64) -> Result<ScheduledItem> {
    let row = sqlx::query(
        "SELECT id, content_id, page_id, scheduled_time, status, retry_count, max_retries, \
                external_post_id, last_error, created_at, updated_at \
         FROM scheduled_items WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| SchedulerError::NotFound(format!("scheduled item {}", id)))?;
    item_from_row(&row)
}

fn item_from_row(row: &SqliteRow) -> Result<ScheduledItem> {
    let status_raw: String = row.get("status");
    let status = ItemStatus::parse(&status_raw)
        .ok_or_else(|| SchedulerError::Validation(format!("unknown item status {:?}", status_raw)))?;
    Ok(ScheduledItem {
        id: row.get("id"),
        content_id: row.get("content_id"),
        page_id: row.get("page_id"),
        scheduled_time: row.get("scheduled_time"),
        status,
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        external_post_id: row.try_get("external_post_id").ok(),
        last_error: row.try_get("last_error").ok(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Conditionally move an item from `expected` to `new_status`, applying
/// `fields` in the same statement. Returns false when the stored status no
/// longer matches `expected` (the compare-and-swap lost). This is the only
/// mutation path for item status, which is what keeps concurrent dispatch
/// cycles and manual deletes from stepping on each other.
#[instrument(skip_all, fields(item = id, from = expected.as_str(), to = new_status.as_str()))]
pub async fn transition(
    pool: &Pool,
    id: i64,
    expected: ItemStatus,
    new_status: ItemStatus,
    fields: TransitionFields,
) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE scheduled_items SET \
             status = ?, \
             retry_count = COALESCE(?, retry_count), \
             scheduled_time = COALESCE(?, scheduled_time), \
             external_post_id = COALESCE(?, external_post_id), \
             last_error = COALESCE(?, last_error), \
             updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = ?",
    )
    .bind(new_status.as_str())
    .bind(fields.retry_count)
    .bind(fields.scheduled_time)
    .bind(fields.external_post_id)
    .bind(fields.last_error)
    .bind(id)
    .bind(expected.as_str())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

#[instrument(skip_all)]
pub async fn due_pending_items(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<DueItem>> {
    let rows = sqlx::query(
        "SELECT si.id, si.content_id, si.page_id, si.scheduled_time, si.retry_count, \
                si.max_retries, c.body, c.media_refs, p.external_id AS page_external_id \
         FROM scheduled_items si \
         JOIN contents c ON c.id = si.content_id \
         JOIN pages p ON p.id = si.page_id \
         WHERE si.status = 'pending' AND datetime(si.scheduled_time) <= datetime(?) \
           AND p.is_active = 1 \
         ORDER BY datetime(si.scheduled_time) ASC, si.id ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let media_raw: String = row.get("media_refs");
            DueItem {
                id: row.get("id"),
                content_id: row.get("content_id"),
                page_id: row.get("page_id"),
                scheduled_time: row.get("scheduled_time"),
                retry_count: row.get("retry_count"),
                max_retries: row.get("max_retries"),
                body: row.get("body"),
                media_refs: serde_json::from_str(&media_raw).unwrap_or_default(),
                page_external_id: row.get("page_external_id"),
            }
        })
        .collect())
}

/// List items filtered by status and/or page, paginated with a stable order:
/// creation time ascending, ties broken by id.
pub async fn list_scheduled_items(
    pool: &Pool,
    status: Option<ItemStatus>,
    page_id: Option<i64>,
    limit: i64,
    offset: i64,
) -> Result<Vec<ScheduledItem>> {
    let rows = sqlx::query(
        "SELECT id, content_id, page_id, scheduled_time, status, retry_count, max_retries, \
                external_post_id, last_error, created_at, updated_at \
         FROM scheduled_items \
         WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR page_id = ?2) \
         ORDER BY datetime(created_at) ASC, id ASC \
         LIMIT ?3 OFFSET ?4",
    )
    .bind(status.map(|s| s.as_str()))
    .bind(page_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.iter().map(item_from_row).collect()
}

/// Delivery times of a page's items that still occupy their slot: pending,
/// in flight, or already delivered.
pub async fn active_times_for_page(pool: &Pool, page_id: i64) -> Result<Vec<DateTime<Utc>>> {
    let times = sqlx::query_scalar(
        "SELECT scheduled_time FROM scheduled_items \
         WHERE page_id = ? AND status IN ('pending', 'publishing', 'success')",
    )
    .bind(page_id)
    .fetch_all(pool)
    .await?;
    Ok(times)
}

pub async fn active_item_for_content_page(
    pool: &Pool,
    content_id: i64,
    page_id: i64,
) -> Result<Option<ScheduledItem>> {
    let row = sqlx::query(
        "SELECT id, content_id, page_id, scheduled_time, status, retry_count, max_retries, \
                external_post_id, last_error, created_at, updated_at \
         FROM scheduled_items \
         WHERE content_id = ? AND page_id = ? AND status IN ('pending', 'publishing', 'success') \
         ORDER BY id ASC LIMIT 1",
    )
    .bind(content_id)
    .bind(page_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(item_from_row).transpose()
}

/// Delete an item, legal only while it is still `pending`. A concurrent
/// cycle that already claimed the item wins the race and the delete is
/// rejected with `Conflict`.
#[instrument(skip_all)]
pub async fn delete_scheduled_item(pool: &Pool, id: i64) -> Result<()> {
    let deleted = sqlx::query("DELETE FROM scheduled_items WHERE id = ? AND status = 'pending'")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if deleted == 1 {
        return Ok(());
    }
    let item = get_scheduled_item(pool, id).await?;
    Err(SchedulerError::Conflict(format!(
        "scheduled item {} is {}; retry the delete after the cycle completes",
        id,
        item.status.as_str()
    )))
}

/// Manual retry of a terminally failed item: back to `pending` with a fresh
/// attempt budget, treated as a new entry into the pipeline.
#[instrument(skip_all)]
pub async fn retry_failed_item(pool: &Pool, id: i64, now: DateTime<Utc>) -> Result<ScheduledItem> {
    let updated = sqlx::query(
        "UPDATE scheduled_items SET status = 'pending', retry_count = 0, scheduled_time = ?, \
             last_error = NULL, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = 'failed'",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        let item = get_scheduled_item(pool, id).await?;
        return Err(SchedulerError::InvalidState(format!(
            "scheduled item {} is {}, only failed items can be retried",
            id,
            item.status.as_str()
        )));
    }
    get_scheduled_item(pool, id).await
}

/// Move items stuck in `publishing` since before `cutoff` back to `pending`.
/// Bounds the blast radius of a worker that died mid-publish.
#[instrument(skip_all)]
pub async fn reclaim_stuck_publishing(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let reclaimed = sqlx::query(
        "UPDATE scheduled_items SET status = 'pending', updated_at = CURRENT_TIMESTAMP \
         WHERE status = 'publishing' AND datetime(updated_at) <= datetime(?)",
    )
    .bind(cutoff)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(reclaimed)
}

// ---- notifications ----

#[instrument(skip_all)]
pub async fn insert_notification(
    pool: &Pool,
    kind: NotificationKind,
    payload: &serde_json::Value,
) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO notifications (kind, payload) VALUES (?, ?) RETURNING id")
        .bind(kind.as_str())
        .bind(payload.to_string())
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn unread_notification_count(pool: &Pool) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE is_read = 0")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn mark_notification_read(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_all_notifications_read(pool: &Pool) -> Result<()> {
    sqlx::query("UPDATE notifications SET is_read = 1")
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_notifications(pool: &Pool, limit: i64, offset: i64) -> Result<Vec<Notification>> {
    let rows = sqlx::query(
        "SELECT id, kind, payload, is_read, created_at FROM notifications \
         ORDER BY datetime(created_at) DESC, id DESC LIMIT ? OFFSET ?",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.iter().map(notification_from_row).collect()
}

pub async fn list_unread_notifications(pool: &Pool) -> Result<Vec<Notification>> {
    let rows = sqlx::query(
        "SELECT id, kind, payload, is_read, created_at FROM notifications \
         WHERE is_read = 0 ORDER BY datetime(created_at) DESC, id DESC LIMIT 50",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(notification_from_row).collect()
}

fn notification_from_row(row: &SqliteRow) -> Result<Notification> {
    let kind_raw: String = row.get("kind");
    let kind = NotificationKind::parse(&kind_raw)
        .ok_or_else(|| SchedulerError::Validation(format!("unknown notification kind {:?}", kind_raw)))?;
    let payload_raw: String = row.get("payload");
    Ok(Notification {
        id: row.get("id"),
        kind,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        is_read: row.get("is_read"),
        created_at: row.get("created_at"),
    })
}

#[instrument(skip_all)]
pub async fn prune_notifications_before(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let pruned = sqlx::query("DELETE FROM notifications WHERE datetime(created_at) <= datetime(?)")
        .bind(cutoff)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(pruned)
}

// ---- delivery logs ----

#[instrument(skip_all)]
pub async fn insert_delivery_log(
    pool: &Pool,
    scheduled_item_id: i64,
    page_id: i64,
    status: &str,
    external_post_id: Option<&str>,
    error_message: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO delivery_logs (scheduled_item_id, page_id, status, external_post_id, error_message) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(scheduled_item_id)
    .bind(page_id)
    .bind(status)
    .bind(external_post_id)
    .bind(error_message)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn delivery_logs_for_item(pool: &Pool, scheduled_item_id: i64) -> Result<Vec<DeliveryLog>> {
    let rows = sqlx::query(
        "SELECT id, scheduled_item_id, page_id, status, external_post_id, error_message, created_at \
         FROM delivery_logs WHERE scheduled_item_id = ? ORDER BY id DESC",
    )
    .bind(scheduled_item_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| DeliveryLog {
            id: row.get("id"),
            scheduled_item_id: row.get("scheduled_item_id"),
            page_id: row.get("page_id"),
            status: row.get("status"),
            external_post_id: row.try_get("external_post_id").ok(),
            error_message: row.try_get("error_message").ok(),
            created_at: row.get("created_at"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_pool() -> (Pool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/repo.db?mode=rwc", dir.path().display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (pool, dir)
    }

    #[tokio::test]
    async fn transition_is_conditional() {
        let (pool, _dir) = setup_pool().await;
        let content = create_content(&pool, "hello", &[]).await.unwrap();
        let page = create_page(&pool, "ext-1", "Page One").await.unwrap();
        let item = insert_scheduled_item(&pool, content, page, Utc::now() + Duration::hours(1), 3, None)
            .await
            .unwrap();
        assert_eq!(item.status, ItemStatus::Pending);

        let ok = transition(&pool, item.id, ItemStatus::Pending, ItemStatus::Publishing, TransitionFields::default())
            .await
            .unwrap();
        assert!(ok);

        // Second claim with the same expectation loses.
        let ok = transition(&pool, item.id, ItemStatus::Pending, ItemStatus::Publishing, TransitionFields::default())
            .await
            .unwrap();
        assert!(!ok);

        let ok = transition(
            &pool,
            item.id,
            ItemStatus::Publishing,
            ItemStatus::Success,
            TransitionFields {
                external_post_id: Some("post-9".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(ok);

        let stored = get_scheduled_item(&pool, item.id).await.unwrap();
        assert_eq!(stored.status, ItemStatus::Success);
        assert_eq!(stored.external_post_id.as_deref(), Some("post-9"));
    }

    #[tokio::test]
    async fn delete_rejected_once_claimed() {
        let (pool, _dir) = setup_pool().await;
        let content = create_content(&pool, "hello", &[]).await.unwrap();
        let page = create_page(&pool, "ext-2", "Page Two").await.unwrap();
        let item = insert_scheduled_item(&pool, content, page, Utc::now() + Duration::hours(1), 3, None)
            .await
            .unwrap();

        transition(&pool, item.id, ItemStatus::Pending, ItemStatus::Publishing, TransitionFields::default())
            .await
            .unwrap();
        let err = delete_scheduled_item(&pool, item.id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));
    }
}
