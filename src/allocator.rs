//! Slot allocation: turns "publish this content to these pages around this
//! date" into collision-free delivery times.
//!
//! `preview` computes candidate times without persisting anything; `confirm`
//! recomputes and persists. A candidate is marked `conflict` when earlier
//! slots had to be skipped because existing items occupied them, which is
//! the signal that the store changed since the caller last previewed.

use crate::config::Config;
use crate::db::{self, Pool};
use crate::error::SchedulerError;
use crate::model::ScheduledItem;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub collision_window: Duration,
    pub lookahead_days: u32,
    pub default_slot_times: Vec<NaiveTime>,
    pub max_retries: i32,
}

impl AllocatorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            collision_window: Duration::minutes(cfg.scheduler.collision_window_minutes),
            lookahead_days: cfg.scheduler.lookahead_days,
            default_slot_times: cfg.default_slot_times(),
            max_retries: cfg.scheduler.max_retries,
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            collision_window: Duration::minutes(30),
            lookahead_days: 14,
            default_slot_times: vec![
                NaiveTime::from_hms_opt(9, 0, 0).expect("valid time"),
                NaiveTime::from_hms_opt(13, 0, 0).expect("valid time"),
                NaiveTime::from_hms_opt(19, 0, 0).expect("valid time"),
            ],
            max_retries: 3,
        }
    }
}

/// One allocation result per requested page, ordered by time then page id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub page_id: i64,
    pub candidate_time: DateTime<Utc>,
    pub conflict: bool,
}

struct PageAllocation {
    page_id: i64,
    existing: Option<ScheduledItem>,
    candidate_time: DateTime<Utc>,
    conflict: bool,
}

/// Compute candidate delivery times for a content across pages. Pure read;
/// running it twice against an unchanged store yields the same sequence.
#[instrument(skip_all, fields(content = content_id))]
pub async fn preview(
    pool: &Pool,
    cfg: &AllocatorConfig,
    content_id: i64,
    page_ids: &[i64],
    preferred_date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<Vec<Candidate>, SchedulerError> {
    let allocations = allocate(pool, cfg, content_id, page_ids, preferred_date, now).await?;
    Ok(allocations
        .into_iter()
        .map(|a| Candidate {
            page_id: a.page_id,
            candidate_time: a.candidate_time,
            conflict: a.conflict,
        })
        .collect())
}

/// Recompute the allocation and persist one pending item per page.
///
/// With `force = false` any conflicting page aborts the whole confirm so the
/// caller can re-preview; with `force = true` conflicted pages are persisted
/// anyway and stamped `conflict-overridden` for audit. Pages that already
/// carry an active item for this content are returned as-is, which makes
/// re-confirming identical inputs idempotent.
#[instrument(skip_all, fields(content = content_id, force))]
pub async fn confirm(
    pool: &Pool,
    cfg: &AllocatorConfig,
    content_id: i64,
    page_ids: &[i64],
    preferred_date: NaiveDate,
    force: bool,
    now: DateTime<Utc>,
) -> Result<Vec<ScheduledItem>, SchedulerError> {
    let allocations = allocate(pool, cfg, content_id, page_ids, preferred_date, now).await?;

    if !force {
        let conflicted: Vec<i64> = allocations
            .iter()
            .filter(|a| a.conflict)
            .map(|a| a.page_id)
            .collect();
        if !conflicted.is_empty() {
            return Err(SchedulerError::Conflict(format!(
                "slots changed for pages {:?}; re-preview or confirm with force",
                conflicted
            )));
        }
    }

    let mut tx = pool.begin().await?;
    let mut items = Vec::with_capacity(allocations.len());
    for alloc in allocations {
        if let Some(existing) = alloc.existing {
            items.push(existing);
            continue;
        }
        let last_error = (alloc.conflict && force).then_some("conflict-overridden");
        let item = db::insert_scheduled_item_tx(
            &mut tx,
            content_id,
            alloc.page_id,
            alloc.candidate_time,
            cfg.max_retries,
            last_error,
        )
        .await?;
        items.push(item);
    }
    db::mark_content_scheduled_tx(&mut tx, content_id).await?;
    tx.commit().await?;

    info!(content = content_id, items = items.len(), "confirmed schedule");
    Ok(items)
}

/// Shared allocation pass behind both preview and confirm.
async fn allocate(
    pool: &Pool,
    cfg: &AllocatorConfig,
    content_id: i64,
    page_ids: &[i64],
    preferred_date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<Vec<PageAllocation>, SchedulerError> {
    if page_ids.is_empty() {
        return Err(SchedulerError::Validation("no pages requested".into()));
    }
    db::get_content(pool, content_id).await?;

    // Process pages in ascending id order and remember the times handed out
    // within this pass, so duplicate requests cannot double-book a page and
    // the result is deterministic.
    let unique_pages: BTreeSet<i64> = page_ids.iter().copied().collect();
    let mut chosen: HashMap<i64, Vec<DateTime<Utc>>> = HashMap::new();
    let mut allocations = Vec::with_capacity(unique_pages.len());

    for page_id in unique_pages {
        db::get_page(pool, page_id).await?;

        if let Some(existing) = db::active_item_for_content_page(pool, content_id, page_id).await? {
            allocations.push(PageAllocation {
                page_id,
                candidate_time: existing.scheduled_time,
                conflict: false,
                existing: Some(existing),
            });
            continue;
        }

        let mut occupied = db::active_times_for_page(pool, page_id).await?;
        occupied.extend(chosen.get(&page_id).into_iter().flatten().copied());

        let slots = db::slots_for_page(pool, page_id).await?;
        let (candidate_time, conflict) =
            next_free_time(cfg, &slots, &occupied, preferred_date, now).ok_or(
                SchedulerError::NoSlotAvailable {
                    page_id,
                    lookahead_days: cfg.lookahead_days,
                },
            )?;

        chosen.entry(page_id).or_default().push(candidate_time);
        allocations.push(PageAllocation {
            page_id,
            existing: None,
            candidate_time,
            conflict,
        });
    }

    allocations.sort_by_key(|a| (a.candidate_time, a.page_id));
    Ok(allocations)
}

/// Walk slot times chronologically from the preferred date, wrapping to the
/// following days, and return the first free future time. The bool reports
/// whether occupied slots had to be skipped along the way.
fn next_free_time(
    cfg: &AllocatorConfig,
    slots: &[crate::model::TimeSlot],
    occupied: &[DateTime<Utc>],
    preferred_date: NaiveDate,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, bool)> {
    let mut skipped_occupied = false;

    for day in 0..cfg.lookahead_days {
        let date = preferred_date + Duration::days(day as i64);
        let weekday = date.weekday().num_days_from_monday() as u8;

        let mut times: Vec<NaiveTime> = slots
            .iter()
            .filter(|s| s.day_of_week == weekday && (s.recurring || day < 7))
            .map(|s| s.time_of_day)
            .collect();
        if times.is_empty() {
            times = cfg.default_slot_times.clone();
        }
        times.sort();

        for time in times {
            let candidate = date.and_time(time).and_utc();
            if candidate <= now {
                continue;
            }
            if is_occupied(candidate, occupied, cfg.collision_window) {
                skipped_occupied = true;
                continue;
            }
            return Some((candidate, skipped_occupied));
        }
    }

    None
}

fn is_occupied(candidate: DateTime<Utc>, occupied: &[DateTime<Utc>], window: Duration) -> bool {
    occupied
        .iter()
        .any(|t| (candidate - *t).num_seconds().abs() <= window.num_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupancy_window_is_inclusive() {
        let window = Duration::minutes(30);
        let at = "2026-03-02T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let occupied = vec![at];

        assert!(is_occupied(at + Duration::minutes(30), &occupied, window));
        assert!(is_occupied(at - Duration::minutes(30), &occupied, window));
        assert!(!is_occupied(at + Duration::minutes(31), &occupied, window));
    }

    #[test]
    fn walk_skips_past_times_without_flagging_conflict() {
        let cfg = AllocatorConfig::default();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        // Mid-day: the 09:00 default is already in the past.
        let now = date.and_hms_opt(10, 0, 0).unwrap().and_utc();

        let (time, conflict) = next_free_time(&cfg, &[], &[], date, now).unwrap();
        assert_eq!(time, date.and_hms_opt(13, 0, 0).unwrap().and_utc());
        assert!(!conflict);
    }

    #[test]
    fn walk_wraps_to_next_day_when_slots_occupied() {
        let cfg = AllocatorConfig::default();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let now = date.and_hms_opt(0, 0, 0).unwrap().and_utc();
        let occupied: Vec<DateTime<Utc>> = [9, 13, 19]
            .iter()
            .map(|h| date.and_hms_opt(*h, 0, 0).unwrap().and_utc())
            .collect();

        let (time, conflict) = next_free_time(&cfg, &[], &occupied, date, now).unwrap();
        assert_eq!(
            time,
            (date + Duration::days(1)).and_hms_opt(9, 0, 0).unwrap().and_utc()
        );
        assert!(conflict);
    }

    #[test]
    fn walk_exhausts_lookahead() {
        let mut cfg = AllocatorConfig::default();
        cfg.lookahead_days = 2;
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let now = date.and_hms_opt(0, 0, 0).unwrap().and_utc();
        let occupied: Vec<DateTime<Utc>> = (0..2)
            .flat_map(|d| {
                [9, 13, 19].map(|h| (date + Duration::days(d)).and_hms_opt(h, 0, 0).unwrap().and_utc())
            })
            .collect();

        assert!(next_free_time(&cfg, &[], &occupied, date, now).is_none());
    }
}
