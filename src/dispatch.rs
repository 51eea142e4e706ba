//! Dispatch worker: the periodic driver that claims due items, publishes
//! them on a bounded pool and walks each one through its state machine.
//!
//! Claiming goes through the store's compare-and-swap transition, so a
//! second cycle or a concurrent manual delete simply loses the claim and
//! the item is skipped. A slow destination cannot stall the others because
//! publish attempts run concurrently up to `worker_concurrency`.

use crate::config::Config;
use crate::db::{self, DueItem, Pool, TransitionFields};
use crate::error::SchedulerError;
use crate::model::ItemStatus;
use crate::notify;
use crate::publisher::{PublishContent, PublishError, Publisher};
use crate::retry::{RetryDecision, RetryPolicy};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub tick_interval: Duration,
    pub worker_concurrency: usize,
    pub publish_timeout: Duration,
}

impl DispatchConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            tick_interval: Duration::from_secs(cfg.app.tick_interval_secs),
            worker_concurrency: cfg.app.worker_concurrency,
            publish_timeout: Duration::from_secs(cfg.app.publish_timeout_secs),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            worker_concurrency: 5,
            publish_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters for one dispatch cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub reclaimed: u64,
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
}

enum AttemptOutcome {
    Succeeded,
    Retried,
    Failed,
    Skipped,
}

/// Run the worker until the task is dropped. One cycle at a time; the next
/// tick starts only after the previous cycle has fully completed.
pub async fn run(
    pool: Pool,
    publisher: &dyn Publisher,
    policy: RetryPolicy,
    cfg: DispatchConfig,
) {
    info!(tick_secs = cfg.tick_interval.as_secs(), "dispatch worker starting");
    loop {
        match run_cycle(&pool, publisher, &policy, &cfg, Utc::now()).await {
            Ok(stats) if stats.claimed > 0 || stats.reclaimed > 0 => {
                info!(
                    claimed = stats.claimed,
                    succeeded = stats.succeeded,
                    retried = stats.retried,
                    failed = stats.failed,
                    reclaimed = stats.reclaimed,
                    "dispatch cycle complete"
                );
            }
            Ok(_) => {}
            Err(err) => {
                error!(?err, "dispatch cycle error");
            }
        }
        tokio::time::sleep(cfg.tick_interval).await;
    }
}

/// One full cycle: reclaim items stranded in `publishing`, claim everything
/// due, and publish the claimed set concurrently.
#[instrument(skip_all)]
pub async fn run_cycle(
    pool: &Pool,
    publisher: &dyn Publisher,
    policy: &RetryPolicy,
    cfg: &DispatchConfig,
    now: DateTime<Utc>,
) -> Result<CycleStats, SchedulerError> {
    let mut stats = CycleStats::default();

    let publish_timeout = chrono::Duration::from_std(cfg.publish_timeout)
        .unwrap_or_else(|_| chrono::Duration::seconds(30));
    stats.reclaimed = db::reclaim_stuck_publishing(pool, now - publish_timeout).await?;
    if stats.reclaimed > 0 {
        warn!(reclaimed = stats.reclaimed, "reclaimed items stuck in publishing");
    }

    let due = db::due_pending_items(pool, now).await?;
    let mut claimed = Vec::with_capacity(due.len());
    for item in due {
        let won = db::transition(
            pool,
            item.id,
            ItemStatus::Pending,
            ItemStatus::Publishing,
            TransitionFields::default(),
        )
        .await?;
        if won {
            claimed.push(item);
        }
        // A lost claim means another cycle took it or a delete removed it.
    }
    stats.claimed = claimed.len();

    let outcomes: Vec<AttemptOutcome> = stream::iter(claimed)
        .map(|item| publish_one(pool, publisher, policy, cfg, item, now))
        .buffer_unordered(cfg.worker_concurrency)
        .filter_map(|res| async move {
            match res {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    // Store failure mid-flight: the item stays `publishing`
                    // and the next recovery sweep picks it up.
                    error!(?err, "store error during dispatch");
                    None
                }
            }
        })
        .collect()
        .await;

    for outcome in outcomes {
        match outcome {
            AttemptOutcome::Succeeded => stats.succeeded += 1,
            AttemptOutcome::Retried => stats.retried += 1,
            AttemptOutcome::Failed => stats.failed += 1,
            AttemptOutcome::Skipped => {}
        }
    }
    Ok(stats)
}

async fn publish_one(
    pool: &Pool,
    publisher: &dyn Publisher,
    policy: &RetryPolicy,
    cfg: &DispatchConfig,
    item: DueItem,
    now: DateTime<Utc>,
) -> Result<AttemptOutcome, SchedulerError> {
    let content = PublishContent {
        body: item.body.clone(),
        media_refs: item.media_refs.clone(),
    };

    let result = match tokio::time::timeout(
        cfg.publish_timeout,
        publisher.publish(&item.page_external_id, &content),
    )
    .await
    {
        Ok(res) => res,
        Err(_) => Err(PublishError::transient(format!(
            "publish timed out after {}s",
            cfg.publish_timeout.as_secs()
        ))),
    };

    match result {
        Ok(post_id) => {
            let recorded = db::transition(
                pool,
                item.id,
                ItemStatus::Publishing,
                ItemStatus::Success,
                TransitionFields {
                    external_post_id: Some(post_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
            if !recorded {
                warn!(item = item.id, "item left publishing before success landed");
                return Ok(AttemptOutcome::Skipped);
            }
            db::insert_delivery_log(pool, item.id, item.page_id, "success", Some(&post_id), None)
                .await?;
            if db::mark_content_published(pool, item.content_id).await? {
                info!(content = item.content_id, "content delivered for the first time");
            }
            notify::publish_succeeded(pool, item.id, item.content_id, item.page_id, &post_id)
                .await?;
            info!(item = item.id, post = %post_id, "publish succeeded");
            Ok(AttemptOutcome::Succeeded)
        }
        Err(err) => {
            db::insert_delivery_log(pool, item.id, item.page_id, "failed", None, Some(&err.message))
                .await?;
            match policy.next_attempt(item.retry_count, item.max_retries, err.kind) {
                RetryDecision::Retry(delay) => {
                    db::transition(
                        pool,
                        item.id,
                        ItemStatus::Publishing,
                        ItemStatus::Pending,
                        TransitionFields {
                            retry_count: Some(item.retry_count + 1),
                            scheduled_time: Some(now + delay),
                            last_error: Some(err.message.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                    warn!(
                        item = item.id,
                        attempt = item.retry_count + 1,
                        delay_secs = delay.num_seconds(),
                        error = %err.message,
                        "publish failed; retry scheduled"
                    );
                    Ok(AttemptOutcome::Retried)
                }
                RetryDecision::Terminal => {
                    db::transition(
                        pool,
                        item.id,
                        ItemStatus::Publishing,
                        ItemStatus::Failed,
                        TransitionFields {
                            last_error: Some(err.message.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                    notify::publish_failed(pool, item.id, item.content_id, item.page_id, &err.message)
                        .await?;
                    warn!(item = item.id, error = %err.message, "publish failed terminally");
                    Ok(AttemptOutcome::Failed)
                }
            }
        }
    }
}
