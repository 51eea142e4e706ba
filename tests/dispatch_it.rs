use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pagecast::db::{self, TransitionFields};
use pagecast::dispatch::{self, DispatchConfig};
use pagecast::error::SchedulerError;
use pagecast::model::{ContentStatus, ItemStatus, NotificationKind};
use pagecast::notify;
use pagecast::publisher::{PublishContent, PublishError, Publisher};
use pagecast::retry::RetryPolicy;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

async fn setup_pool() -> (db::Pool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/dispatch.db?mode=rwc", dir.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    (pool, dir)
}

#[derive(Debug, Clone)]
struct PublishCall {
    page: String,
    body: String,
}

/// Records publish calls and answers per page from a queued script, so the
/// outcome does not depend on the order concurrent attempts happen to run.
#[derive(Clone, Default)]
struct RecordingPublisher {
    responses: Arc<Mutex<HashMap<String, VecDeque<Result<String, PublishError>>>>>,
    calls: Arc<Mutex<Vec<PublishCall>>>,
}

impl RecordingPublisher {
    async fn enqueue(&self, page: &str, response: Result<String, PublishError>) {
        self.responses
            .lock()
            .await
            .entry(page.to_string())
            .or_default()
            .push_back(response);
    }

    async fn calls(&self) -> Vec<PublishCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(
        &self,
        page_external_id: &str,
        content: &PublishContent,
    ) -> Result<String, PublishError> {
        self.calls.lock().await.push(PublishCall {
            page: page_external_id.to_string(),
            body: content.body.clone(),
        });
        self.responses
            .lock()
            .await
            .get_mut(page_external_id)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Ok(format!("post-{}", page_external_id)))
    }
}

/// A publisher that never answers within the attempt timeout.
struct StalledPublisher;

#[async_trait]
impl Publisher for StalledPublisher {
    async fn publish(&self, _page: &str, _content: &PublishContent) -> Result<String, PublishError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok("never".into())
    }
}

struct Fixture {
    content: i64,
    p1: i64,
    p2: i64,
    item1: i64,
    item2: i64,
    due_at: DateTime<Utc>,
}

/// Content scheduled to two pages an hour from now.
async fn two_page_fixture(pool: &db::Pool) -> Fixture {
    let content = db::create_content(pool, "launch post", &["m-1".into()]).await.unwrap();
    let p1 = db::create_page(pool, "pg-1", "One").await.unwrap();
    let p2 = db::create_page(pool, "pg-2", "Two").await.unwrap();
    let due_at = Utc::now() + Duration::hours(1);
    let item1 = db::insert_scheduled_item(pool, content, p1, due_at, 3, None).await.unwrap().id;
    let item2 = db::insert_scheduled_item(pool, content, p2, due_at + Duration::hours(1), 3, None)
        .await
        .unwrap()
        .id;
    Fixture { content, p1, p2, item1, item2, due_at }
}

#[tokio::test]
async fn items_are_not_dispatched_before_due_time() {
    let (pool, _dir) = setup_pool().await;
    let fx = two_page_fixture(&pool).await;
    let publisher = RecordingPublisher::default();
    let policy = RetryPolicy::default();
    let cfg = DispatchConfig::default();

    let stats = dispatch::run_cycle(&pool, &publisher, &policy, &cfg, Utc::now())
        .await
        .unwrap();
    assert_eq!(stats.claimed, 0);
    assert!(publisher.calls().await.is_empty());

    let item = db::get_scheduled_item(&pool, fx.item1).await.unwrap();
    assert_eq!(item.status, ItemStatus::Pending);
}

#[tokio::test]
async fn success_and_transient_failure_in_one_cycle() {
    let (pool, _dir) = setup_pool().await;
    let fx = two_page_fixture(&pool).await;
    let publisher = RecordingPublisher::default();
    publisher.enqueue("pg-1", Ok("fb-post-1".into())).await;
    publisher
        .enqueue("pg-2", Err(PublishError::transient("rate limited")))
        .await;
    let policy = RetryPolicy::default();
    let cfg = DispatchConfig::default();

    // Both items are due once the clock passes their scheduled times.
    let now = fx.due_at + Duration::hours(2);
    let stats = dispatch::run_cycle(&pool, &publisher, &policy, &cfg, now)
        .await
        .unwrap();
    assert_eq!(stats.claimed, 2);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.failed, 0);

    let done = db::get_scheduled_item(&pool, fx.item1).await.unwrap();
    assert_eq!(done.status, ItemStatus::Success);
    assert_eq!(done.external_post_id.as_deref(), Some("fb-post-1"));

    let retried = db::get_scheduled_item(&pool, fx.item2).await.unwrap();
    assert_eq!(retried.status, ItemStatus::Pending);
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.last_error.as_deref(), Some("rate limited"));
    // New due time sits one backoff step past the cycle clock, jitter below
    // one extra base step.
    let delay = retried.scheduled_time - now;
    assert!(delay >= Duration::seconds(60));
    assert!(delay < Duration::seconds(121));

    // First successful delivery marks the content published.
    let content = db::get_content(&pool, fx.content).await.unwrap();
    assert_eq!(content.status, ContentStatus::Published);

    let unread = notify::list_unread(&pool).await.unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].kind, NotificationKind::PublishSucceeded);
    assert_eq!(unread[0].payload["external_post_id"], "fb-post-1");
}

#[tokio::test]
async fn permanent_failure_is_terminal_and_notifies() {
    let (pool, _dir) = setup_pool().await;
    let fx = two_page_fixture(&pool).await;
    let publisher = RecordingPublisher::default();
    publisher
        .enqueue("pg-2", Err(PublishError::transient("rate limited")))
        .await;
    publisher
        .enqueue("pg-2", Err(PublishError::permanent("page removed")))
        .await;
    let policy = RetryPolicy::default();
    let cfg = DispatchConfig::default();

    let now = fx.due_at + Duration::hours(2);
    dispatch::run_cycle(&pool, &publisher, &policy, &cfg, now).await.unwrap();

    // Second cycle, past the retry delay: the permanent error ends it.
    let later = now + Duration::hours(1);
    let stats = dispatch::run_cycle(&pool, &publisher, &policy, &cfg, later)
        .await
        .unwrap();
    assert_eq!(stats.failed, 1);

    let item = db::get_scheduled_item(&pool, fx.item2).await.unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    // The counter keeps the value it had when the permanent error hit.
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.last_error.as_deref(), Some("page removed"));

    let unread = notify::list_unread(&pool).await.unwrap();
    let failures: Vec<_> = unread
        .iter()
        .filter(|n| n.kind == NotificationKind::PublishFailed)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].payload["error"], "page removed");

    // Two attempts, both in the audit trail.
    let logs = db::delivery_logs_for_item(&pool, fx.item2).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.status == "failed"));
}

#[tokio::test]
async fn retry_count_never_exceeds_budget() {
    let (pool, _dir) = setup_pool().await;
    let fx = two_page_fixture(&pool).await;
    let publisher = RecordingPublisher::default();
    for _ in 0..10 {
        publisher
            .enqueue("pg-2", Err(PublishError::transient("flaky")))
            .await;
        publisher
            .enqueue("pg-1", Err(PublishError::transient("flaky")))
            .await;
    }
    let policy = RetryPolicy::default();
    let cfg = DispatchConfig::default();

    let mut now = fx.due_at + Duration::hours(2);
    for _ in 0..10 {
        dispatch::run_cycle(&pool, &publisher, &policy, &cfg, now).await.unwrap();
        let i1 = db::get_scheduled_item(&pool, fx.item1).await.unwrap();
        let i2 = db::get_scheduled_item(&pool, fx.item2).await.unwrap();
        assert!(i1.retry_count <= i1.max_retries);
        assert!(i2.retry_count <= i2.max_retries);
        now = now + Duration::hours(2);
    }

    let i1 = db::get_scheduled_item(&pool, fx.item1).await.unwrap();
    assert_eq!(i1.status, ItemStatus::Failed);
    assert_eq!(i1.retry_count, i1.max_retries);
}

#[tokio::test]
async fn concurrent_claims_have_a_single_winner() {
    let (pool, _dir) = setup_pool().await;
    let fx = two_page_fixture(&pool).await;

    let (a, b) = tokio::join!(
        db::transition(
            &pool,
            fx.item1,
            ItemStatus::Pending,
            ItemStatus::Publishing,
            TransitionFields::default(),
        ),
        db::transition(
            &pool,
            fx.item1,
            ItemStatus::Pending,
            ItemStatus::Publishing,
            TransitionFields::default(),
        ),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert!(a ^ b, "exactly one claim must win, got {} and {}", a, b);
}

#[tokio::test]
async fn deleted_pending_item_is_never_dispatched() {
    let (pool, _dir) = setup_pool().await;
    let fx = two_page_fixture(&pool).await;
    let publisher = RecordingPublisher::default();
    let policy = RetryPolicy::default();
    let cfg = DispatchConfig::default();

    db::delete_scheduled_item(&pool, fx.item1).await.unwrap();

    let now = fx.due_at + Duration::hours(2);
    let stats = dispatch::run_cycle(&pool, &publisher, &policy, &cfg, now)
        .await
        .unwrap();
    assert_eq!(stats.claimed, 1);

    let calls = publisher.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].page, "pg-2");
    assert_eq!(calls[0].body, "launch post");

    let err = db::get_scheduled_item(&pool, fx.item1).await.unwrap_err();
    assert!(matches!(err, SchedulerError::NotFound(_)));
}

#[tokio::test]
async fn stalled_attempt_times_out_as_transient() {
    let (pool, _dir) = setup_pool().await;
    let fx = two_page_fixture(&pool).await;
    let policy = RetryPolicy::default();
    let cfg = DispatchConfig {
        publish_timeout: std::time::Duration::from_millis(50),
        ..DispatchConfig::default()
    };

    let now = fx.due_at + Duration::hours(2);
    let stats = dispatch::run_cycle(&pool, &StalledPublisher, &policy, &cfg, now)
        .await
        .unwrap();
    assert_eq!(stats.retried, 2);

    let item = db::get_scheduled_item(&pool, fx.item1).await.unwrap();
    assert_eq!(item.status, ItemStatus::Pending);
    assert_eq!(item.retry_count, 1);
    assert!(item.last_error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn recovery_sweep_reclaims_stuck_items() {
    let (pool, _dir) = setup_pool().await;
    let fx = two_page_fixture(&pool).await;
    let publisher = RecordingPublisher::default();
    let policy = RetryPolicy::default();
    let cfg = DispatchConfig::default();

    // Simulate a worker that died mid-publish.
    db::transition(
        &pool,
        fx.item1,
        ItemStatus::Pending,
        ItemStatus::Publishing,
        TransitionFields::default(),
    )
    .await
    .unwrap();

    // Far enough in the future that the claim is older than the publish
    // timeout, so the sweep returns it to pending and the cycle retries it.
    let now = Utc::now() + Duration::hours(3);
    let stats = dispatch::run_cycle(&pool, &publisher, &policy, &cfg, now)
        .await
        .unwrap();
    assert_eq!(stats.reclaimed, 1);
    assert_eq!(stats.claimed, 2);
    assert_eq!(stats.succeeded, 2);

    let item = db::get_scheduled_item(&pool, fx.item1).await.unwrap();
    assert_eq!(item.status, ItemStatus::Success);
}

#[tokio::test]
async fn manual_retry_requires_failed_state() {
    let (pool, _dir) = setup_pool().await;
    let fx = two_page_fixture(&pool).await;
    let publisher = RecordingPublisher::default();
    publisher
        .enqueue("pg-1", Err(PublishError::permanent("invalid credential")))
        .await;
    let policy = RetryPolicy::default();
    let cfg = DispatchConfig::default();

    // A pending item cannot be manually retried.
    let err = db::retry_failed_item(&pool, fx.item2, Utc::now()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidState(_)));

    let now = fx.due_at + Duration::hours(2);
    dispatch::run_cycle(&pool, &publisher, &policy, &cfg, now).await.unwrap();
    let item = db::get_scheduled_item(&pool, fx.item1).await.unwrap();
    assert_eq!(item.status, ItemStatus::Failed);

    // Revived as a fresh entry into the pipeline.
    let revived = db::retry_failed_item(&pool, fx.item1, now).await.unwrap();
    assert_eq!(revived.status, ItemStatus::Pending);
    assert_eq!(revived.retry_count, 0);
    assert!(revived.last_error.is_none());

    let stats = dispatch::run_cycle(&pool, &publisher, &policy, &cfg, now + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(stats.succeeded, 1);
}

#[tokio::test]
async fn deactivated_page_items_are_not_selected() {
    let (pool, _dir) = setup_pool().await;
    let fx = two_page_fixture(&pool).await;
    let publisher = RecordingPublisher::default();
    let policy = RetryPolicy::default();
    let cfg = DispatchConfig::default();

    let stranded = notify::page_deactivated(&pool, fx.p2).await.unwrap();
    assert_eq!(stranded, vec![fx.item2]);

    let now = fx.due_at + Duration::hours(2);
    let stats = dispatch::run_cycle(&pool, &publisher, &policy, &cfg, now)
        .await
        .unwrap();
    assert_eq!(stats.claimed, 1);
    let calls = publisher.calls().await;
    assert_eq!(calls.len(), 1);
    let survivor = db::get_page(&pool, fx.p1).await.unwrap();
    assert_eq!(calls[0].page, survivor.external_id);

    let warnings: Vec<_> = notify::list_unread(&pool)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::PageDeactivated)
        .collect();
    assert_eq!(warnings.len(), 1);
}
