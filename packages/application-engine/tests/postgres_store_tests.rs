//! Integration tests for the Postgres store.
//!
//! Verifies the storage-layer guarantees the engine relies on against a real
//! database: keyed upserts, one application per (user, job), and
//! compare-and-set status writes. Tests share one database, so each works on
//! its own ids and sources.

mod common;

use chrono::{Duration, Utc};
use test_context::test_context;

use crate::common::{posting, PostgresHarness};
use application_engine::common::{ApplicationId, UserId};
use application_engine::domains::applications::{
    Application, ApplicationFilter, ApplicationStatus, DeleteOutcome, InsertOutcome, StatusChange,
};
use application_engine::domains::crawling::{CrawlProgress, CrawlRequest, CrawlStatus};
use application_engine::domains::jobs::{JobSearch, JobSource};
use application_engine::domains::metering::{utc_day_start, ServiceTag, UsageRecord, UsageUnits};
use application_engine::kernel::{ApplicationStore, CrawlStore, JobStore, UsageStore};

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

async fn pending_application(ctx: &PostgresHarness, user: UserId) -> Application {
    let job = ctx
        .store
        .upsert_job(&posting(JobSource::Linkedin, &unique("li")))
        .await
        .unwrap();
    let app = Application::pending(user, job.job_id);
    match ctx.store.insert_application(&app).await.unwrap() {
        InsertOutcome::Inserted(app) => app,
        InsertOutcome::Existing(_) => panic!("fresh (user, job) pair already had a row"),
    }
}

// =============================================================================
// Jobs
// =============================================================================

#[test_context(PostgresHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn repeated_upserts_keep_one_row(ctx: &PostgresHarness) {
    let external_id = unique("in");
    let first = ctx
        .store
        .upsert_job(&posting(JobSource::Indeed, &external_id))
        .await
        .unwrap();
    let mut refreshed = posting(JobSource::Indeed, &external_id);
    refreshed.title = "Staff Engineer".into();
    let second = ctx.store.upsert_job(&refreshed).await.unwrap();

    assert!(first.is_new);
    assert!(!second.is_new);
    assert_eq!(first.job_id, second.job_id);

    let job = ctx.store.get_job(first.job_id).await.unwrap().unwrap();
    assert_eq!(job.title, "Staff Engineer");
    assert!(job.last_seen_at >= job.first_seen_at);
}

#[test_context(PostgresHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn concurrent_upserts_converge_on_one_id(ctx: &PostgresHarness) {
    let external_id = unique("gd");
    let listing = posting(JobSource::Glassdoor, &external_id);

    let upserts = (0..8).map(|_| ctx.store.upsert_job(&listing));
    let outcomes: Vec<_> = futures::future::join_all(upserts)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(outcomes.iter().filter(|o| o.is_new).count(), 1);
    assert!(outcomes.iter().all(|o| o.job_id == outcomes[0].job_id));
}

#[test_context(PostgresHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn stale_postings_drop_out_of_search(ctx: &PostgresHarness) {
    let external_id = unique("custom");
    let outcome = ctx
        .store
        .upsert_job(&posting(JobSource::Custom, &external_id))
        .await
        .unwrap();

    let search = JobSearch {
        query: Some(external_id.clone()),
        ..Default::default()
    };
    assert_eq!(ctx.store.search_jobs(&search).await.unwrap().len(), 1);

    let changed = ctx
        .store
        .deactivate_stale_jobs(JobSource::Custom, Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert!(changed >= 1);
    assert!(ctx.store.search_jobs(&search).await.unwrap().is_empty());
    assert!(!ctx.store.get_job(outcome.job_id).await.unwrap().unwrap().is_active);

    // Seeing it again reactivates it
    ctx.store
        .upsert_job(&posting(JobSource::Custom, &external_id))
        .await
        .unwrap();
    assert_eq!(ctx.store.search_jobs(&search).await.unwrap().len(), 1);
}

// =============================================================================
// Applications
// =============================================================================

#[test_context(PostgresHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn second_insert_returns_the_existing_row(ctx: &PostgresHarness) {
    let user = UserId::new();
    let app = pending_application(ctx, user).await;

    let duplicate = Application::pending(user, app.job_id);
    match ctx.store.insert_application(&duplicate).await.unwrap() {
        InsertOutcome::Existing(existing) => assert_eq!(existing.id, app.id),
        InsertOutcome::Inserted(_) => panic!("second row for the same (user, job)"),
    }
}

#[test_context(PostgresHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn status_writes_are_compare_and_set(ctx: &PostgresHarness) {
    let app = pending_application(ctx, UserId::new()).await;

    let claimed = ctx
        .store
        .transition_application(app.id, ApplicationStatus::Pending, &StatusChange::begin_attempt())
        .await
        .unwrap()
        .expect("first claim wins");
    assert_eq!(claimed.status, ApplicationStatus::InProgress);
    assert_eq!(claimed.attempt_count, 1);
    assert!(claimed.last_attempt_at.is_some());

    let lost = ctx
        .store
        .transition_application(app.id, ApplicationStatus::Pending, &StatusChange::begin_attempt())
        .await
        .unwrap();
    assert!(lost.is_none());

    let failed = ctx
        .store
        .transition_application(
            app.id,
            ApplicationStatus::InProgress,
            &StatusChange::failed(
                "submit failed: bot challenge detected: captcha",
                Some("artifacts/x.json".into()),
                vec!["navigate: ok".into(), "submit: bot challenge detected: captcha".into()],
            ),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, ApplicationStatus::Failed);
    assert_eq!(failed.diagnostic_ref.as_deref(), Some("artifacts/x.json"));
    assert_eq!(failed.automation_log.len(), 2);

    let requeued = ctx
        .store
        .transition_application(app.id, ApplicationStatus::Failed, &StatusChange::requeue())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(requeued.status, ApplicationStatus::Pending);
    assert!(requeued.error_message.is_none());
    assert!(requeued.diagnostic_ref.is_none());
    assert!(requeued.automation_log.is_empty());
    assert_eq!(requeued.attempt_count, 1);
}

#[test_context(PostgresHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn conditional_delete_reports_why_it_refused(ctx: &PostgresHarness) {
    let allowed = [ApplicationStatus::Pending, ApplicationStatus::Failed];

    let pending = pending_application(ctx, UserId::new()).await;
    assert_eq!(
        ctx.store.delete_application_if(pending.id, &allowed).await.unwrap(),
        DeleteOutcome::Deleted
    );
    assert!(ctx.store.get_application(pending.id).await.unwrap().is_none());

    let running = pending_application(ctx, UserId::new()).await;
    ctx.store
        .transition_application(running.id, ApplicationStatus::Pending, &StatusChange::begin_attempt())
        .await
        .unwrap();
    assert_eq!(
        ctx.store.delete_application_if(running.id, &allowed).await.unwrap(),
        DeleteOutcome::Rejected(ApplicationStatus::InProgress)
    );

    assert_eq!(
        ctx.store
            .delete_application_if(ApplicationId::new(), &allowed)
            .await
            .unwrap(),
        DeleteOutcome::NotFound
    );
}

#[test_context(PostgresHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn stats_and_listing_are_per_user(ctx: &PostgresHarness) {
    let user = UserId::new();
    let applied = pending_application(ctx, user).await;
    ctx.store
        .transition_application(applied.id, ApplicationStatus::Pending, &StatusChange::begin_attempt())
        .await
        .unwrap();
    ctx.store
        .transition_application(
            applied.id,
            ApplicationStatus::InProgress,
            &StatusChange::succeeded(vec![]),
        )
        .await
        .unwrap();
    pending_application(ctx, user).await;
    pending_application(ctx, UserId::new()).await;

    let stats = ctx.store.application_stats(user).await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.success_rate, 50.0);

    let pending = ctx
        .store
        .list_applications(&ApplicationFilter::for_user(user).with_status(ApplicationStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    ctx.store.set_fit_score(applied.id, 0.9).await.unwrap();
    let scored = ctx.store.get_application(applied.id).await.unwrap().unwrap();
    assert_eq!(scored.fit_score, Some(0.9));
    assert!(scored.applied_at.is_some());
}

// =============================================================================
// Crawl requests and usage
// =============================================================================

#[test_context(PostgresHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn crawl_request_lifecycle(ctx: &PostgresHarness) {
    let request = CrawlRequest::queued(None, "rust", Some("Remote".into()), JobSource::Monster);
    ctx.store.insert_crawl_request(&request).await.unwrap();

    assert!(!ctx
        .store
        .transition_crawl_request(request.id, CrawlStatus::Running, CrawlStatus::Completed, None)
        .await
        .unwrap());
    assert!(ctx
        .store
        .transition_crawl_request(request.id, CrawlStatus::Queued, CrawlStatus::Running, None)
        .await
        .unwrap());

    ctx.store
        .record_crawl_progress(
            request.id,
            CrawlProgress {
                jobs_found: 4,
                jobs_new: 1,
                pages_fetched: 2,
            },
        )
        .await
        .unwrap();
    assert!(ctx
        .store
        .transition_crawl_request(request.id, CrawlStatus::Running, CrawlStatus::Completed, None)
        .await
        .unwrap());

    let stored = ctx.store.get_crawl_request(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CrawlStatus::Completed);
    assert_eq!((stored.jobs_found, stored.jobs_new, stored.pages_fetched), (4, 1, 2));
    assert!(stored.started_at.is_some());
    assert!(stored.completed_at.is_some());

    let orphan = CrawlRequest::queued(None, "go", None, JobSource::Monster);
    ctx.store.insert_crawl_request(&orphan).await.unwrap();
    assert!(ctx.store.fail_unfinished_crawls("crawl interrupted by restart").await.unwrap() >= 1);
    let orphan = ctx.store.get_crawl_request(orphan.id).await.unwrap().unwrap();
    assert_eq!(orphan.status, CrawlStatus::Failed);
    assert_eq!(
        orphan.error_message.as_deref(),
        Some("crawl interrupted by restart")
    );

    let recent = ctx.store.list_crawl_requests(100).await.unwrap();
    assert!(recent.iter().any(|r| r.id == request.id));
}

#[test_context(PostgresHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn usage_is_aggregated_per_service(ctx: &PostgresHarness) {
    let user = UserId::new();
    for record in [
        UsageRecord::new(Some(user), ServiceTag::Crawl, UsageUnits::flat(1)),
        UsageRecord::new(Some(user), ServiceTag::Crawl, UsageUnits::flat(1)),
        UsageRecord::new(Some(user), ServiceTag::FormFill, UsageUnits::flat(5)),
        UsageRecord::new(None, ServiceTag::Crawl, UsageUnits::flat(1)),
    ] {
        ctx.store.insert_usage(&record).await.unwrap();
    }

    let stats = ctx
        .store
        .usage_stats(user, utc_day_start(Utc::now()))
        .await
        .unwrap();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.total_units, 7);
    assert_eq!(stats.requests_today, 3);

    let crawl = stats
        .by_service
        .iter()
        .find(|s| s.service == ServiceTag::Crawl)
        .unwrap();
    assert_eq!(crawl.requests, 2);
}
