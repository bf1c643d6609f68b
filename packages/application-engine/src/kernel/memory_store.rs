//! In-process `Store` used by tests and local runs without a database.
//!
//! All tables sit behind one mutex, so every trait method is a single atomic
//! step, the same guarantee the Postgres store gets from single statements.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::store::{ApplicationStore, CrawlStore, JobStore, UsageStore};
use crate::common::{ApplicationId, CrawlRequestId, JobId, UserId};
use crate::domains::applications::{
    Application, ApplicationFilter, ApplicationStats, ApplicationStatus, DeleteOutcome,
    InsertOutcome, StatusChange,
};
use crate::domains::crawling::{CrawlProgress, CrawlRequest, CrawlStatus};
use crate::domains::jobs::{JobPosting, JobSearch, JobSource, NewPosting, UpsertOutcome};
use crate::domains::metering::{UsageRecord, UsageStats};

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, JobPosting>,
    job_keys: HashMap<(JobSource, String), JobId>,
    crawls: HashMap<CrawlRequestId, CrawlRequest>,
    applications: HashMap<ApplicationId, Application>,
    application_keys: HashMap<(UserId, JobId), ApplicationId>,
    usage: Vec<UsageRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    /// Number of stored postings, active or not.
    pub fn job_count(&self) -> usize {
        self.tables().map(|t| t.jobs.len()).unwrap_or(0)
    }

    /// Number of stored usage records.
    pub fn usage_count(&self) -> usize {
        self.tables().map(|t| t.usage.len()).unwrap_or(0)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn upsert_job(&self, posting: &NewPosting) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let mut tables = self.tables()?;
        let key = (posting.source, posting.external_id.clone());

        if let Some(job_id) = tables.job_keys.get(&key).copied() {
            let job = tables
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| anyhow!("job index points at missing row {job_id}"))?;
            job.refresh(posting, now);
            return Ok(UpsertOutcome {
                job_id,
                is_new: false,
            });
        }

        let job = JobPosting::first_seen(posting, now);
        let job_id = job.id;
        tables.job_keys.insert(key, job_id);
        tables.jobs.insert(job_id, job);
        Ok(UpsertOutcome {
            job_id,
            is_new: true,
        })
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobPosting>> {
        Ok(self.tables()?.jobs.get(&id).cloned())
    }

    async fn search_jobs(&self, search: &JobSearch) -> Result<Vec<JobPosting>> {
        let tables = self.tables()?;
        let mut hits: Vec<JobPosting> = tables
            .jobs
            .values()
            .filter(|job| search.matches(job))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at).then(b.id.cmp(&a.id)));
        Ok(hits
            .into_iter()
            .skip(search.effective_offset() as usize)
            .take(search.effective_limit() as usize)
            .collect())
    }

    async fn deactivate_stale_jobs(
        &self,
        source: JobSource,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tables = self.tables()?;
        let mut changed = 0;
        for job in tables.jobs.values_mut() {
            if job.source == source && job.is_active && job.last_seen_at < cutoff {
                job.is_active = false;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl CrawlStore for MemoryStore {
    async fn insert_crawl_request(&self, request: &CrawlRequest) -> Result<()> {
        self.tables()?.crawls.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_crawl_request(&self, id: CrawlRequestId) -> Result<Option<CrawlRequest>> {
        Ok(self.tables()?.crawls.get(&id).cloned())
    }

    async fn list_crawl_requests(&self, limit: i64) -> Result<Vec<CrawlRequest>> {
        let tables = self.tables()?;
        let mut requests: Vec<CrawlRequest> = tables.crawls.values().cloned().collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        requests.truncate(limit.max(0) as usize);
        Ok(requests)
    }

    async fn transition_crawl_request(
        &self,
        id: CrawlRequestId,
        from: CrawlStatus,
        to: CrawlStatus,
        error_message: Option<String>,
    ) -> Result<bool> {
        let mut tables = self.tables()?;
        let Some(request) = tables.crawls.get_mut(&id) else {
            return Ok(false);
        };
        if request.status != from {
            return Ok(false);
        }

        let now = Utc::now();
        request.status = to;
        if to == CrawlStatus::Running {
            request.started_at = Some(now);
        }
        if to.is_terminal() {
            request.completed_at = Some(now);
        }
        if error_message.is_some() {
            request.error_message = error_message;
        }
        Ok(true)
    }

    async fn record_crawl_progress(
        &self,
        id: CrawlRequestId,
        progress: CrawlProgress,
    ) -> Result<()> {
        let mut tables = self.tables()?;
        if let Some(request) = tables.crawls.get_mut(&id) {
            request.jobs_found = progress.jobs_found;
            request.jobs_new = progress.jobs_new;
            request.pages_fetched = progress.pages_fetched;
        }
        Ok(())
    }

    async fn fail_unfinished_crawls(&self, error_message: &str) -> Result<u64> {
        let mut tables = self.tables()?;
        let now = Utc::now();
        let mut changed = 0;
        for request in tables.crawls.values_mut() {
            if !request.status.is_terminal() {
                request.status = CrawlStatus::Failed;
                request.error_message = Some(error_message.to_string());
                request.completed_at = Some(now);
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl ApplicationStore for MemoryStore {
    async fn insert_application(&self, application: &Application) -> Result<InsertOutcome> {
        let mut tables = self.tables()?;
        let key = (application.user_id, application.job_id);

        if let Some(existing) = tables
            .application_keys
            .get(&key)
            .and_then(|id| tables.applications.get(id))
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        tables.application_keys.insert(key, application.id);
        tables
            .applications
            .insert(application.id, application.clone());
        Ok(InsertOutcome::Inserted(application.clone()))
    }

    async fn get_application(&self, id: ApplicationId) -> Result<Option<Application>> {
        Ok(self.tables()?.applications.get(&id).cloned())
    }

    async fn find_application(
        &self,
        user_id: UserId,
        job_id: JobId,
    ) -> Result<Option<Application>> {
        let tables = self.tables()?;
        Ok(tables
            .application_keys
            .get(&(user_id, job_id))
            .and_then(|id| tables.applications.get(id))
            .cloned())
    }

    async fn transition_application(
        &self,
        id: ApplicationId,
        expected: ApplicationStatus,
        change: &StatusChange,
    ) -> Result<Option<Application>> {
        let mut tables = self.tables()?;
        match tables.applications.get_mut(&id) {
            Some(app) if app.status == expected => {
                app.apply_change(change, Utc::now());
                Ok(Some(app.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_application_if(
        &self,
        id: ApplicationId,
        allowed: &[ApplicationStatus],
    ) -> Result<DeleteOutcome> {
        let mut tables = self.tables()?;
        let Some(app) = tables.applications.get(&id) else {
            return Ok(DeleteOutcome::NotFound);
        };
        if !allowed.contains(&app.status) {
            return Ok(DeleteOutcome::Rejected(app.status));
        }

        let key = (app.user_id, app.job_id);
        tables.applications.remove(&id);
        tables.application_keys.remove(&key);
        Ok(DeleteOutcome::Deleted)
    }

    async fn set_fit_score(&self, id: ApplicationId, score: f32) -> Result<()> {
        if let Some(app) = self.tables()?.applications.get_mut(&id) {
            app.fit_score = Some(score);
        }
        Ok(())
    }

    async fn list_applications(&self, filter: &ApplicationFilter) -> Result<Vec<Application>> {
        let tables = self.tables()?;
        let mut apps: Vec<Application> = tables
            .applications
            .values()
            .filter(|app| app.user_id == filter.user_id)
            .filter(|app| filter.status.map_or(true, |status| app.status == status))
            .cloned()
            .collect();
        apps.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(apps
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn applications_with_status(
        &self,
        status: ApplicationStatus,
    ) -> Result<Vec<Application>> {
        let tables = self.tables()?;
        let mut apps: Vec<Application> = tables
            .applications
            .values()
            .filter(|app| app.status == status)
            .cloned()
            .collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(apps)
    }

    async fn application_stats(&self, user_id: UserId) -> Result<ApplicationStats> {
        let tables = self.tables()?;
        let mut stats = ApplicationStats::default();
        for app in tables.applications.values().filter(|a| a.user_id == user_id) {
            stats.total += 1;
            match app.status {
                ApplicationStatus::Pending => stats.pending += 1,
                ApplicationStatus::InProgress => stats.in_progress += 1,
                ApplicationStatus::Applied => stats.applied += 1,
                ApplicationStatus::Interview => stats.interviews += 1,
                ApplicationStatus::Failed => stats.failed += 1,
                ApplicationStatus::Rejected | ApplicationStatus::Accepted => {}
            }
        }
        Ok(stats.with_success_rate())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn insert_usage(&self, record: &UsageRecord) -> Result<()> {
        self.tables()?.usage.push(record.clone());
        Ok(())
    }

    async fn usage_stats(&self, user_id: UserId, day_start: DateTime<Utc>) -> Result<UsageStats> {
        let tables = self.tables()?;
        Ok(UsageStats::from_records(
            tables.usage.iter().filter(|r| r.user_id == Some(user_id)),
            day_start,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posting(external_id: &str) -> NewPosting {
        NewPosting::builder()
            .source(JobSource::Indeed)
            .external_id(external_id)
            .title("Data Engineer")
            .company("Acme")
            .source_url(format!("https://indeed.example/{external_id}"))
            .build()
    }

    #[tokio::test]
    async fn upsert_is_keyed_on_source_and_external_id() {
        let store = MemoryStore::new();
        let first = store.upsert_job(&posting("x1")).await.unwrap();
        let again = store.upsert_job(&posting("x1")).await.unwrap();

        let mut other_source = posting("x1");
        other_source.source = JobSource::Monster;
        let third = store.upsert_job(&other_source).await.unwrap();

        assert!(first.is_new);
        assert!(!again.is_new);
        assert_eq!(first.job_id, again.job_id);
        assert!(third.is_new);
        assert_eq!(store.job_count(), 2);
    }

    #[tokio::test]
    async fn second_insert_for_same_pair_returns_existing_row() {
        let store = MemoryStore::new();
        let (user, job) = (UserId::new(), JobId::new());
        let first = Application::pending(user, job);
        let second = Application::pending(user, job);

        assert!(matches!(
            store.insert_application(&first).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));
        match store.insert_application(&second).await.unwrap() {
            InsertOutcome::Existing(app) => assert_eq!(app.id, first.id),
            other => panic!("expected existing row, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transition_requires_expected_status() {
        let store = MemoryStore::new();
        let app = Application::pending(UserId::new(), JobId::new());
        store.insert_application(&app).await.unwrap();

        let claimed = store
            .transition_application(app.id, ApplicationStatus::Pending, &StatusChange::begin_attempt())
            .await
            .unwrap();
        assert_eq!(claimed.map(|a| a.attempt_count), Some(1));

        let again = store
            .transition_application(app.id, ApplicationStatus::Pending, &StatusChange::begin_attempt())
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn delete_is_conditional() {
        let store = MemoryStore::new();
        let app = Application::pending(UserId::new(), JobId::new());
        store.insert_application(&app).await.unwrap();
        store
            .transition_application(app.id, ApplicationStatus::Pending, &StatusChange::begin_attempt())
            .await
            .unwrap();

        let allowed = [ApplicationStatus::Pending, ApplicationStatus::Failed];
        assert_eq!(
            store.delete_application_if(app.id, &allowed).await.unwrap(),
            DeleteOutcome::Rejected(ApplicationStatus::InProgress)
        );
        assert_eq!(
            store
                .delete_application_if(ApplicationId::new(), &allowed)
                .await
                .unwrap(),
            DeleteOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn stale_postings_are_deactivated_per_source() {
        let store = MemoryStore::new();
        store.upsert_job(&posting("old")).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::seconds(1);

        assert_eq!(
            store
                .deactivate_stale_jobs(JobSource::Linkedin, cutoff)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .deactivate_stale_jobs(JobSource::Indeed, cutoff)
                .await
                .unwrap(),
            1
        );
        let hits = store.search_jobs(&JobSearch::default()).await.unwrap();
        assert!(hits.is_empty());
    }
}
