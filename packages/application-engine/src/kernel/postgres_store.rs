//! Postgres-backed `Store`.
//!
//! Every precondition is a single statement: upserts use
//! `ON CONFLICT`, status changes use `UPDATE ... WHERE status = $expected`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

use super::store::{ApplicationStore, CrawlStore, JobStore, UsageStore};
use crate::common::{ApplicationId, CrawlRequestId, JobId, UserId};
use crate::domains::applications::{
    Application, ApplicationFilter, ApplicationStats, ApplicationStatus, DeleteOutcome,
    InsertOutcome, StatusChange,
};
use crate::domains::crawling::{CrawlProgress, CrawlRequest, CrawlStatus};
use crate::domains::jobs::{JobPosting, JobSearch, JobSource, NewPosting, UpsertOutcome};
use crate::domains::metering::{ServiceTag, ServiceUsage, UsageRecord, UsageStats};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        tracing::info!("Migrations complete");

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Empty or whitespace-only filters do not filter.
fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// ============================================================================
// JOBS
// ============================================================================

#[derive(FromRow)]
struct UpsertRow {
    id: JobId,
    is_new: bool,
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn upsert_job(&self, posting: &NewPosting) -> Result<UpsertOutcome> {
        // xmax is zero only for a freshly inserted tuple
        let row = sqlx::query_as::<_, UpsertRow>(
            r#"
            INSERT INTO jobs (
                id, source, external_id, title, company, location, remote,
                salary_min, salary_max, description, source_url
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (source, external_id) DO UPDATE SET
                title = EXCLUDED.title,
                company = EXCLUDED.company,
                location = EXCLUDED.location,
                remote = EXCLUDED.remote,
                salary_min = EXCLUDED.salary_min,
                salary_max = EXCLUDED.salary_max,
                description = EXCLUDED.description,
                source_url = EXCLUDED.source_url,
                is_active = TRUE,
                last_seen_at = NOW()
            RETURNING id, (xmax = 0) AS is_new
            "#,
        )
        .bind(JobId::new())
        .bind(posting.source)
        .bind(&posting.external_id)
        .bind(&posting.title)
        .bind(&posting.company)
        .bind(&posting.location)
        .bind(posting.remote)
        .bind(posting.salary_min)
        .bind(posting.salary_max)
        .bind(&posting.description)
        .bind(&posting.source_url)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert job")?;

        Ok(UpsertOutcome {
            job_id: row.id,
            is_new: row.is_new,
        })
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobPosting>> {
        sqlx::query_as::<_, JobPosting>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn search_jobs(&self, search: &JobSearch) -> Result<Vec<JobPosting>> {
        sqlx::query_as::<_, JobPosting>(
            r#"
            SELECT * FROM jobs
            WHERE is_active
              AND ($1::text IS NULL
                   OR title ILIKE '%' || $1 || '%'
                   OR company ILIKE '%' || $1 || '%'
                   OR description ILIKE '%' || $1 || '%')
              AND ($2::text IS NULL OR location ILIKE '%' || $2 || '%')
              AND ($3::job_source IS NULL OR source = $3)
              AND (NOT $4 OR remote)
              AND ($5::integer IS NULL OR salary_min >= $5)
            ORDER BY last_seen_at DESC, id DESC
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(non_blank(&search.query))
        .bind(non_blank(&search.location))
        .bind(search.source)
        .bind(search.remote_only)
        .bind(search.min_salary)
        .bind(search.effective_limit())
        .bind(search.effective_offset())
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn deactivate_stale_jobs(
        &self,
        source: JobSource,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET is_active = FALSE WHERE source = $1 AND is_active AND last_seen_at < $2",
        )
        .bind(source)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// CRAWL REQUESTS
// ============================================================================

#[async_trait]
impl CrawlStore for PostgresStore {
    async fn insert_crawl_request(&self, request: &CrawlRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crawl_requests (id, user_id, search_query, location, source, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(request.id)
        .bind(request.user_id)
        .bind(&request.search_query)
        .bind(&request.location)
        .bind(request.source)
        .bind(request.status)
        .bind(request.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert crawl request")?;
        Ok(())
    }

    async fn get_crawl_request(&self, id: CrawlRequestId) -> Result<Option<CrawlRequest>> {
        sqlx::query_as::<_, CrawlRequest>("SELECT * FROM crawl_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn list_crawl_requests(&self, limit: i64) -> Result<Vec<CrawlRequest>> {
        sqlx::query_as::<_, CrawlRequest>(
            "SELECT * FROM crawl_requests ORDER BY created_at DESC, id DESC LIMIT $1",
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn transition_crawl_request(
        &self,
        id: CrawlRequestId,
        from: CrawlStatus,
        to: CrawlStatus,
        error_message: Option<String>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_requests SET
                status = $3,
                started_at = CASE WHEN $4 THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END,
                error_message = COALESCE($6, error_message)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(to == CrawlStatus::Running)
        .bind(to.is_terminal())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_crawl_progress(
        &self,
        id: CrawlRequestId,
        progress: CrawlProgress,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE crawl_requests SET jobs_found = $2, jobs_new = $3, pages_fetched = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(progress.jobs_found)
        .bind(progress.jobs_new)
        .bind(progress.pages_fetched)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_unfinished_crawls(&self, error_message: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_requests
            SET status = 'failed', error_message = $1, completed_at = NOW()
            WHERE status IN ('queued', 'running')
            "#,
        )
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// APPLICATIONS
// ============================================================================

#[derive(FromRow)]
struct StatsRow {
    total: i64,
    pending: i64,
    in_progress: i64,
    applied: i64,
    interviews: i64,
    failed: i64,
}

#[async_trait]
impl ApplicationStore for PostgresStore {
    async fn insert_application(&self, application: &Application) -> Result<InsertOutcome> {
        let inserted = sqlx::query_as::<_, Application>(
            r#"
            INSERT INTO applications (id, user_id, job_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, job_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(application.id)
        .bind(application.user_id)
        .bind(application.job_id)
        .bind(application.status)
        .bind(application.created_at)
        .bind(application.updated_at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to insert application")?;

        if let Some(app) = inserted {
            return Ok(InsertOutcome::Inserted(app));
        }

        let existing = self
            .find_application(application.user_id, application.job_id)
            .await?
            .with_context(|| {
                format!(
                    "application for user {} and job {} conflicted but no row was found",
                    application.user_id, application.job_id
                )
            })?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn get_application(&self, id: ApplicationId) -> Result<Option<Application>> {
        sqlx::query_as::<_, Application>("SELECT * FROM applications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    async fn find_application(
        &self,
        user_id: UserId,
        job_id: JobId,
    ) -> Result<Option<Application>> {
        sqlx::query_as::<_, Application>(
            "SELECT * FROM applications WHERE user_id = $1 AND job_id = $2",
        )
        .bind(user_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn transition_application(
        &self,
        id: ApplicationId,
        expected: ApplicationStatus,
        change: &StatusChange,
    ) -> Result<Option<Application>> {
        sqlx::query_as::<_, Application>(
            r#"
            UPDATE applications SET
                status = $3,
                error_message = CASE WHEN $4 THEN $5::text ELSE error_message END,
                diagnostic_ref = CASE WHEN $4 THEN $6::text ELSE diagnostic_ref END,
                automation_log = COALESCE($7::text[], automation_log),
                attempt_count = attempt_count + CASE WHEN $8 THEN 1 ELSE 0 END,
                last_attempt_at = CASE WHEN $8 THEN NOW() ELSE last_attempt_at END,
                applied_at = CASE WHEN $9 THEN NOW() ELSE applied_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(change.to)
        .bind(change.write_failure)
        .bind(&change.error_message)
        .bind(&change.diagnostic_ref)
        .bind(&change.automation_log)
        .bind(change.begin_attempt)
        .bind(change.mark_applied)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to move application {id} to {}", change.to))
    }

    async fn delete_application_if(
        &self,
        id: ApplicationId,
        allowed: &[ApplicationStatus],
    ) -> Result<DeleteOutcome> {
        let allowed: Vec<&'static str> = allowed.iter().map(|s| s.as_str()).collect();
        let deleted = sqlx::query(
            "DELETE FROM applications WHERE id = $1 AND status::text = ANY($2)",
        )
        .bind(id)
        .bind(&allowed)
        .execute(&self.pool)
        .await?;

        if deleted.rows_affected() == 1 {
            return Ok(DeleteOutcome::Deleted);
        }

        let status = sqlx::query_scalar::<_, ApplicationStatus>(
            "SELECT status FROM applications WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match status {
            Some(status) => DeleteOutcome::Rejected(status),
            None => DeleteOutcome::NotFound,
        })
    }

    async fn set_fit_score(&self, id: ApplicationId, score: f32) -> Result<()> {
        sqlx::query("UPDATE applications SET fit_score = $2 WHERE id = $1")
            .bind(id)
            .bind(score)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_applications(&self, filter: &ApplicationFilter) -> Result<Vec<Application>> {
        sqlx::query_as::<_, Application>(
            r#"
            SELECT * FROM applications
            WHERE user_id = $1 AND ($2::application_status IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.status)
        .bind(filter.limit.max(0))
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn applications_with_status(
        &self,
        status: ApplicationStatus,
    ) -> Result<Vec<Application>> {
        sqlx::query_as::<_, Application>(
            "SELECT * FROM applications WHERE status = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn application_stats(&self, user_id: UserId) -> Result<ApplicationStats> {
        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'in_progress') AS in_progress,
                COUNT(*) FILTER (WHERE status = 'applied') AS applied,
                COUNT(*) FILTER (WHERE status = 'interview') AS interviews,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM applications
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ApplicationStats {
            total: row.total,
            pending: row.pending,
            in_progress: row.in_progress,
            applied: row.applied,
            interviews: row.interviews,
            failed: row.failed,
            success_rate: 0.0,
        }
        .with_success_rate())
    }
}

// ============================================================================
// USAGE
// ============================================================================

#[derive(FromRow)]
struct ServiceUsageRow {
    service: ServiceTag,
    requests: i64,
    input_units: i64,
    output_units: i64,
    requests_today: i64,
    units_today: i64,
}

#[async_trait]
impl UsageStore for PostgresStore {
    async fn insert_usage(&self, record: &UsageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_records (id, user_id, service, input_units, output_units, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.service)
        .bind(record.input_units)
        .bind(record.output_units)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert usage record")?;
        Ok(())
    }

    async fn usage_stats(&self, user_id: UserId, day_start: DateTime<Utc>) -> Result<UsageStats> {
        let rows = sqlx::query_as::<_, ServiceUsageRow>(
            r#"
            SELECT
                service,
                COUNT(*) AS requests,
                COALESCE(SUM(input_units), 0)::BIGINT AS input_units,
                COALESCE(SUM(output_units), 0)::BIGINT AS output_units,
                COUNT(*) FILTER (WHERE recorded_at >= $2) AS requests_today,
                COALESCE(SUM(input_units + output_units) FILTER (WHERE recorded_at >= $2), 0)::BIGINT
                    AS units_today
            FROM usage_records
            WHERE user_id = $1
            GROUP BY service
            ORDER BY service
            "#,
        )
        .bind(user_id)
        .bind(day_start)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = UsageStats::default();
        for row in rows {
            let total = row.input_units + row.output_units;
            stats.total_requests += row.requests;
            stats.total_units += total;
            stats.input_units += row.input_units;
            stats.output_units += row.output_units;
            stats.requests_today += row.requests_today;
            stats.units_today += row.units_today;
            stats.by_service.push(ServiceUsage {
                service: row.service,
                requests: row.requests,
                total_units: total,
                input_units: row.input_units,
                output_units: row.output_units,
            });
        }
        Ok(stats)
    }
}
