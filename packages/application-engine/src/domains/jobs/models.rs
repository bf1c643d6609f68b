use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::common::JobId;

// ============================================================================
// Enums
// ============================================================================

/// External job board a posting was discovered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    Linkedin,
    Indeed,
    Glassdoor,
    Ziprecruiter,
    Monster,
    Custom,
}

impl JobSource {
    pub const ALL: [JobSource; 6] = [
        JobSource::Linkedin,
        JobSource::Indeed,
        JobSource::Glassdoor,
        JobSource::Ziprecruiter,
        JobSource::Monster,
        JobSource::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Linkedin => "linkedin",
            JobSource::Indeed => "indeed",
            JobSource::Glassdoor => "glassdoor",
            JobSource::Ziprecruiter => "ziprecruiter",
            JobSource::Monster => "monster",
            JobSource::Custom => "custom",
        }
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobSource::ALL
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown job source: {s}"))
    }
}

// ============================================================================
// Job posting
// ============================================================================

/// A posting as persisted by the job registry.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: JobId,
    pub source: JobSource,
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub remote: bool,
    pub salary_min: Option<i32>,
    pub salary_max: Option<i32>,
    pub description: Option<String>,
    pub source_url: String,
    pub is_active: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl JobPosting {
    /// Build the row that a first sighting of `posting` inserts.
    pub fn first_seen(posting: &NewPosting, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            source: posting.source,
            external_id: posting.external_id.clone(),
            title: posting.title.clone(),
            company: posting.company.clone(),
            location: posting.location.clone(),
            remote: posting.remote,
            salary_min: posting.salary_min,
            salary_max: posting.salary_max,
            description: posting.description.clone(),
            source_url: posting.source_url.clone(),
            is_active: true,
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    /// Apply a re-sighting: refresh mutable fields, keep identity and
    /// `first_seen_at`.
    pub fn refresh(&mut self, posting: &NewPosting, now: DateTime<Utc>) {
        self.title = posting.title.clone();
        self.company = posting.company.clone();
        self.location = posting.location.clone();
        self.remote = posting.remote;
        self.salary_min = posting.salary_min;
        self.salary_max = posting.salary_max;
        self.description = posting.description.clone();
        self.source_url = posting.source_url.clone();
        self.is_active = true;
        self.last_seen_at = now;
    }
}

/// A posting as reported by a source adapter, before registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewPosting {
    pub source: JobSource,
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub source_url: String,
    #[builder(default, setter(strip_option))]
    pub location: Option<String>,
    #[builder(default = false)]
    pub remote: bool,
    #[builder(default, setter(strip_option))]
    pub salary_min: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub salary_max: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
}

/// Result of a registry upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub job_id: JobId,
    pub is_new: bool,
}

// ============================================================================
// Search
// ============================================================================

pub const DEFAULT_SEARCH_LIMIT: i64 = 20;
pub const MAX_SEARCH_LIMIT: i64 = 100;

/// Filter over active postings. Empty fields do not filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSearch {
    /// Case-insensitive match on title, company or description
    pub query: Option<String>,
    /// Case-insensitive substring of the location
    pub location: Option<String>,
    pub source: Option<JobSource>,
    #[serde(default)]
    pub remote_only: bool,
    /// Only postings whose `salary_min` is at least this
    pub min_salary: Option<i32>,
    #[serde(default)]
    pub offset: i64,
    pub limit: Option<i64>,
}

impl JobSearch {
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.max(0)
    }

    /// In-process evaluation of the filter, mirroring the SQL in the
    /// Postgres store.
    pub fn matches(&self, job: &JobPosting) -> bool {
        if !job.is_active {
            return false;
        }
        if let Some(query) = self.query.as_deref().filter(|q| !q.trim().is_empty()) {
            let needle = query.trim().to_lowercase();
            let hit = job.title.to_lowercase().contains(&needle)
                || job.company.to_lowercase().contains(&needle)
                || job
                    .description
                    .as_deref()
                    .is_some_and(|d| d.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        if let Some(location) = self.location.as_deref().filter(|l| !l.trim().is_empty()) {
            let needle = location.trim().to_lowercase();
            if !job
                .location
                .as_deref()
                .is_some_and(|l| l.to_lowercase().contains(&needle))
            {
                return false;
            }
        }
        if self.source.is_some_and(|source| source != job.source) {
            return false;
        }
        if self.remote_only && !job.remote {
            return false;
        }
        if let Some(min) = self.min_salary {
            if !job.salary_min.is_some_and(|salary| salary >= min) {
                return false;
            }
        }
        true
    }
}
