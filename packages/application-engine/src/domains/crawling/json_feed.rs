//! Source adapter for paginated JSON job feeds.
//!
//! The feed answers `GET {endpoint}?q=..&location=..&page=..` with
//!
//! ```json
//! { "jobs": [{ "id": "42", "title": "..", "company": "..", "url": ".." }],
//!   "next_page": "2" }
//! ```
//!
//! Timeouts, connection errors, 429 and 5xx are transient; other 4xx
//! statuses and bodies that do not parse are permanent.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::adapter::SourceAdapter;
use super::models::{FetchedPage, PageToken};
use crate::domains::jobs::{JobSource, NewPosting};
use crate::error::CrawlAdapterError;

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    jobs: Vec<FeedJob>,
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedJob {
    id: String,
    title: String,
    company: String,
    url: String,
    location: Option<String>,
    #[serde(default)]
    remote: bool,
    salary_min: Option<i32>,
    salary_max: Option<i32>,
    description: Option<String>,
}

impl FeedJob {
    fn into_posting(self, source: JobSource) -> NewPosting {
        NewPosting {
            source,
            external_id: self.id,
            title: self.title,
            company: self.company,
            source_url: self.url,
            location: self.location,
            remote: self.remote,
            salary_min: self.salary_min,
            salary_max: self.salary_max,
            description: self.description,
        }
    }
}

pub struct JsonFeedAdapter {
    client: reqwest::Client,
    endpoint: String,
    source: JobSource,
}

impl JsonFeedAdapter {
    pub fn new(endpoint: impl Into<String>, source: JobSource, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for job feed")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            source,
        })
    }
}

fn classify_status(status: StatusCode, body: &str) -> CrawlAdapterError {
    let message = format!("feed returned {status}: {}", body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        CrawlAdapterError::Transient(message)
    } else {
        CrawlAdapterError::Permanent(message)
    }
}

#[async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn source(&self) -> JobSource {
        self.source
    }

    async fn fetch_page(
        &self,
        query: &str,
        location: Option<&str>,
        page: Option<&PageToken>,
    ) -> Result<FetchedPage, CrawlAdapterError> {
        let mut params = vec![("q", query)];
        if let Some(location) = location {
            params.push(("location", location));
        }
        if let Some(page) = page {
            params.push(("page", page.as_str()));
        }

        let resp = self
            .client
            .get(&self.endpoint)
            .query(&params)
            .send()
            .await
            .map_err(|e| CrawlAdapterError::Transient(format!("feed request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let feed: FeedResponse = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                CrawlAdapterError::Transient(format!("feed body timed out: {e}"))
            } else {
                CrawlAdapterError::Permanent(format!("malformed feed response: {e}"))
            }
        })?;

        tracing::debug!(
            source = %self.source,
            jobs = feed.jobs.len(),
            has_next = feed.next_page.is_some(),
            "Fetched feed page"
        );

        Ok(FetchedPage {
            postings: feed
                .jobs
                .into_iter()
                .map(|job| job.into_posting(self.source))
                .collect(),
            next_page: feed
                .next_page
                .filter(|token| !token.is_empty())
                .map(PageToken),
        })
    }
}
