use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::models::{FetchedPage, PageToken};
use crate::domains::jobs::JobSource;
use crate::error::CrawlAdapterError;

/// One job board. The scheduler owns pagination, pacing and cancellation;
/// an adapter only fetches and normalizes a single page.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> JobSource;

    /// Fetch one page of results. `page` is `None` for the first page.
    async fn fetch_page(
        &self,
        query: &str,
        location: Option<&str>,
        page: Option<&PageToken>,
    ) -> Result<FetchedPage, CrawlAdapterError>;
}

/// Adapters keyed by the source they serve.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<JobSource, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter`, replacing any adapter for the same source.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        let source = adapter.source();
        if self.adapters.insert(source, adapter).is_some() {
            tracing::warn!(source = %source, "Replacing registered source adapter");
        }
    }

    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, source: JobSource) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&source).cloned()
    }

    pub fn supports(&self, source: JobSource) -> bool {
        self.adapters.contains_key(&source)
    }

    pub fn sources(&self) -> Vec<JobSource> {
        let mut sources: Vec<_> = self.adapters.keys().copied().collect();
        sources.sort_by_key(|s| s.as_str());
        sources
    }
}
