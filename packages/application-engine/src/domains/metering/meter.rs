use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use super::models::{utc_day_start, ServiceTag, UsageRecord, UsageStats, UsageUnits};
use crate::common::UserId;
use crate::kernel::UsageStore;

/// Append-only usage accounting.
///
/// Recording is best-effort: a failed write is logged and swallowed so that
/// metering can never fail the crawl or attempt it describes.
#[derive(Clone)]
pub struct UsageMeter {
    store: Arc<dyn UsageStore>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, user_id: Option<UserId>, service: ServiceTag, units: UsageUnits) {
        let record = UsageRecord::new(user_id, service, units);
        if let Err(e) = self.store.insert_usage(&record).await {
            tracing::warn!(
                service = %service,
                units = units.total(),
                error = %e,
                "Failed to record usage"
            );
        }
    }

    pub async fn stats(&self, user_id: UserId) -> Result<UsageStats> {
        self.store
            .usage_stats(user_id, utc_day_start(Utc::now()))
            .await
    }
}
