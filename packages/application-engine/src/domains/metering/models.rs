use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::common::{UsageRecordId, UserId};

/// Service a usage record is billed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "usage_service", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceTag {
    Crawl,
    Matching,
    FormFill,
}

impl ServiceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceTag::Crawl => "crawl",
            ServiceTag::Matching => "matching",
            ServiceTag::FormFill => "form_fill",
        }
    }
}

impl fmt::Display for ServiceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Units consumed by one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageUnits {
    pub input: i64,
    pub output: i64,
}

impl UsageUnits {
    /// Units with no input/output split (page fetches, automation steps).
    pub fn flat(units: i64) -> Self {
        Self {
            input: units,
            output: 0,
        }
    }

    pub fn split(input: i64, output: i64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> i64 {
        self.input + self.output
    }
}

/// Append-only accounting row.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: UsageRecordId,
    pub user_id: Option<UserId>,
    pub service: ServiceTag,
    pub input_units: i64,
    pub output_units: i64,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(user_id: Option<UserId>, service: ServiceTag, units: UsageUnits) -> Self {
        Self {
            id: UsageRecordId::new(),
            user_id,
            service,
            input_units: units.input,
            output_units: units.output,
            recorded_at: Utc::now(),
        }
    }

    pub fn total_units(&self) -> i64 {
        self.input_units + self.output_units
    }
}

/// Aggregate for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceUsage {
    pub service: ServiceTag,
    pub requests: i64,
    pub total_units: i64,
    pub input_units: i64,
    pub output_units: i64,
}

/// Aggregate usage for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub total_requests: i64,
    pub total_units: i64,
    pub input_units: i64,
    pub output_units: i64,
    pub requests_today: i64,
    pub units_today: i64,
    /// Sorted by service tag
    pub by_service: Vec<ServiceUsage>,
}

impl UsageStats {
    /// Fold raw records into stats; `day_start` bounds the "today" counters.
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a UsageRecord>,
        day_start: DateTime<Utc>,
    ) -> Self {
        let mut stats = UsageStats::default();
        for record in records {
            let total = record.total_units();
            stats.total_requests += 1;
            stats.total_units += total;
            stats.input_units += record.input_units;
            stats.output_units += record.output_units;
            if record.recorded_at >= day_start {
                stats.requests_today += 1;
                stats.units_today += total;
            }

            match stats
                .by_service
                .iter_mut()
                .find(|s| s.service == record.service)
            {
                Some(entry) => {
                    entry.requests += 1;
                    entry.total_units += total;
                    entry.input_units += record.input_units;
                    entry.output_units += record.output_units;
                }
                None => stats.by_service.push(ServiceUsage {
                    service: record.service,
                    requests: 1,
                    total_units: total,
                    input_units: record.input_units,
                    output_units: record.output_units,
                }),
            }
        }
        stats.by_service.sort_by_key(|s| s.service);
        stats
    }
}

/// Midnight UTC of the day containing `now`.
pub fn utc_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}
