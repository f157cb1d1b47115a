//! AI usage counters.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Monthly AI usage counters for a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AiUsage {
    pub tenant_id: Uuid,
    pub period_start: NaiveDate,
    pub message_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl AiUsage {
    pub fn empty(tenant_id: Uuid, period_start: NaiveDate) -> Self {
        Self {
            tenant_id,
            period_start,
            message_count: 0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// First day (UTC) of the usage period containing `now`.
pub fn period_start(now: DateTime<Utc>) -> NaiveDate {
    NaiveDate::from_ymd_opt(now.year(), now.month(), 1).unwrap_or_else(|| now.date_naive())
}

/// Start of the usage period following the one containing `now`.
pub fn next_period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}
