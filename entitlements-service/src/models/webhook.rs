//! Webhook idempotency tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Processing state of a received Stripe event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Processing,
    Processed,
    Ignored,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Processing => "processing",
            WebhookEventStatus::Processed => "processed",
            WebhookEventStatus::Ignored => "ignored",
            WebhookEventStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "processed" => WebhookEventStatus::Processed,
            "ignored" => WebhookEventStatus::Ignored,
            "failed" => WebhookEventStatus::Failed,
            _ => WebhookEventStatus::Processing,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            WebhookEventStatus::Processed | WebhookEventStatus::Ignored
        )
    }
}

/// Outcome of trying to claim an event id for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookClaim {
    /// First delivery.
    New,
    /// Redelivery after a failure or a stale in-flight attempt.
    Retry { attempt: i32 },
    /// Already processed or ignored; nothing to do.
    AlreadyProcessed,
    /// Another delivery is processing this event right now.
    InFlight,
}

/// Row of `stripe_webhook_events`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub received_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub processed_utc: Option<DateTime<Utc>>,
}
