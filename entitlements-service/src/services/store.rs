//! Persistence seam for billing state.
//!
//! [`Database`](super::Database) is the Postgres implementation;
//! [`MemoryStore`](super::MemoryStore) backs demo mode without a database
//! and the integration tests.

use crate::models::{
    AiUsage, AuditLogEntry, NewAuditEntry, TenantBilling, UpsertOutcome, UpsertTenantBilling,
    WebhookClaim, WebhookEventStatus,
};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use service_core::error::AppError;
use uuid::Uuid;

/// In-flight webhook claims older than this may be taken over by a redelivery.
pub const WEBHOOK_CLAIM_STALE_AFTER_SECS: i64 = 300;

pub fn webhook_claim_stale_after() -> Duration {
    Duration::seconds(WEBHOOK_CLAIM_STALE_AFTER_SECS)
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Cheap liveness probe used by `/ready`.
    async fn ping(&self) -> Result<(), AppError>;

    async fn get_tenant_billing(&self, tenant_id: Uuid) -> Result<Option<TenantBilling>, AppError>;

    async fn find_tenant_by_customer(&self, customer_id: &str) -> Result<Option<Uuid>, AppError>;

    async fn find_tenant_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Uuid>, AppError>;

    /// Insert or update a tenant's billing row.
    ///
    /// Last write wins by `event_at`: an input older than the stored
    /// `last_event_at` is not applied and the stored row is returned with
    /// `applied = false`. A missing `event_at` on either side always applies.
    async fn upsert_tenant_billing(
        &self,
        input: &UpsertTenantBilling,
    ) -> Result<UpsertOutcome, AppError>;

    /// Counters for the period, zeroed when the tenant has no usage yet.
    async fn get_ai_usage(&self, tenant_id: Uuid, period: NaiveDate) -> Result<AiUsage, AppError>;

    /// Atomically count one message against `limit`.
    ///
    /// Returns the new message count, or `None` when the limit is reached.
    /// A `None` limit means unlimited.
    async fn reserve_ai_message(
        &self,
        tenant_id: Uuid,
        period: NaiveDate,
        limit: Option<i64>,
    ) -> Result<Option<i64>, AppError>;

    /// Give back a reservation whose request never reached the model.
    async fn release_ai_message(&self, tenant_id: Uuid, period: NaiveDate) -> Result<(), AppError>;

    async fn add_ai_tokens(
        &self,
        tenant_id: Uuid,
        period: NaiveDate,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<(), AppError>;

    /// Claim a Stripe event id for processing.
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        stale_after: Duration,
    ) -> Result<WebhookClaim, AppError>;

    /// Mark a claimed event processed or ignored.
    async fn complete_webhook_event(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
    ) -> Result<(), AppError>;

    async fn fail_webhook_event(&self, event_id: &str, error: &str) -> Result<(), AppError>;

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<AuditLogEntry, AppError>;

    /// Newest first.
    async fn list_audit(&self, tenant_id: Uuid, limit: i64) -> Result<Vec<AuditLogEntry>, AppError>;
}
