use crate::middleware::TenantContext;
use crate::models::{next_period_start, period_start};
use crate::startup::AppState;
use axum::{extract::State, Json};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub tenant_id: Uuid,
    pub period_start: NaiveDate,
    pub resets_at: DateTime<Utc>,
    pub messages_used: i64,
    /// `None` when the plan is unlimited.
    pub messages_limit: Option<i64>,
    pub messages_remaining: Option<i64>,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[tracing::instrument(skip(state), fields(tenant_id = %tenant.tenant_id))]
pub async fn get_usage(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<UsageResponse>, AppError> {
    let now = Utc::now();
    let period = period_start(now);
    let entitlements = state.resolver.resolve(tenant.tenant_id).await;
    let usage = state.store.get_ai_usage(tenant.tenant_id, period).await?;
    let limit = entitlements.limits.ai_messages_per_month;

    Ok(Json(UsageResponse {
        tenant_id: tenant.tenant_id,
        period_start: period,
        resets_at: next_period_start(now),
        messages_used: usage.message_count,
        messages_limit: limit,
        messages_remaining: limit.map(|l| (l - usage.message_count).max(0)),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
    }))
}
