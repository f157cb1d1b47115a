use crate::middleware::TenantContext;
use crate::models::AuditLogEntry;
use crate::startup::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct AuditLogParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AuditLogResponse {
    pub entries: Vec<AuditLogEntry>,
}

#[tracing::instrument(skip(state), fields(tenant_id = %tenant.tenant_id))]
pub async fn list_audit_log(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(params): Query<AuditLogParams>,
) -> Result<Json<AuditLogResponse>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let entries = state.store.list_audit(tenant.tenant_id, limit).await?;
    Ok(Json(AuditLogResponse { entries }))
}
