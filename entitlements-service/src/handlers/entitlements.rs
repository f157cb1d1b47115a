use crate::middleware::TenantContext;
use crate::models::Entitlements;
use crate::startup::AppState;
use axum::{extract::State, Json};
use service_core::error::AppError;

#[tracing::instrument(skip(state), fields(tenant_id = %tenant.tenant_id))]
pub async fn get_entitlements(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<Entitlements>, AppError> {
    Ok(Json(state.resolver.resolve(tenant.tenant_id).await))
}

/// Bypass the cache, e.g. right after the customer returns from checkout.
#[tracing::instrument(skip(state), fields(tenant_id = %tenant.tenant_id))]
pub async fn refresh_entitlements(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<Entitlements>, AppError> {
    let entitlements = state.resolver.refresh(tenant.tenant_id).await;
    tracing::info!(plan = %entitlements.plan, source = %entitlements.source, "Entitlements refreshed");
    Ok(Json(entitlements))
}
