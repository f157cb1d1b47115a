//! Tenant context extractor.
//!
//! The gateway in front of this service authenticates the caller and forwards
//! the tenant it resolved in `X-Tenant-ID`.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const TENANT_HEADER: &str = "X-Tenant-ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing {} header", TENANT_HEADER))
            })?;

        let tenant_id = Uuid::parse_str(raw).map_err(|_| {
            AppError::BadRequest(anyhow::anyhow!("{} must be a UUID", TENANT_HEADER))
        })?;

        tracing::Span::current().record("tenant_id", tracing::field::display(tenant_id));

        Ok(Self { tenant_id })
    }
}
