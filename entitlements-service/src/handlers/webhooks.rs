use crate::services::stripe::SIGNATURE_HEADER;
use crate::services::WebhookOutcome;
use crate::startup::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use service_core::error::AppError;

/// Stripe delivers here. The raw body is needed for signature verification.
#[tracing::instrument(skip(state, headers, body))]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let body = match state.webhooks.handle(signature, &body).await? {
        WebhookOutcome::Processed {
            event_id,
            tenant_id,
        } => json!({ "status": "processed", "event_id": event_id, "tenant_id": tenant_id }),
        WebhookOutcome::Ignored { event_id, reason } => {
            json!({ "status": "ignored", "event_id": event_id, "reason": reason })
        }
        WebhookOutcome::Duplicate { event_id } => {
            json!({ "status": "duplicate", "event_id": event_id })
        }
        WebhookOutcome::InFlight { event_id } => {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Event {} is already being processed",
                event_id
            )));
        }
    };

    Ok((StatusCode::OK, Json(body)))
}
