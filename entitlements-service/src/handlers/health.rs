use crate::services::get_metrics;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Liveness: the process is up and serving.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": state.config.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "mode": state.config.mode.as_str(),
    }))
}

/// Readiness: the billing store answers. The chat provider is reported
/// but does not gate readiness.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let chat_provider = match state.chat.provider_health().await {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    };

    match state.store.ping().await {
        Ok(()) => {
            tracing::debug!("Readiness check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ready",
                    "chat_provider": state.chat.provider_name(),
                    "chat_provider_status": chat_provider,
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed - billing store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": e.to_string() })),
            )
        }
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
