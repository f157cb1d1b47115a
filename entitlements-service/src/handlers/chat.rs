use crate::middleware::TenantContext;
use crate::models::ChatRequest;
use crate::startup::AppState;
use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use service_core::error::AppError;

/// Metered chat. Replies as JSON, or as server-sent events when
/// `stream` is set.
#[tracing::instrument(skip(state, request), fields(tenant_id = %tenant.tenant_id, stream = request.stream))]
pub async fn chat(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(request): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let reservation = state.chat.authorize(tenant.tenant_id, &request).await?;

    if !request.stream {
        let response = state.chat.complete(reservation, &request.messages).await?;
        return Ok(Json(response).into_response());
    }

    let events = state
        .chat
        .stream(reservation, &request.messages)
        .await?
        .map(|event| Event::default().event(event.name()).json_data(&event));

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}
