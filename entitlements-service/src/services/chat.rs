//! Metered AI chat.
//!
//! A request is validated, checked against the tenant's `ai_chat` feature,
//! counted against the monthly message allowance and only then forwarded to
//! the provider. Token usage is recorded once the provider reports it.

use crate::models::{
    next_period_start, period_start, ChatMessage, ChatRequest, ChatResponse, TokenUsage,
};
use crate::services::entitlements::EntitlementsResolver;
use crate::services::metrics::{record_ai_tokens, record_chat_request};
use crate::services::providers::{ChatProvider, ProviderError, StreamChunk};
use crate::services::redaction::{redact, StreamRedactor};
use crate::services::store::BillingStore;
use chrono::{NaiveDate, Utc};
use futures::StreamExt;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// One counted message, held between authorization and completion.
#[derive(Debug, Clone, Copy)]
pub struct ChatReservation {
    pub tenant_id: Uuid,
    pub period: NaiveDate,
    pub message_count: i64,
}

/// Events relayed to the client on a streamed chat.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChatStreamEvent {
    Delta {
        text: String,
    },
    Done {
        input_tokens: i64,
        output_tokens: i64,
        finish_reason: String,
    },
    Error {
        message: String,
    },
}

impl ChatStreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatStreamEvent::Delta { .. } => "delta",
            ChatStreamEvent::Done { .. } => "done",
            ChatStreamEvent::Error { .. } => "error",
        }
    }
}

pub type ChatEventStream = ReceiverStream<ChatStreamEvent>;

pub struct ChatGateway {
    store: Arc<dyn BillingStore>,
    resolver: Arc<EntitlementsResolver>,
    provider: Arc<dyn ChatProvider>,
    redact_pii: bool,
}

fn provider_error(e: ProviderError) -> AppError {
    match e {
        ProviderError::NotConfigured(msg) => AppError::ServiceUnavailable(msg),
        ProviderError::RateLimited => {
            AppError::ServiceUnavailable("AI provider is rate limiting requests".to_string())
        }
        ProviderError::ContentFiltered => {
            AppError::BadRequest(anyhow::anyhow!("The reply was blocked by the content filter"))
        }
        ProviderError::ApiError(msg) | ProviderError::NetworkError(msg) => {
            AppError::BadGateway(msg)
        }
    }
}

impl ChatGateway {
    pub fn new(
        store: Arc<dyn BillingStore>,
        resolver: Arc<EntitlementsResolver>,
        provider: Arc<dyn ChatProvider>,
        redact_pii: bool,
    ) -> Self {
        Self {
            store,
            resolver,
            provider,
            redact_pii,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub async fn provider_health(&self) -> Result<(), ProviderError> {
        self.provider.health_check().await
    }

    /// Validate the request, check the feature flag and count one message.
    #[instrument(skip(self, request), fields(tenant_id = %tenant_id))]
    pub async fn authorize(
        &self,
        tenant_id: Uuid,
        request: &ChatRequest,
    ) -> Result<ChatReservation, AppError> {
        request.validate()?;
        if let Some(problem) = request.conversation_error() {
            return Err(AppError::BadRequest(anyhow::anyhow!(problem)));
        }

        let entitlements = self.resolver.resolve(tenant_id).await;
        if !entitlements.features.ai_chat {
            record_chat_request("forbidden");
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "AI chat is not included in the {} plan",
                entitlements.plan
            )));
        }

        let now = Utc::now();
        let period = period_start(now);
        let limit = entitlements.limits.ai_messages_per_month;
        match self.store.reserve_ai_message(tenant_id, period, limit).await? {
            Some(message_count) => Ok(ChatReservation {
                tenant_id,
                period,
                message_count,
            }),
            None => {
                record_chat_request("quota_exceeded");
                let retry_after = (next_period_start(now) - now).num_seconds().max(1) as u64;
                Err(AppError::TooManyRequests(
                    format!(
                        "Monthly AI message limit of {} reached",
                        limit.unwrap_or_default()
                    ),
                    Some(retry_after),
                ))
            }
        }
    }

    fn outbound(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: if self.redact_pii {
                    redact(&m.content)
                } else {
                    m.content.clone()
                },
            })
            .collect()
    }

    async fn release(&self, reservation: &ChatReservation) {
        if let Err(e) = self
            .store
            .release_ai_message(reservation.tenant_id, reservation.period)
            .await
        {
            warn!(error = %e, "Failed to release AI message reservation");
        }
    }

    /// Whole-reply chat.
    #[instrument(skip(self, messages), fields(tenant_id = %reservation.tenant_id))]
    pub async fn complete(
        &self,
        reservation: ChatReservation,
        messages: &[ChatMessage],
    ) -> Result<ChatResponse, AppError> {
        let response = match self.provider.generate(&self.outbound(messages)).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, provider = self.provider.name(), "AI provider request failed");
                record_chat_request("provider_error");
                self.release(&reservation).await;
                return Err(provider_error(e));
            }
        };

        record_usage(
            self.store.as_ref(),
            &reservation,
            response.input_tokens,
            response.output_tokens,
        )
        .await;
        record_chat_request("completed");

        Ok(ChatResponse {
            reply: if self.redact_pii {
                redact(&response.text)
            } else {
                response.text
            },
            usage: TokenUsage {
                input_tokens: response.input_tokens,
                output_tokens: response.output_tokens,
            },
            finish_reason: response.finish_reason.as_str().to_string(),
        })
    }

    /// Streamed chat. Token usage is recorded even if the client goes away
    /// before the provider finishes.
    #[instrument(skip(self, messages), fields(tenant_id = %reservation.tenant_id))]
    pub async fn stream(
        &self,
        reservation: ChatReservation,
        messages: &[ChatMessage],
    ) -> Result<ChatEventStream, AppError> {
        let mut upstream = match self.provider.generate_stream(&self.outbound(messages)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, provider = self.provider.name(), "AI provider stream failed to start");
                record_chat_request("provider_error");
                self.release(&reservation).await;
                return Err(provider_error(e));
            }
        };

        let (tx, rx) = mpsc::channel(32);
        let store = self.store.clone();
        let mut redactor = self.redact_pii.then(StreamRedactor::new);

        tokio::spawn(async move {
            let mut client_gone = false;
            let send = |event: ChatStreamEvent| {
                let tx = tx.clone();
                async move { tx.send(event).await.is_ok() }
            };

            while let Some(item) = upstream.next().await {
                match item {
                    Ok(StreamChunk::Text(text)) => {
                        let text = match redactor.as_mut() {
                            Some(r) => r.push(&text),
                            None => text,
                        };
                        if !text.is_empty() && !client_gone {
                            client_gone = !send(ChatStreamEvent::Delta { text }).await;
                        }
                    }
                    Ok(StreamChunk::Complete {
                        input_tokens,
                        output_tokens,
                        finish_reason,
                    }) => {
                        if let Some(tail) = redactor.take().map(StreamRedactor::finish) {
                            if !tail.is_empty() && !client_gone {
                                client_gone = !send(ChatStreamEvent::Delta { text: tail }).await;
                            }
                        }
                        record_usage(store.as_ref(), &reservation, input_tokens, output_tokens)
                            .await;
                        record_chat_request("completed");
                        if !client_gone {
                            send(ChatStreamEvent::Done {
                                input_tokens,
                                output_tokens,
                                finish_reason: finish_reason.as_str().to_string(),
                            })
                            .await;
                        }
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "AI provider stream failed");
                        record_chat_request("stream_error");
                        send(ChatStreamEvent::Error {
                            message: provider_error(e).to_string(),
                        })
                        .await;
                        return;
                    }
                }
            }

            // Upstream ended without a completion marker.
            record_chat_request("stream_error");
            send(ChatStreamEvent::Error {
                message: "AI provider closed the stream early".to_string(),
            })
            .await;
        });

        Ok(ReceiverStream::new(rx))
    }
}

async fn record_usage(
    store: &dyn BillingStore,
    reservation: &ChatReservation,
    input_tokens: i64,
    output_tokens: i64,
) {
    record_ai_tokens(
        &reservation.tenant_id.to_string(),
        input_tokens,
        output_tokens,
    );
    match store
        .add_ai_tokens(
            reservation.tenant_id,
            reservation.period,
            input_tokens,
            output_tokens,
        )
        .await
    {
        Ok(()) => info!(
            tenant_id = %reservation.tenant_id,
            message_count = reservation.message_count,
            input_tokens = input_tokens,
            output_tokens = output_tokens,
            "AI usage recorded"
        ),
        Err(e) => warn!(error = %e, tenant_id = %reservation.tenant_id, "Failed to record AI token usage"),
    }
}
