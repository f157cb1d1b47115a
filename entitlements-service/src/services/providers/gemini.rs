//! Gemini chat provider.
//!
//! Uses `generateContent` for whole replies and
//! `streamGenerateContent?alt=sse` for streamed ones.

use super::{
    ChatProvider, FinishReason, ProviderError, ProviderResponse, ProviderStream, StreamChunk,
};
use crate::config::AiConfig;
use crate::models::{ChatMessage, ChatRole};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const API_KEY_HEADER: &str = "x-goog-api-key";

pub struct GeminiChatProvider {
    api_key: Secret<String>,
    model: String,
    api_base_url: String,
    client: Client,
}

impl GeminiChatProvider {
    pub fn new(api_key: Secret<String>, config: &AiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                ProviderError::NotConfigured(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            api_key,
            model: config.model.clone(),
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.api_base_url, self.model, method)
    }

    fn build_request(messages: &[ChatMessage]) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: messages
                .iter()
                .map(|m| Content {
                    role: Some(
                        match m.role {
                            ChatRole::User => "user",
                            ChatRole::Assistant => "model",
                        }
                        .to_string(),
                    ),
                    parts: vec![Part {
                        text: Some(m.content.clone()),
                    }],
                })
                .collect(),
        }
    }

    async fn post(
        &self,
        url: &str,
        messages: &[ChatMessage],
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .json(&Self::build_request(messages))
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        let error_text = response.text().await.unwrap_or_default();
        Err(ProviderError::ApiError(format!(
            "Gemini API error {}: {}",
            status, error_text
        )))
    }
}

fn candidate_text(response: &GenerateContentResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Raw SSE bytes. Events are decoded only once complete, so a character
/// split across network chunks survives.
#[derive(Debug, Default)]
struct SseBuffer {
    bytes: Vec<u8>,
}

impl SseBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_event(&mut self) -> Option<String> {
        let (end, delimiter_len) = [b"\r\n\r\n".as_slice(), b"\n\n".as_slice()]
            .into_iter()
            .filter_map(|delimiter| {
                self.bytes
                    .windows(delimiter.len())
                    .position(|window| window == delimiter)
                    .map(|pos| (pos, delimiter.len()))
            })
            .min_by_key(|(pos, _)| *pos)?;
        let event: Vec<u8> = self.bytes.drain(..end + delimiter_len).collect();
        Some(String::from_utf8_lossy(&event[..end]).replace("\r\n", "\n"))
    }
}

fn finish_reason(response: &GenerateContentResponse) -> Option<FinishReason> {
    response
        .candidates
        .first()
        .and_then(|c| c.finish_reason.as_deref())
        .map(FinishReason::from_gemini)
}

#[async_trait]
impl ChatProvider for GeminiChatProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<ProviderResponse, ProviderError> {
        tracing::debug!(
            model = %self.model,
            message_count = messages.len(),
            "Sending request to Gemini API"
        );

        let response = self.post(&self.api_url("generateContent"), messages).await?;
        let api_response: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ApiError(format!("Failed to parse response: {}", e)))?;

        let finish_reason = finish_reason(&api_response).unwrap_or(FinishReason::Complete);
        if finish_reason == FinishReason::ContentFilter {
            return Err(ProviderError::ContentFiltered);
        }
        let usage = api_response.usage_metadata.clone().unwrap_or_default();

        Ok(ProviderResponse {
            text: candidate_text(&api_response),
            input_tokens: usage.prompt_token_count.unwrap_or(0),
            output_tokens: usage.candidates_token_count.unwrap_or(0),
            finish_reason,
        })
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ProviderStream, ProviderError> {
        tracing::debug!(
            model = %self.model,
            message_count = messages.len(),
            "Starting streaming request to Gemini API"
        );

        let url = format!("{}?alt=sse", self.api_url("streamGenerateContent"));
        let response = self.post(&url, messages).await?;

        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = SseBuffer::default();
            let mut input_tokens = 0i64;
            let mut output_tokens = 0i64;
            let mut last_finish_reason = FinishReason::Complete;

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::NetworkError(e.to_string())))
                            .await;
                        return;
                    }
                };
                buffer.push(&chunk);

                while let Some(event) = buffer.next_event() {
                    for data in event.lines().filter_map(|l| l.strip_prefix("data:")) {
                        let Ok(parsed) =
                            serde_json::from_str::<GenerateContentResponse>(data.trim())
                        else {
                            continue;
                        };
                        // Usage is cumulative; the last report wins.
                        if let Some(usage) = &parsed.usage_metadata {
                            input_tokens = usage.prompt_token_count.unwrap_or(input_tokens);
                            output_tokens = usage.candidates_token_count.unwrap_or(output_tokens);
                        }
                        let text = candidate_text(&parsed);
                        if !text.is_empty() && tx.send(Ok(StreamChunk::Text(text))).await.is_err()
                        {
                            return;
                        }
                        if let Some(reason) = finish_reason(&parsed) {
                            last_finish_reason = reason;
                        }
                    }
                }
            }

            let _ = tx
                .send(Ok(StreamChunk::Complete {
                    input_tokens,
                    output_tokens,
                    finish_reason: last_finish_reason,
                }))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)) as ProviderStream)
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.api_key.expose_secret().is_empty() {
            return Err(ProviderError::NotConfigured(
                "Gemini API key not configured".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Gemini API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<i64>,
    candidates_token_count: Option<i64>,
}
