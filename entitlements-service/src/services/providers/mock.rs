//! Local provider used when no Gemini key is configured.

use super::{
    ChatProvider, FinishReason, ProviderError, ProviderResponse, ProviderStream, StreamChunk,
};
use crate::models::ChatMessage;
use async_trait::async_trait;

pub struct MockChatProvider;

impl MockChatProvider {
    pub fn new() -> Self {
        Self
    }

    fn reply_to(messages: &[ChatMessage]) -> String {
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        format!("Mock response for: {}", prompt)
    }

    fn input_tokens(messages: &[ChatMessage]) -> i64 {
        messages.iter().map(|m| m.content.len() as i64 / 4).sum::<i64>().max(1)
    }
}

impl Default for MockChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<ProviderResponse, ProviderError> {
        let text = Self::reply_to(messages);
        Ok(ProviderResponse {
            output_tokens: text.split_whitespace().count() as i64,
            input_tokens: Self::input_tokens(messages),
            text,
            finish_reason: FinishReason::Complete,
        })
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ProviderStream, ProviderError> {
        let text = Self::reply_to(messages);
        let output_tokens = text.split_whitespace().count() as i64;

        let mut chunks: Vec<Result<StreamChunk, ProviderError>> = text
            .split_inclusive(' ')
            .map(|word| Ok(StreamChunk::Text(word.to_string())))
            .collect();
        chunks.push(Ok(StreamChunk::Complete {
            input_tokens: Self::input_tokens(messages),
            output_tokens,
            finish_reason: FinishReason::Complete,
        }));

        Ok(Box::pin(tokio_stream::iter(chunks)))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
