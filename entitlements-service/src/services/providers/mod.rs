//! Hosted LLM backends for the chat proxy.
//!
//! [`GeminiChatProvider`] talks to Google's Gemini API; [`MockChatProvider`]
//! answers locally and backs demo mode without an API key and the tests.

pub mod gemini;
pub mod mock;

use crate::models::ChatMessage;
use async_trait::async_trait;
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;

pub use gemini::GeminiChatProvider;
pub use mock::MockChatProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Content filtered")]
    ContentFiltered,

    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Reason why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Complete,
    Length,
    ContentFilter,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Complete => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
        }
    }

    fn from_gemini(reason: &str) -> Self {
        match reason {
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => FinishReason::ContentFilter,
            _ => FinishReason::Complete,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text(String),
    /// Final chunk with usage stats.
    Complete {
        input_tokens: i64,
        output_tokens: i64,
        finish_reason: FinishReason,
    },
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, messages: &[ChatMessage]) -> Result<ProviderResponse, ProviderError>;

    async fn generate_stream(&self, messages: &[ChatMessage])
        -> Result<ProviderStream, ProviderError>;

    async fn health_check(&self) -> Result<(), ProviderError>;
}
