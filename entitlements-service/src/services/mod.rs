//! Services module for entitlements-service.

pub mod cache;
pub mod chat;
pub mod database;
pub mod entitlements;
pub mod memory;
pub mod metrics;
pub mod providers;
pub mod redaction;
pub mod store;
pub mod stripe;
pub mod webhook;

pub use cache::EntitlementsCache;
pub use chat::{ChatEventStream, ChatGateway, ChatReservation, ChatStreamEvent};
pub use database::Database;
pub use entitlements::EntitlementsResolver;
pub use memory::MemoryStore;
pub use metrics::{
    get_metrics, init_metrics, record_ai_tokens, record_cache_lookup, record_chat_request,
    record_error, record_resolution, record_webhook_event,
};
pub use providers::{ChatProvider, GeminiChatProvider, MockChatProvider, ProviderError};
pub use store::BillingStore;
pub use stripe::{StripeClient, SubscriptionLookup};
pub use webhook::{BillingWebhookProcessor, WebhookOutcome};
