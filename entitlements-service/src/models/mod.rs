//! Domain models for entitlements-service.

mod audit;
mod billing;
mod chat;
mod entitlements;
mod plan;
mod usage;
mod webhook;

pub use audit::{AuditLogEntry, NewAuditEntry};
pub use billing::{TenantBilling, UpsertOutcome, UpsertTenantBilling};
pub use chat::{ChatMessage, ChatRequest, ChatResponse, ChatRole, TokenUsage};
pub use entitlements::{normalize, BillingSnapshot, EntitlementSource, Entitlements};
pub use plan::{BillingStatus, FeatureFlags, Plan, UsageLimits};
pub use usage::{next_period_start, period_start, AiUsage};
pub use webhook::{WebhookClaim, WebhookEventRecord, WebhookEventStatus};
