pub mod audit;
pub mod chat;
pub mod entitlements;
pub mod health;
pub mod usage;
pub mod webhooks;

pub use audit::list_audit_log;
pub use chat::chat;
pub use entitlements::{get_entitlements, refresh_entitlements};
pub use health::{health_check, metrics_handler, readiness_check};
pub use usage::get_usage;
pub use webhooks::stripe_webhook;
