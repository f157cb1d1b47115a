//! Billing audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditLogEntry {
    pub entry_id: Uuid,
    pub tenant_id: Uuid,
    pub action: String,
    pub actor: String,
    pub details: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub tenant_id: Uuid,
    pub action: String,
    pub actor: String,
    pub details: Option<serde_json::Value>,
}
