//! Tenant billing row.

use super::{BillingStatus, Plan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Canonical billing state for one tenant, as stored in `tenant_billing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TenantBilling {
    pub tenant_id: Uuid,
    pub plan: String,
    pub status: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub payment_failed_at: Option<DateTime<Utc>>,
    /// Creation time of the Stripe event (or lookup) that produced this row.
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl TenantBilling {
    pub fn plan(&self) -> Plan {
        Plan::from_string(&self.plan)
    }

    pub fn status(&self) -> BillingStatus {
        BillingStatus::from_string(&self.status)
    }

    /// Start an upsert from the stored row, keeping every field.
    pub fn to_upsert(&self) -> UpsertTenantBilling {
        UpsertTenantBilling {
            tenant_id: self.tenant_id,
            plan: self.plan(),
            status: self.status(),
            stripe_customer_id: self.stripe_customer_id.clone(),
            stripe_subscription_id: self.stripe_subscription_id.clone(),
            trial_ends_at: self.trial_ends_at,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            payment_failed_at: self.payment_failed_at,
            event_at: self.last_event_at,
        }
    }
}

/// Input for writing a tenant's billing row.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertTenantBilling {
    pub tenant_id: Uuid,
    pub plan: Plan,
    pub status: BillingStatus,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub payment_failed_at: Option<DateTime<Utc>>,
    /// Source event time. Writes older than the stored `last_event_at` are dropped.
    pub event_at: Option<DateTime<Utc>>,
}

impl UpsertTenantBilling {
    /// A blank row for a tenant that has never been billed.
    pub fn new(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            plan: Plan::Free,
            status: BillingStatus::None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            trial_ends_at: None,
            current_period_end: None,
            cancel_at_period_end: false,
            payment_failed_at: None,
            event_at: None,
        }
    }
}

/// Result of an upsert: the row now stored and whether the write was applied.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub row: TenantBilling,
    pub applied: bool,
}
