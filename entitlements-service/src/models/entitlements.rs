//! Resolved entitlements and the normalization rules that produce them.
//!
//! Every source (database row, Stripe subscription, demo override) is first
//! reduced to a [`BillingSnapshot`]; [`normalize`] then applies trial expiry,
//! grace periods and period-end access at a given instant. Features and
//! limits depend on the normalized plan only.

use super::{BillingStatus, FeatureFlags, Plan, TenantBilling, UpsertTenantBilling, UsageLimits};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which source of truth produced an entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementSource {
    Database,
    Stripe,
    DemoOverride,
    Default,
}

impl EntitlementSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementSource::Database => "database",
            EntitlementSource::Stripe => "stripe",
            EntitlementSource::DemoOverride => "demo_override",
            EntitlementSource::Default => "default",
        }
    }
}

impl fmt::Display for EntitlementSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw billing facts before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingSnapshot {
    pub plan: Plan,
    pub status: BillingStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub payment_failed_at: Option<DateTime<Utc>>,
}

impl BillingSnapshot {
    /// The fail-closed default: no plan, no status.
    pub fn unbilled() -> Self {
        Self {
            plan: Plan::Free,
            status: BillingStatus::None,
            trial_ends_at: None,
            current_period_end: None,
            cancel_at_period_end: false,
            payment_failed_at: None,
        }
    }
}

impl From<&TenantBilling> for BillingSnapshot {
    fn from(row: &TenantBilling) -> Self {
        Self {
            plan: row.plan(),
            status: row.status(),
            trial_ends_at: row.trial_ends_at,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            payment_failed_at: row.payment_failed_at,
        }
    }
}

impl From<&UpsertTenantBilling> for BillingSnapshot {
    fn from(row: &UpsertTenantBilling) -> Self {
        Self {
            plan: row.plan,
            status: row.status,
            trial_ends_at: row.trial_ends_at,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            payment_failed_at: row.payment_failed_at,
        }
    }
}

/// What a tenant may do right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlements {
    pub tenant_id: Uuid,
    pub plan: Plan,
    pub status: BillingStatus,
    pub features: FeatureFlags,
    pub limits: UsageLimits,
    pub source: EntitlementSource,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub grace_period_ends_at: Option<DateTime<Utc>>,
    /// When paid access ends without further action (trial end, period end
    /// of a canceled subscription).
    pub access_ends_at: Option<DateTime<Utc>>,
    pub in_grace_period: bool,
    pub resolved_at: DateTime<Utc>,
}

impl Entitlements {
    /// Earliest future instant at which this result changes on its own.
    pub fn next_transition(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        [
            self.trial_ends_at,
            self.grace_period_ends_at,
            self.access_ends_at,
        ]
        .into_iter()
        .flatten()
        .filter(|t| *t > now)
        .min()
    }
}

/// Apply trial, grace-period and period-end rules to a snapshot at `now`.
pub fn normalize(
    tenant_id: Uuid,
    snapshot: &BillingSnapshot,
    source: EntitlementSource,
    now: DateTime<Utc>,
    grace_period: Duration,
) -> Entitlements {
    let mut plan = snapshot.plan;
    let mut status = snapshot.status;
    let mut trial_ends_at = snapshot.trial_ends_at;
    let mut grace_period_ends_at = None;
    let mut access_ends_at = None;
    let mut in_grace_period = false;

    match snapshot.status {
        BillingStatus::Trialing => match snapshot.trial_ends_at {
            Some(end) if end > now => {
                access_ends_at = Some(end);
                // A trial always grants premium access.
                if plan == Plan::Free {
                    plan = Plan::Pro;
                }
            }
            _ => {
                plan = Plan::Free;
                status = BillingStatus::Expired;
            }
        },
        BillingStatus::PastDue | BillingStatus::Unpaid => {
            // Without any anchor the grace period is treated as already spent.
            let anchor = snapshot
                .payment_failed_at
                .or(snapshot.current_period_end);
            match anchor.map(|a| a.checked_add_signed(grace_period)) {
                // Ends past the representable range, so it never ends.
                Some(None) => in_grace_period = true,
                Some(Some(end)) if now < end => {
                    grace_period_ends_at = Some(end);
                    in_grace_period = true;
                }
                end => {
                    grace_period_ends_at = end.flatten();
                    plan = Plan::Free;
                }
            }
        }
        BillingStatus::Canceled => match snapshot.current_period_end {
            Some(end) if end > now => access_ends_at = Some(end),
            _ => plan = Plan::Free,
        },
        BillingStatus::Active => {
            if snapshot.cancel_at_period_end {
                match snapshot.current_period_end {
                    Some(end) if end > now => access_ends_at = Some(end),
                    Some(_) => {
                        plan = Plan::Free;
                        status = BillingStatus::Canceled;
                    }
                    None => {}
                }
            }
        }
        BillingStatus::Incomplete | BillingStatus::Expired | BillingStatus::None => {
            plan = Plan::Free;
        }
    }

    if !matches!(status, BillingStatus::Trialing | BillingStatus::Expired) {
        trial_ends_at = None;
    }

    Entitlements {
        tenant_id,
        plan,
        status,
        features: plan.features(),
        limits: plan.limits(),
        source,
        trial_ends_at,
        grace_period_ends_at,
        access_ends_at,
        in_grace_period,
        resolved_at: now,
    }
}
