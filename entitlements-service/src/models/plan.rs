//! Plan, billing status and the feature/limit tables derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Subscription plan, ordered by tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Starter => "starter",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    /// Lenient conversion for stored values; anything unknown is `Free`.
    pub fn from_string(s: &str) -> Self {
        s.parse().unwrap_or(Plan::Free)
    }

    pub fn features(&self) -> FeatureFlags {
        match self {
            Plan::Free => FeatureFlags::default(),
            Plan::Starter => FeatureFlags {
                ai_chat: true,
                integrations: true,
                ..FeatureFlags::default()
            },
            Plan::Pro => FeatureFlags {
                ai_chat: true,
                advanced_analytics: true,
                integrations: true,
                data_export: true,
                priority_support: false,
            },
            Plan::Enterprise => FeatureFlags {
                ai_chat: true,
                advanced_analytics: true,
                integrations: true,
                data_export: true,
                priority_support: true,
            },
        }
    }

    pub fn limits(&self) -> UsageLimits {
        match self {
            Plan::Free => UsageLimits {
                ai_messages_per_month: Some(0),
                seats: Some(1),
            },
            Plan::Starter => UsageLimits {
                ai_messages_per_month: Some(200),
                seats: Some(5),
            },
            Plan::Pro => UsageLimits {
                ai_messages_per_month: Some(2_000),
                seats: Some(25),
            },
            Plan::Enterprise => UsageLimits {
                ai_messages_per_month: None,
                seats: None,
            },
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "starter" => Ok(Plan::Starter),
            "pro" => Ok(Plan::Pro),
            "enterprise" => Ok(Plan::Enterprise),
            other => Err(anyhow::anyhow!("unknown plan '{}'", other)),
        }
    }
}

/// Canonical billing status. Mirrors Stripe's subscription statuses plus
/// `expired` (lapsed trial or `incomplete_expired`) and `none`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Canceled,
    Incomplete,
    Expired,
    None,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Trialing => "trialing",
            BillingStatus::Active => "active",
            BillingStatus::PastDue => "past_due",
            BillingStatus::Unpaid => "unpaid",
            BillingStatus::Canceled => "canceled",
            BillingStatus::Incomplete => "incomplete",
            BillingStatus::Expired => "expired",
            BillingStatus::None => "none",
        }
    }

    /// Lenient conversion for stored values; anything unknown is `None`.
    pub fn from_string(s: &str) -> Self {
        s.parse().unwrap_or(BillingStatus::None)
    }

    /// Map a Stripe subscription status onto the canonical set.
    pub fn from_stripe(s: &str) -> Self {
        match s {
            "incomplete_expired" => BillingStatus::Expired,
            "paused" => BillingStatus::Canceled,
            other => BillingStatus::from_string(other),
        }
    }

    /// Whether the subscription can still produce paid access.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BillingStatus::Canceled | BillingStatus::Expired | BillingStatus::None
        )
    }
}

impl fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trialing" => Ok(BillingStatus::Trialing),
            "active" => Ok(BillingStatus::Active),
            "past_due" => Ok(BillingStatus::PastDue),
            "unpaid" => Ok(BillingStatus::Unpaid),
            "canceled" | "cancelled" => Ok(BillingStatus::Canceled),
            "incomplete" => Ok(BillingStatus::Incomplete),
            "expired" => Ok(BillingStatus::Expired),
            "none" => Ok(BillingStatus::None),
            other => Err(anyhow::anyhow!("unknown billing status '{}'", other)),
        }
    }
}

/// Feature gates exposed to the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub ai_chat: bool,
    pub advanced_analytics: bool,
    pub integrations: bool,
    pub data_export: bool,
    pub priority_support: bool,
}

/// Usage ceilings. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimits {
    pub ai_messages_per_month: Option<i64>,
    pub seats: Option<i64>,
}
