//! Configuration module for entitlements-service.
//!
//! The config is a typed snapshot of the environment. Which secrets are
//! mandatory depends on the deployment mode: production needs everything,
//! development needs a database, demo runs with stubs for anything missing.

use crate::models::{BillingSnapshot, BillingStatus, Plan};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com/v1";
const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Upper bound for `BILLING_GRACE_PERIOD_DAYS`.
const MAX_GRACE_PERIOD_DAYS: u32 = 3650;

static SNAPSHOT: OnceLock<EntitlementsConfig> = OnceLock::new();

/// Deployment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Production,
    Development,
    Demo,
}

impl AppMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppMode::Production => "production",
            AppMode::Development => "development",
            AppMode::Demo => "demo",
        }
    }

    pub fn is_demo(&self) -> bool {
        matches!(self, AppMode::Demo)
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(AppMode::Production),
            "development" | "dev" => Ok(AppMode::Development),
            "demo" => Ok(AppMode::Demo),
            other => Err(anyhow::anyhow!("unknown APP_MODE '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntitlementsConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub mode: AppMode,
    /// Absent only in demo mode, where an in-memory store is used.
    pub database: Option<DatabaseConfig>,
    pub stripe: StripeConfig,
    pub entitlements: EntitlementsPolicyConfig,
    pub demo: DemoConfig,
    pub ai: AiConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: Option<Secret<String>>,
    pub webhook_secret: Option<Secret<String>>,
    pub api_base_url: String,
    pub webhook_tolerance_secs: i64,
    pub prices: PlanPriceMap,
}

/// Stripe price id → plan.
#[derive(Debug, Clone, Default)]
pub struct PlanPriceMap {
    pub starter: Option<String>,
    pub pro: Option<String>,
    pub enterprise: Option<String>,
}

impl PlanPriceMap {
    pub fn plan_for_price(&self, price_id: &str) -> Option<Plan> {
        [
            (&self.starter, Plan::Starter),
            (&self.pro, Plan::Pro),
            (&self.enterprise, Plan::Enterprise),
        ]
        .into_iter()
        .find(|(id, _)| id.as_deref() == Some(price_id))
        .map(|(_, plan)| plan)
    }
}

#[derive(Debug, Clone)]
pub struct EntitlementsPolicyConfig {
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub grace_period_days: i64,
}

impl EntitlementsPolicyConfig {
    pub fn grace_period(&self) -> ChronoDuration {
        ChronoDuration::try_days(self.grace_period_days).unwrap_or(ChronoDuration::MAX)
    }
}

/// Billing state served to every tenant in demo mode.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub plan: Plan,
    pub status: BillingStatus,
    /// Fixed when the config is loaded so the demo trial counts down.
    pub trial_ends_at: DateTime<Utc>,
}

impl DemoConfig {
    pub fn snapshot(&self) -> BillingSnapshot {
        BillingSnapshot {
            plan: self.plan,
            status: self.status,
            trial_ends_at: Some(self.trial_ends_at),
            current_period_end: Some(self.trial_ends_at),
            cancel_at_period_end: false,
            payment_failed_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    /// Absent only outside production; the mock provider is used instead.
    pub gemini_api_key: Option<Secret<String>>,
    pub model: String,
    pub api_base_url: String,
    pub request_timeout: Duration,
}

impl EntitlementsConfig {
    /// Load from the process environment (and `.env`).
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let common = core_config::Config::load()?;
        Self::from_lookup(common, |key| env::var(key).ok())
    }

    /// Memoized [`from_env`](Self::from_env): the first successful load is
    /// reused for the lifetime of the process.
    pub fn snapshot() -> Result<&'static Self, AppError> {
        Self::snapshot_or_load(Self::from_env)
    }

    fn snapshot_or_load<F>(load: F) -> Result<&'static Self, AppError>
    where
        F: FnOnce() -> Result<Self, AppError>,
    {
        if let Some(config) = SNAPSHOT.get() {
            return Ok(config);
        }
        let loaded = load()?;
        Ok(SNAPSHOT.get_or_init(|| loaded))
    }

    /// Build the config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(common: core_config::Config, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secret = |key: &str| get(key).map(Secret::new);

        let mode = match get("APP_MODE") {
            Some(raw) => raw.parse::<AppMode>().map_err(AppError::ConfigError)?,
            None => AppMode::Production,
        };

        let required: &[&str] = match mode {
            AppMode::Production => &[
                "DATABASE_URL",
                "STRIPE_SECRET_KEY",
                "STRIPE_WEBHOOK_SECRET",
                "GEMINI_API_KEY",
            ],
            AppMode::Development => &["DATABASE_URL"],
            AppMode::Demo => &[],
        };
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|key| get(key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "{} required in {} mode but not set",
                missing.join(", "),
                mode
            )));
        }

        let database = get("DATABASE_URL").map(|url| DatabaseConfig {
            url: Secret::new(url),
            max_connections: parse_or(get("DATABASE_MAX_CONNECTIONS"), 10),
            min_connections: parse_or(get("DATABASE_MIN_CONNECTIONS"), 2),
        });

        let demo_plan = match get("DEMO_PLAN") {
            Some(raw) => raw.parse::<Plan>().map_err(AppError::ConfigError)?,
            None => Plan::Pro,
        };
        let demo_status = match get("DEMO_BILLING_STATUS") {
            Some(raw) => raw.parse::<BillingStatus>().map_err(AppError::ConfigError)?,
            None => BillingStatus::Trialing,
        };
        let demo_trial_ends_at = match get("DEMO_TRIAL_ENDS_AT") {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!("invalid DEMO_TRIAL_ENDS_AT: {}", e))
                })?,
            None => {
                let days: u32 = parse_or(get("DEMO_TRIAL_DAYS"), 14);
                ChronoDuration::try_days(i64::from(days))
                    .and_then(|trial| Utc::now().checked_add_signed(trial))
                    .ok_or_else(|| {
                        AppError::ConfigError(anyhow::anyhow!(
                            "DEMO_TRIAL_DAYS={} is out of range",
                            days
                        ))
                    })?
            }
        };
        let grace_period_days: u32 = parse_or(get("BILLING_GRACE_PERIOD_DAYS"), 7);
        if grace_period_days > MAX_GRACE_PERIOD_DAYS {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BILLING_GRACE_PERIOD_DAYS={} exceeds {}",
                grace_period_days,
                MAX_GRACE_PERIOD_DAYS
            )));
        }

        Ok(Self {
            common,
            service_name: get("SERVICE_NAME").unwrap_or_else(|| "entitlements-service".to_string()),
            service_version: get("SERVICE_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            otlp_endpoint: get("OTLP_ENDPOINT"),
            mode,
            database,
            stripe: StripeConfig {
                secret_key: secret("STRIPE_SECRET_KEY"),
                webhook_secret: secret("STRIPE_WEBHOOK_SECRET"),
                api_base_url: get("STRIPE_API_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_STRIPE_API_BASE.to_string()),
                webhook_tolerance_secs: i64::from(parse_or::<u32>(
                    get("STRIPE_WEBHOOK_TOLERANCE_SECS"),
                    300,
                )),
                prices: PlanPriceMap {
                    starter: get("STRIPE_PRICE_STARTER"),
                    pro: get("STRIPE_PRICE_PRO"),
                    enterprise: get("STRIPE_PRICE_ENTERPRISE"),
                },
            },
            entitlements: EntitlementsPolicyConfig {
                cache_ttl: Duration::from_secs(parse_or(get("ENTITLEMENTS_CACHE_TTL_SECS"), 60)),
                cache_sweep_interval: Duration::from_secs(
                    parse_or::<u64>(get("ENTITLEMENTS_CACHE_SWEEP_SECS"), 300).max(1),
                ),
                grace_period_days: i64::from(grace_period_days),
            },
            demo: DemoConfig {
                plan: demo_plan,
                status: demo_status,
                trial_ends_at: demo_trial_ends_at,
            },
            ai: AiConfig {
                gemini_api_key: secret("GEMINI_API_KEY"),
                model: get("GEMINI_MODEL").unwrap_or_else(|| "gemini-2.0-flash".to_string()),
                api_base_url: get("GEMINI_API_BASE")
                    .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
                request_timeout: Duration::from_secs(parse_or(get("AI_REQUEST_TIMEOUT_SECS"), 120)),
            },
        })
    }

    pub fn stripe_enabled(&self) -> bool {
        self.stripe
            .secret_key
            .as_ref()
            .is_some_and(|k| !k.expose_secret().is_empty())
    }
}

/// Parse an optional value, falling back to `default` when it is unset or
/// does not fit `T`.
fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<EntitlementsConfig, AppError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EntitlementsConfig::from_lookup(core_config::Config::default(), |k| map.get(k).cloned())
    }

    #[test]
    fn production_requires_every_secret() {
        let err = load(&[("DATABASE_URL", "postgres://localhost/db")]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("STRIPE_SECRET_KEY"));
        assert!(message.contains("STRIPE_WEBHOOK_SECRET"));
        assert!(message.contains("GEMINI_API_KEY"));
        assert!(!message.contains("DATABASE_URL"));
    }

    #[test]
    fn production_loads_with_all_secrets() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/db"),
            ("STRIPE_SECRET_KEY", "sk_test_123"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_123"),
            ("GEMINI_API_KEY", "key"),
            ("STRIPE_PRICE_PRO", "price_pro"),
        ])
        .unwrap();

        assert_eq!(config.mode, AppMode::Production);
        assert!(config.stripe_enabled());
        assert_eq!(config.stripe.webhook_tolerance_secs, 300);
        assert_eq!(config.stripe.prices.plan_for_price("price_pro"), Some(Plan::Pro));
        assert_eq!(config.stripe.prices.plan_for_price("price_other"), None);
        assert_eq!(config.entitlements.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.entitlements.grace_period_days, 7);
    }

    #[test]
    fn development_only_needs_database() {
        assert!(load(&[("APP_MODE", "development")]).is_err());
        let config = load(&[
            ("APP_MODE", "dev"),
            ("DATABASE_URL", "postgres://localhost/db"),
        ])
        .unwrap();
        assert_eq!(config.mode, AppMode::Development);
        assert!(!config.stripe_enabled());
        assert!(config.ai.gemini_api_key.is_none());
    }

    #[test]
    fn demo_mode_runs_without_secrets() {
        let config = load(&[("APP_MODE", "demo"), ("DEMO_TRIAL_DAYS", "3")]).unwrap();
        assert!(config.mode.is_demo());
        assert!(config.database.is_none());
        assert_eq!(config.demo.plan, Plan::Pro);
        assert_eq!(config.demo.status, BillingStatus::Trialing);
        let remaining = config.demo.trial_ends_at - Utc::now();
        assert!(remaining <= ChronoDuration::days(3));
        assert!(remaining > ChronoDuration::days(2));
    }

    #[test]
    fn demo_overrides_are_parsed_strictly() {
        assert!(load(&[("APP_MODE", "demo"), ("DEMO_PLAN", "platinum")]).is_err());
        assert!(load(&[("APP_MODE", "demo"), ("DEMO_BILLING_STATUS", "weird")]).is_err());
        assert!(load(&[("APP_MODE", "staging")]).is_err());

        let config = load(&[
            ("APP_MODE", "demo"),
            ("DEMO_PLAN", "enterprise"),
            ("DEMO_BILLING_STATUS", "active"),
            ("DEMO_TRIAL_ENDS_AT", "2030-01-01T00:00:00Z"),
        ])
        .unwrap();
        assert_eq!(config.demo.plan, Plan::Enterprise);
        assert_eq!(config.demo.status, BillingStatus::Active);
        assert_eq!(config.demo.trial_ends_at.to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[test]
    fn snapshot_is_loaded_once() {
        let first =
            EntitlementsConfig::snapshot_or_load(|| load(&[("APP_MODE", "demo")])).unwrap();
        let second = EntitlementsConfig::snapshot_or_load(|| {
            Err(AppError::ConfigError(anyhow::anyhow!("loaded twice")))
        })
        .unwrap();
        assert!(std::ptr::eq(first, second));
        assert!(second.mode.is_demo());
    }

    #[test]
    fn oversized_numbers_never_panic() {
        let config = load(&[
            ("APP_MODE", "demo"),
            ("DEMO_TRIAL_DAYS", "1000000000000000"),
            ("DATABASE_URL", "postgres://localhost/db"),
            ("DATABASE_MAX_CONNECTIONS", "99999999999"),
            ("STRIPE_WEBHOOK_TOLERANCE_SECS", "-5"),
        ])
        .unwrap();
        let remaining = config.demo.trial_ends_at - Utc::now();
        assert!(remaining <= ChronoDuration::days(14));
        assert!(remaining > ChronoDuration::days(13));
        assert_eq!(config.database.unwrap().max_connections, 10);
        assert_eq!(config.stripe.webhook_tolerance_secs, 300);

        assert!(load(&[("APP_MODE", "demo"), ("DEMO_TRIAL_DAYS", "4000000000")]).is_err());
        assert!(load(&[("APP_MODE", "demo"), ("BILLING_GRACE_PERIOD_DAYS", "100000000")]).is_err());

        let config = load(&[("APP_MODE", "demo"), ("BILLING_GRACE_PERIOD_DAYS", "3650")]).unwrap();
        assert_eq!(config.entitlements.grace_period(), ChronoDuration::days(3650));
    }

    #[test]
    fn bad_numbers_fall_back_to_defaults_and_blank_is_unset() {
        let config = load(&[
            ("APP_MODE", "demo"),
            ("ENTITLEMENTS_CACHE_TTL_SECS", "soon"),
            ("STRIPE_SECRET_KEY", "   "),
        ])
        .unwrap();
        assert_eq!(config.entitlements.cache_ttl, Duration::from_secs(60));
        assert!(!config.stripe_enabled());
    }
}
