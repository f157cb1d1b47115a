//! Stripe integration: webhook signature verification, event payload types
//! and the subscription search used to reconcile tenants without a billing row.

use crate::config::PlanPriceMap;
use crate::models::{BillingStatus, Plan, UpsertTenantBilling};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::utils::signature::verify_hex_signature;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Error, Debug)]
pub enum StripeError {
    #[error("Missing Stripe-Signature header")]
    MissingSignature,

    #[error("Malformed Stripe-Signature header")]
    MalformedSignature,

    #[error("Webhook timestamp outside tolerance")]
    TimestampOutOfTolerance,

    #[error("Webhook signature mismatch")]
    SignatureMismatch,

    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stripe API error {status}: {message}")]
    Api { status: u16, message: String },
}

/// Verify a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=<hex>...]`)
/// against the raw request body.
pub fn verify_webhook_signature(
    secret: &str,
    payload: &[u8],
    header: &str,
    tolerance_secs: i64,
    now: DateTime<Utc>,
) -> Result<(), StripeError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(StripeError::MalformedSignature)?;
    if signatures.is_empty() {
        return Err(StripeError::MalformedSignature);
    }
    let tolerance = u64::try_from(tolerance_secs).unwrap_or(0);
    let out_of_tolerance = now
        .timestamp()
        .checked_sub(timestamp)
        .map_or(true, |skew| skew.unsigned_abs() > tolerance);
    if out_of_tolerance {
        return Err(StripeError::TimestampOutOfTolerance);
    }

    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);

    for candidate in signatures {
        let matched = verify_hex_signature(secret.as_bytes(), &signed, candidate)
            .map_err(|_| StripeError::MalformedSignature)?;
        if matched {
            return Ok(());
        }
    }
    Err(StripeError::SignatureMismatch)
}

pub fn timestamp_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

// ============================================================================
// Event payloads
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

impl StripeEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, StripeError> {
        serde_json::from_slice(payload).map_err(|e| StripeError::InvalidPayload(e.to_string()))
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        timestamp_to_datetime(self.created)
    }

    /// Decode `data.object` into a concrete type.
    pub fn object<T: for<'de> Deserialize<'de>>(&self) -> Result<T, StripeError> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| StripeError::InvalidPayload(format!("{}: {}", self.event_type, e)))
    }
}

/// A field Stripe returns either as an id or as the expanded object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Expandable>,
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: SubscriptionItems,
    #[serde(default)]
    pub trial_end: Option<i64>,
    /// Moved onto the items in newer API versions.
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<StripePrice>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePrice {
    pub id: String,
    #[serde(default)]
    pub lookup_key: Option<String>,
}

impl StripeSubscription {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(Expandable::id)
    }

    pub fn tenant_id(&self) -> Option<Uuid> {
        self.metadata
            .get("tenant_id")
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
    }

    pub fn billing_status(&self) -> BillingStatus {
        BillingStatus::from_stripe(&self.status)
    }

    /// Plan from the configured price ids, then the price lookup key, then
    /// `metadata.plan`.
    pub fn plan(&self, prices: &PlanPriceMap) -> Option<Plan> {
        let prices_in_items = self.items.data.iter().filter_map(|item| item.price.as_ref());

        prices_in_items
            .clone()
            .find_map(|price| prices.plan_for_price(&price.id))
            .or_else(|| {
                prices_in_items
                    .filter_map(|price| price.lookup_key.as_deref())
                    .find_map(|key| key.parse::<Plan>().ok())
            })
            .or_else(|| {
                self.metadata
                    .get("plan")
                    .and_then(|raw| raw.parse::<Plan>().ok())
            })
    }

    pub fn current_period_end(&self) -> Option<DateTime<Utc>> {
        self.current_period_end
            .or_else(|| {
                self.items
                    .data
                    .iter()
                    .filter_map(|item| item.current_period_end)
                    .max()
            })
            .and_then(timestamp_to_datetime)
    }

    /// Canonical billing row for `tenant_id`, written as of `event_at`.
    ///
    /// `previous` carries fields a subscription does not describe (the
    /// payment failure time) over from the stored row.
    pub fn to_upsert(
        &self,
        tenant_id: Uuid,
        prices: &PlanPriceMap,
        previous: Option<&UpsertTenantBilling>,
        event_at: Option<DateTime<Utc>>,
    ) -> UpsertTenantBilling {
        let status = self.billing_status();
        let payment_failed_at = match status {
            BillingStatus::PastDue | BillingStatus::Unpaid => {
                previous.and_then(|p| p.payment_failed_at)
            }
            _ => None,
        };

        UpsertTenantBilling {
            tenant_id,
            plan: self.plan(prices).unwrap_or(Plan::Free),
            status,
            stripe_customer_id: self
                .customer_id()
                .map(str::to_string)
                .or_else(|| previous.and_then(|p| p.stripe_customer_id.clone())),
            stripe_subscription_id: Some(self.id.clone()),
            trial_ends_at: self.trial_end.and_then(timestamp_to_datetime),
            current_period_end: self.current_period_end(),
            cancel_at_period_end: self.cancel_at_period_end,
            payment_failed_at,
            event_at,
        }
    }
}

/// The subscription that best describes a tenant: non-terminal before
/// terminal, newest first within each group.
pub fn select_subscription(
    mut subscriptions: Vec<StripeSubscription>,
) -> Option<StripeSubscription> {
    subscriptions.sort_by_key(|s| (s.billing_status().is_terminal(), std::cmp::Reverse(s.created)));
    subscriptions.into_iter().next()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceSubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StripeInvoice {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(Expandable::id)
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription
            .as_ref()
            .or_else(|| {
                self.parent
                    .as_ref()
                    .and_then(|p| p.subscription_details.as_ref())
                    .and_then(|d| d.subscription.as_ref())
            })
            .map(Expandable::id)
    }

    /// Tenant recorded on the subscription metadata snapshot, if any.
    pub fn tenant_id(&self) -> Option<Uuid> {
        self.parent
            .as_ref()
            .and_then(|p| p.subscription_details.as_ref())
            .and_then(|d| d.metadata.get("tenant_id"))
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StripeCheckoutSession {
    pub fn tenant_id(&self) -> Option<Uuid> {
        self.client_reference_id
            .as_deref()
            .or_else(|| self.metadata.get("tenant_id").map(String::as_str))
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(Expandable::id)
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(Expandable::id)
    }
}

// ============================================================================
// API client
// ============================================================================

/// Finds the Stripe subscription belonging to a tenant.
#[async_trait]
pub trait SubscriptionLookup: Send + Sync {
    async fn find_subscription(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<StripeSubscription>, StripeError>;

    /// Fetch one subscription by id; `None` when Stripe does not know it.
    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<StripeSubscription>, StripeError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<StripeSubscription>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

pub struct StripeClient {
    client: Client,
    secret_key: Secret<String>,
    api_base_url: String,
}

impl StripeClient {
    async fn error_from(response: reqwest::Response) -> StripeError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .ok()
            .and_then(|e| e.error.message)
            .unwrap_or(body);
        StripeError::Api {
            status: status.as_u16(),
            message,
        }
    }

    pub fn new(
        secret_key: Secret<String>,
        api_base_url: impl Into<String>,
    ) -> Result<Self, StripeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StripeError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            secret_key,
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SubscriptionLookup for StripeClient {
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn find_subscription(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<StripeSubscription>, StripeError> {
        let url = format!("{}/subscriptions/search", self.api_base_url);
        let query = format!("metadata['tenant_id']:'{}'", tenant_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.secret_key.expose_secret())
            .query(&[("query", query.as_str()), ("limit", "10")])
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let search: SearchResponse = response
            .json()
            .await
            .map_err(|e| StripeError::InvalidPayload(e.to_string()))?;

        debug!(matches = search.data.len(), "Stripe subscription search completed");
        Ok(select_subscription(search.data))
    }

    #[instrument(skip(self))]
    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<StripeSubscription>, StripeError> {
        let url = format!("{}/subscriptions/{}", self.api_base_url, subscription_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.secret_key.expose_secret())
            .send()
            .await
            .map_err(|e| StripeError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| StripeError::InvalidPayload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::utils::signature::hmac_sha256_hex;

    fn sign(secret: &str, payload: &[u8], t: i64) -> String {
        let mut signed = format!("{}.", t).into_bytes();
        signed.extend_from_slice(payload);
        format!("t={},v1={}", t, hmac_sha256_hex(secret.as_bytes(), &signed).unwrap())
    }

    #[test]
    fn accepts_valid_signature() {
        let now = Utc::now();
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign("whsec_test", payload, now.timestamp());
        assert!(verify_webhook_signature("whsec_test", payload, &header, 300, now).is_ok());
    }

    #[test]
    fn accepts_any_matching_v1_entry() {
        let now = Utc::now();
        let payload = b"{}";
        let valid = sign("whsec_new", payload, now.timestamp());
        let header = format!("{},v1=deadbeef,v0=ignored", valid.replacen("v1=", "v1=00,v1=", 1));
        assert!(verify_webhook_signature("whsec_new", payload, &header, 300, now).is_ok());
    }

    #[test]
    fn rejects_tampered_payload_and_wrong_secret() {
        let now = Utc::now();
        let header = sign("whsec_test", b"original", now.timestamp());
        assert!(matches!(
            verify_webhook_signature("whsec_test", b"tampered", &header, 300, now),
            Err(StripeError::SignatureMismatch)
        ));
        assert!(matches!(
            verify_webhook_signature("whsec_other", b"original", &header, 300, now),
            Err(StripeError::SignatureMismatch)
        ));
    }

    #[test]
    fn rejects_timestamps_outside_tolerance() {
        let now = Utc::now();
        let header = sign("whsec_test", b"{}", now.timestamp() - 301);
        assert!(matches!(
            verify_webhook_signature("whsec_test", b"{}", &header, 300, now),
            Err(StripeError::TimestampOutOfTolerance)
        ));
    }

    #[test]
    fn rejects_malformed_headers() {
        let now = Utc::now();
        for header in ["", "garbage", "t=abc,v1=00", "t=1700000000"] {
            assert!(matches!(
                verify_webhook_signature("whsec_test", b"{}", header, 300, now),
                Err(StripeError::MalformedSignature)
            ));
        }
    }

    #[test]
    fn rejects_extreme_timestamps() {
        let now = Utc::now();
        for header in [
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
        ] {
            assert!(matches!(
                verify_webhook_signature("whsec_test", b"{}", header, 300, now),
                Err(StripeError::TimestampOutOfTolerance)
            ));
        }
    }

    fn subscription(json: serde_json::Value) -> StripeSubscription {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn plan_resolution_order() {
        let prices = PlanPriceMap {
            pro: Some("price_pro".to_string()),
            ..PlanPriceMap::default()
        };

        let by_price = subscription(serde_json::json!({
            "id": "sub_1", "status": "active",
            "metadata": {"plan": "starter"},
            "items": {"data": [{"price": {"id": "price_pro", "lookup_key": "enterprise"}}]}
        }));
        assert_eq!(by_price.plan(&prices), Some(Plan::Pro));

        let by_lookup_key = subscription(serde_json::json!({
            "id": "sub_2", "status": "active",
            "metadata": {"plan": "starter"},
            "items": {"data": [{"price": {"id": "price_x", "lookup_key": "enterprise"}}]}
        }));
        assert_eq!(by_lookup_key.plan(&prices), Some(Plan::Enterprise));

        let by_metadata = subscription(serde_json::json!({
            "id": "sub_3", "status": "active",
            "metadata": {"plan": "starter"},
            "items": {"data": [{"price": {"id": "price_x"}}]}
        }));
        assert_eq!(by_metadata.plan(&prices), Some(Plan::Starter));

        let unknown = subscription(serde_json::json!({"id": "sub_4", "status": "active"}));
        assert_eq!(unknown.plan(&prices), None);
    }

    #[test]
    fn period_end_falls_back_to_items() {
        let sub = subscription(serde_json::json!({
            "id": "sub_1", "status": "active", "customer": {"id": "cus_1"},
            "items": {"data": [{"current_period_end": 1_900_000_000}]}
        }));
        assert_eq!(sub.customer_id(), Some("cus_1"));
        assert_eq!(sub.current_period_end(), timestamp_to_datetime(1_900_000_000));
    }

    #[test]
    fn selects_live_subscription_before_newer_canceled_one() {
        let subs = vec![
            subscription(serde_json::json!({"id": "old_active", "status": "active", "created": 100})),
            subscription(serde_json::json!({"id": "new_canceled", "status": "canceled", "created": 300})),
            subscription(serde_json::json!({"id": "new_trial", "status": "trialing", "created": 200})),
        ];
        assert_eq!(select_subscription(subs).map(|s| s.id), Some("new_trial".to_string()));
        assert!(select_subscription(Vec::new()).is_none());
    }

    #[test]
    fn invoice_subscription_from_parent_details() {
        let invoice: StripeInvoice = serde_json::from_value(serde_json::json!({
            "id": "in_1",
            "customer": "cus_1",
            "parent": {"subscription_details": {
                "subscription": "sub_9",
                "metadata": {"tenant_id": "7f0c1a52-5d7e-4c53-9a57-1c8f7d3f0b11"}
            }}
        }))
        .unwrap();
        assert_eq!(invoice.subscription_id(), Some("sub_9"));
        assert_eq!(invoice.customer_id(), Some("cus_1"));
        assert!(invoice.tenant_id().is_some());
    }
}
