//! Stripe webhook processing.
//!
//! Events are verified, claimed for idempotency, mapped onto the tenant's
//! canonical billing row and audited. A failure leaves the claim marked
//! failed so Stripe's redelivery is processed again.

use crate::config::PlanPriceMap;
use crate::models::{
    BillingStatus, NewAuditEntry, UpsertTenantBilling, WebhookClaim, WebhookEventStatus,
};
use crate::services::entitlements::EntitlementsResolver;
use crate::services::metrics::{record_error, record_webhook_event};
use crate::services::store::{webhook_claim_stale_after, BillingStore};
use crate::services::stripe::{
    verify_webhook_signature, StripeCheckoutSession, StripeError, StripeEvent, StripeInvoice,
    StripeSubscription, SubscriptionLookup,
};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const ACTOR: &str = "stripe_webhook";

/// Result of a webhook delivery, as reported back to Stripe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed { event_id: String, tenant_id: Option<Uuid> },
    Ignored { event_id: String, reason: String },
    /// The event was already handled by an earlier delivery.
    Duplicate { event_id: String },
    /// Another delivery is handling the event right now.
    InFlight { event_id: String },
}

enum Effect {
    Applied(Uuid),
    Ignored(String),
}

pub struct BillingWebhookProcessor {
    store: Arc<dyn BillingStore>,
    resolver: Arc<EntitlementsResolver>,
    stripe: Option<Arc<dyn SubscriptionLookup>>,
    prices: PlanPriceMap,
    webhook_secret: Option<Secret<String>>,
    tolerance_secs: i64,
}

impl BillingWebhookProcessor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        resolver: Arc<EntitlementsResolver>,
        stripe: Option<Arc<dyn SubscriptionLookup>>,
        prices: PlanPriceMap,
        webhook_secret: Option<Secret<String>>,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            store,
            resolver,
            stripe,
            prices,
            webhook_secret,
            tolerance_secs,
        }
    }

    /// Verify, claim and apply one delivery.
    #[instrument(skip(self, signature, payload), fields(payload_len = payload.len()))]
    pub async fn handle(
        &self,
        signature: Option<&str>,
        payload: &[u8],
    ) -> Result<WebhookOutcome, AppError> {
        let secret = self.webhook_secret.as_ref().ok_or_else(|| {
            AppError::ServiceUnavailable("Stripe webhooks are not configured".to_string())
        })?;

        let verified = signature.ok_or(StripeError::MissingSignature).and_then(|header| {
            verify_webhook_signature(
                secret.expose_secret(),
                payload,
                header,
                self.tolerance_secs,
                Utc::now(),
            )
        });
        if let Err(e) = verified {
            warn!(error = %e, "Rejected Stripe webhook");
            record_webhook_event("unknown", "rejected");
            return Err(AppError::Unauthorized(anyhow::anyhow!(e)));
        }

        let event = StripeEvent::parse(payload).map_err(|e| AppError::BadRequest(e.into()))?;

        let claim = self
            .store
            .claim_webhook_event(&event.id, &event.event_type, webhook_claim_stale_after())
            .await?;
        match claim {
            WebhookClaim::AlreadyProcessed => {
                info!(event_id = %event.id, "Duplicate Stripe event");
                record_webhook_event(&event.event_type, "duplicate");
                return Ok(WebhookOutcome::Duplicate { event_id: event.id });
            }
            WebhookClaim::InFlight => {
                record_webhook_event(&event.event_type, "in_flight");
                return Ok(WebhookOutcome::InFlight { event_id: event.id });
            }
            WebhookClaim::Retry { attempt } => {
                info!(event_id = %event.id, attempt = attempt, "Retrying Stripe event");
            }
            WebhookClaim::New => {}
        }

        match self.apply(&event).await {
            Ok(Effect::Applied(tenant_id)) => {
                self.store
                    .complete_webhook_event(&event.id, WebhookEventStatus::Processed)
                    .await?;
                self.resolver.invalidate(&tenant_id);
                record_webhook_event(&event.event_type, "processed");
                info!(event_id = %event.id, event_type = %event.event_type, tenant_id = %tenant_id, "Stripe event processed");
                Ok(WebhookOutcome::Processed {
                    event_id: event.id,
                    tenant_id: Some(tenant_id),
                })
            }
            Ok(Effect::Ignored(reason)) => {
                self.store
                    .complete_webhook_event(&event.id, WebhookEventStatus::Ignored)
                    .await?;
                record_webhook_event(&event.event_type, "ignored");
                info!(event_id = %event.id, event_type = %event.event_type, reason = %reason, "Stripe event ignored");
                Ok(WebhookOutcome::Ignored {
                    event_id: event.id,
                    reason,
                })
            }
            Err(e) => {
                error!(event_id = %event.id, event_type = %event.event_type, error = %e, "Stripe event processing failed");
                record_webhook_event(&event.event_type, "failed");
                record_error("webhook", &event.event_type);
                if let Err(mark_err) = self.store.fail_webhook_event(&event.id, &e.to_string()).await {
                    error!(error = %mark_err, "Failed to mark Stripe event failed");
                }
                Err(e)
            }
        }
    }

    async fn apply(&self, event: &StripeEvent) -> Result<Effect, AppError> {
        let event_at = event.created_at();
        match event.event_type.as_str() {
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => {
                let subscription: StripeSubscription = match event.object() {
                    Ok(subscription) => subscription,
                    Err(e) => return Ok(undecodable(event, e)),
                };
                let deleted = event.event_type == "customer.subscription.deleted";
                self.apply_subscription(event, &subscription, deleted, event_at)
                    .await
            }
            "invoice.payment_failed" => {
                let invoice: StripeInvoice = match event.object() {
                    Ok(invoice) => invoice,
                    Err(e) => return Ok(undecodable(event, e)),
                };
                self.apply_invoice(event, &invoice, false, event_at).await
            }
            "invoice.paid" | "invoice.payment_succeeded" => {
                let invoice: StripeInvoice = match event.object() {
                    Ok(invoice) => invoice,
                    Err(e) => return Ok(undecodable(event, e)),
                };
                self.apply_invoice(event, &invoice, true, event_at).await
            }
            "checkout.session.completed" => {
                let session: StripeCheckoutSession = match event.object() {
                    Ok(session) => session,
                    Err(e) => return Ok(undecodable(event, e)),
                };
                self.apply_checkout(event, &session).await
            }
            other => Ok(Effect::Ignored(format!("unhandled event type {}", other))),
        }
    }

    async fn tenant_for(
        &self,
        tenant_id: Option<Uuid>,
        subscription_id: Option<&str>,
        customer_id: Option<&str>,
    ) -> Result<Option<Uuid>, AppError> {
        if tenant_id.is_some() {
            return Ok(tenant_id);
        }
        if let Some(subscription_id) = subscription_id {
            if let Some(found) = self.store.find_tenant_by_subscription(subscription_id).await? {
                return Ok(Some(found));
            }
        }
        if let Some(customer_id) = customer_id {
            return self.store.find_tenant_by_customer(customer_id).await;
        }
        Ok(None)
    }

    async fn previous(&self, tenant_id: Uuid) -> Result<Option<UpsertTenantBilling>, AppError> {
        Ok(self
            .store
            .get_tenant_billing(tenant_id)
            .await?
            .map(|row| row.to_upsert()))
    }

    async fn apply_subscription(
        &self,
        event: &StripeEvent,
        subscription: &StripeSubscription,
        deleted: bool,
        event_at: Option<DateTime<Utc>>,
    ) -> Result<Effect, AppError> {
        let Some(tenant_id) = self
            .tenant_for(
                subscription.tenant_id(),
                Some(&subscription.id),
                subscription.customer_id(),
            )
            .await?
        else {
            return Ok(Effect::Ignored(format!(
                "subscription {} is not linked to a tenant",
                subscription.id
            )));
        };

        let previous = self.previous(tenant_id).await?;
        let mut upsert =
            subscription.to_upsert(tenant_id, &self.prices, previous.as_ref(), event_at);
        if deleted {
            upsert.status = BillingStatus::Canceled;
        }
        self.write(event, upsert).await
    }

    async fn apply_invoice(
        &self,
        event: &StripeEvent,
        invoice: &StripeInvoice,
        paid: bool,
        event_at: Option<DateTime<Utc>>,
    ) -> Result<Effect, AppError> {
        let Some(tenant_id) = self
            .tenant_for(
                invoice.tenant_id(),
                invoice.subscription_id(),
                invoice.customer_id(),
            )
            .await?
        else {
            return Ok(Effect::Ignored(format!(
                "invoice {} is not linked to a tenant",
                invoice.id
            )));
        };

        let Some(mut upsert) = self.previous(tenant_id).await? else {
            if paid {
                return Ok(Effect::Ignored(format!(
                    "no billing row for tenant {}",
                    tenant_id
                )));
            }
            // A failure is worth recording even before the subscription arrives.
            let mut upsert = UpsertTenantBilling::new(tenant_id);
            upsert.status = BillingStatus::PastDue;
            upsert.payment_failed_at = event_at;
            upsert.stripe_customer_id = invoice.customer_id().map(str::to_string);
            upsert.stripe_subscription_id = invoice.subscription_id().map(str::to_string);
            upsert.event_at = event_at;
            return self.write(event, upsert).await;
        };

        if paid {
            upsert.payment_failed_at = None;
            if matches!(upsert.status, BillingStatus::PastDue | BillingStatus::Unpaid) {
                upsert.status = BillingStatus::Active;
            }
        } else {
            if upsert.status != BillingStatus::Unpaid {
                upsert.status = BillingStatus::PastDue;
            }
            // The grace period runs from the first failure.
            upsert.payment_failed_at = upsert.payment_failed_at.or(event_at);
        }
        if upsert.stripe_customer_id.is_none() {
            upsert.stripe_customer_id = invoice.customer_id().map(str::to_string);
        }
        if upsert.stripe_subscription_id.is_none() {
            upsert.stripe_subscription_id = invoice.subscription_id().map(str::to_string);
        }
        upsert.event_at = event_at;
        self.write(event, upsert).await
    }

    async fn apply_checkout(
        &self,
        event: &StripeEvent,
        session: &StripeCheckoutSession,
    ) -> Result<Effect, AppError> {
        let Some(tenant_id) = session.tenant_id() else {
            return Ok(Effect::Ignored(format!(
                "checkout session {} has no tenant reference",
                session.id
            )));
        };

        // The full subscription state is the better source when Stripe is reachable.
        if let (Some(stripe), Some(subscription_id)) = (&self.stripe, session.subscription_id()) {
            match stripe.get_subscription(subscription_id).await {
                Ok(Some(subscription)) => {
                    let previous = self.previous(tenant_id).await?;
                    let mut upsert = subscription.to_upsert(
                        tenant_id,
                        &self.prices,
                        previous.as_ref(),
                        Some(Utc::now()),
                    );
                    if upsert.stripe_customer_id.is_none() {
                        upsert.stripe_customer_id = session.customer_id().map(str::to_string);
                    }
                    return self.write(event, upsert).await;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Subscription fetch after checkout failed"),
            }
        }

        let mut upsert = self
            .previous(tenant_id)
            .await?
            .unwrap_or_else(|| UpsertTenantBilling::new(tenant_id));
        if let Some(customer_id) = session.customer_id() {
            upsert.stripe_customer_id = Some(customer_id.to_string());
        }
        if let Some(subscription_id) = session.subscription_id() {
            upsert.stripe_subscription_id = Some(subscription_id.to_string());
        }
        // Linking ids says nothing about subscription state, so it must not
        // hold back subscription events created before the checkout finished.
        upsert.event_at = None;
        self.write(event, upsert).await
    }

    async fn write(&self, event: &StripeEvent, upsert: UpsertTenantBilling) -> Result<Effect, AppError> {
        let tenant_id = upsert.tenant_id;
        let outcome = self.store.upsert_tenant_billing(&upsert).await?;
        if !outcome.applied {
            return Ok(Effect::Ignored(format!(
                "stale event for tenant {}",
                tenant_id
            )));
        }

        self.store
            .append_audit(&NewAuditEntry {
                tenant_id,
                action: event.event_type.clone(),
                actor: ACTOR.to_string(),
                details: Some(serde_json::json!({
                    "event_id": event.id,
                    "plan": outcome.row.plan,
                    "status": outcome.row.status,
                    "stripe_customer_id": outcome.row.stripe_customer_id,
                    "stripe_subscription_id": outcome.row.stripe_subscription_id,
                    "payment_failed_at": outcome.row.payment_failed_at,
                })),
            })
            .await?;

        Ok(Effect::Applied(tenant_id))
    }
}

/// A signed event whose object does not decode will never decode on
/// redelivery either, so it is acknowledged and recorded as ignored.
fn undecodable(event: &StripeEvent, e: StripeError) -> Effect {
    warn!(event_id = %event.id, event_type = %event.event_type, error = %e, "Undecodable Stripe event payload");
    Effect::Ignored(format!("undecodable {} payload: {}", event.event_type, e))
}
