//! In-process [`BillingStore`] used in demo mode without a database and in tests.
//! Nothing survives a restart.

use crate::models::{
    AiUsage, AuditLogEntry, NewAuditEntry, TenantBilling, UpsertOutcome, UpsertTenantBilling,
    WebhookClaim, WebhookEventRecord, WebhookEventStatus,
};
use crate::services::store::BillingStore;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    billing: HashMap<Uuid, TenantBilling>,
    usage: HashMap<(Uuid, NaiveDate), AiUsage>,
    webhooks: HashMap<String, WebhookEventRecord>,
    audit: Vec<AuditLogEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_tenant_billing(&self, tenant_id: Uuid) -> Result<Option<TenantBilling>, AppError> {
        Ok(self.state.lock().await.billing.get(&tenant_id).cloned())
    }

    async fn find_tenant_by_customer(&self, customer_id: &str) -> Result<Option<Uuid>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .billing
            .values()
            .filter(|row| row.stripe_customer_id.as_deref() == Some(customer_id))
            .max_by_key(|row| row.updated_utc)
            .map(|row| row.tenant_id))
    }

    async fn find_tenant_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Uuid>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .billing
            .values()
            .filter(|row| row.stripe_subscription_id.as_deref() == Some(subscription_id))
            .max_by_key(|row| row.updated_utc)
            .map(|row| row.tenant_id))
    }

    async fn upsert_tenant_billing(
        &self,
        input: &UpsertTenantBilling,
    ) -> Result<UpsertOutcome, AppError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let (created_utc, stored_event_at) = match state.billing.get(&input.tenant_id) {
            Some(existing) => {
                let stale = matches!(
                    (input.event_at, existing.last_event_at),
                    (Some(incoming), Some(stored)) if incoming < stored
                );
                if stale {
                    return Ok(UpsertOutcome {
                        row: existing.clone(),
                        applied: false,
                    });
                }
                (existing.created_utc, existing.last_event_at)
            }
            None => (now, None),
        };

        let row = TenantBilling {
            tenant_id: input.tenant_id,
            plan: input.plan.as_str().to_string(),
            status: input.status.as_str().to_string(),
            stripe_customer_id: input.stripe_customer_id.clone(),
            stripe_subscription_id: input.stripe_subscription_id.clone(),
            trial_ends_at: input.trial_ends_at,
            current_period_end: input.current_period_end,
            cancel_at_period_end: input.cancel_at_period_end,
            payment_failed_at: input.payment_failed_at,
            last_event_at: input.event_at.max(stored_event_at),
            created_utc,
            updated_utc: now,
        };
        state.billing.insert(input.tenant_id, row.clone());

        Ok(UpsertOutcome { row, applied: true })
    }

    async fn get_ai_usage(&self, tenant_id: Uuid, period: NaiveDate) -> Result<AiUsage, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .usage
            .get(&(tenant_id, period))
            .cloned()
            .unwrap_or_else(|| AiUsage::empty(tenant_id, period)))
    }

    async fn reserve_ai_message(
        &self,
        tenant_id: Uuid,
        period: NaiveDate,
        limit: Option<i64>,
    ) -> Result<Option<i64>, AppError> {
        let mut state = self.state.lock().await;
        let usage = state
            .usage
            .entry((tenant_id, period))
            .or_insert_with(|| AiUsage::empty(tenant_id, period));

        if limit.is_some_and(|l| usage.message_count >= l) {
            return Ok(None);
        }
        usage.message_count += 1;
        Ok(Some(usage.message_count))
    }

    async fn release_ai_message(&self, tenant_id: Uuid, period: NaiveDate) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if let Some(usage) = state.usage.get_mut(&(tenant_id, period)) {
            usage.message_count = (usage.message_count - 1).max(0);
        }
        Ok(())
    }

    async fn add_ai_tokens(
        &self,
        tenant_id: Uuid,
        period: NaiveDate,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let usage = state
            .usage
            .entry((tenant_id, period))
            .or_insert_with(|| AiUsage::empty(tenant_id, period));
        usage.input_tokens += input_tokens.max(0);
        usage.output_tokens += output_tokens.max(0);
        Ok(())
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        stale_after: Duration,
    ) -> Result<WebhookClaim, AppError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let record = match state.webhooks.entry(event_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(WebhookEventRecord {
                    event_id: event_id.to_string(),
                    event_type: event_type.to_string(),
                    status: WebhookEventStatus::Processing.as_str().to_string(),
                    attempts: 1,
                    last_error: None,
                    received_utc: now,
                    updated_utc: now,
                    processed_utc: None,
                });
                return Ok(WebhookClaim::New);
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        let claim = match WebhookEventStatus::from_string(&record.status) {
            status if status.is_final() => return Ok(WebhookClaim::AlreadyProcessed),
            WebhookEventStatus::Processing if record.updated_utc + stale_after > now => {
                return Ok(WebhookClaim::InFlight)
            }
            _ => {
                record.attempts += 1;
                WebhookClaim::Retry {
                    attempt: record.attempts,
                }
            }
        };
        record.status = WebhookEventStatus::Processing.as_str().to_string();
        record.updated_utc = now;
        Ok(claim)
    }

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.webhooks.get_mut(event_id) {
            let now = Utc::now();
            record.status = status.as_str().to_string();
            record.last_error = None;
            record.processed_utc = Some(now);
            record.updated_utc = now;
        }
        Ok(())
    }

    async fn fail_webhook_event(&self, event_id: &str, error: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.webhooks.get_mut(event_id) {
            record.status = WebhookEventStatus::Failed.as_str().to_string();
            record.last_error = Some(error.to_string());
            record.updated_utc = Utc::now();
        }
        Ok(())
    }

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<AuditLogEntry, AppError> {
        let row = AuditLogEntry {
            entry_id: Uuid::new_v4(),
            tenant_id: entry.tenant_id,
            action: entry.action.clone(),
            actor: entry.actor.clone(),
            details: entry.details.clone(),
            created_utc: Utc::now(),
        };
        self.state.lock().await.audit.push(row.clone());
        Ok(row)
    }

    async fn list_audit(&self, tenant_id: Uuid, limit: i64) -> Result<Vec<AuditLogEntry>, AppError> {
        let state = self.state.lock().await;
        // Appended in time order, so reversing gives newest first.
        Ok(state
            .audit
            .iter()
            .rev()
            .filter(|entry| entry.tenant_id == tenant_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
