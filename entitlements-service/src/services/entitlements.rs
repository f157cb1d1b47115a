//! Entitlements resolution.
//!
//! Sources are consulted in order: the tenant's billing row, a Stripe
//! subscription search (reconciled back into the store), the demo override
//! and finally the fail-closed default. A source that errors is skipped; a
//! result produced after any error is served but not cached so the next
//! request tries again.

use crate::config::{DemoConfig, PlanPriceMap};
use crate::models::{
    normalize, BillingSnapshot, EntitlementSource, Entitlements, NewAuditEntry, UpsertTenantBilling,
};
use crate::services::cache::EntitlementsCache;
use crate::services::metrics::{record_error, record_resolution};
use crate::services::store::BillingStore;
use crate::services::stripe::SubscriptionLookup;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub struct EntitlementsResolver {
    store: Arc<dyn BillingStore>,
    stripe: Option<Arc<dyn SubscriptionLookup>>,
    prices: PlanPriceMap,
    /// Set only in demo mode.
    demo: Option<DemoConfig>,
    grace_period: Duration,
    cache: Arc<EntitlementsCache>,
}

struct Resolution {
    entitlements: Entitlements,
    degraded: bool,
}

impl EntitlementsResolver {
    pub fn new(
        store: Arc<dyn BillingStore>,
        stripe: Option<Arc<dyn SubscriptionLookup>>,
        prices: PlanPriceMap,
        demo: Option<DemoConfig>,
        grace_period: Duration,
        cache: Arc<EntitlementsCache>,
    ) -> Self {
        Self {
            store,
            stripe,
            prices,
            demo,
            grace_period,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<EntitlementsCache> {
        &self.cache
    }

    pub fn invalidate(&self, tenant_id: &Uuid) {
        self.cache.invalidate(tenant_id);
    }

    /// Current entitlements for a tenant. Never fails: when every source is
    /// unavailable the tenant gets the free plan.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn resolve(&self, tenant_id: Uuid) -> Entitlements {
        if let Some(cached) = self.cache.get(&tenant_id) {
            return cached;
        }

        let generation = self.cache.generation(&tenant_id);
        let now = Utc::now();
        let Resolution {
            entitlements,
            degraded,
        } = self.resolve_uncached(tenant_id, now).await;

        record_resolution(entitlements.source.as_str());
        if degraded {
            warn!(source = %entitlements.source, "Serving uncached entitlements after source failure");
        } else {
            self.cache.insert_if_current(entitlements.clone(), now, generation);
        }
        entitlements
    }

    /// Drop the cached entry and resolve again.
    pub async fn refresh(&self, tenant_id: Uuid) -> Entitlements {
        self.cache.invalidate(&tenant_id);
        self.resolve(tenant_id).await
    }

    async fn resolve_uncached(&self, tenant_id: Uuid, now: DateTime<Utc>) -> Resolution {
        let mut degraded = false;
        let finish = |snapshot: &BillingSnapshot, source, degraded| Resolution {
            entitlements: normalize(tenant_id, snapshot, source, now, self.grace_period),
            degraded,
        };

        match self.store.get_tenant_billing(tenant_id).await {
            Ok(Some(row)) => {
                return finish(&BillingSnapshot::from(&row), EntitlementSource::Database, false)
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Billing store lookup failed");
                record_error("store", "resolve_entitlements");
                degraded = true;
            }
        }

        if let Some(stripe) = &self.stripe {
            match stripe.find_subscription(tenant_id).await {
                Ok(Some(subscription)) => {
                    let upsert = subscription.to_upsert(tenant_id, &self.prices, None, Some(now));
                    let snapshot = self.reconcile(&upsert).await;
                    return finish(&snapshot, EntitlementSource::Stripe, degraded);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Stripe subscription lookup failed");
                    record_error("stripe", "resolve_entitlements");
                    degraded = true;
                }
            }
        }

        if let Some(demo) = &self.demo {
            return finish(&demo.snapshot(), EntitlementSource::DemoOverride, degraded);
        }

        finish(&BillingSnapshot::unbilled(), EntitlementSource::Default, degraded)
    }

    /// Persist a Stripe-derived row so later lookups hit the store. Returns
    /// the snapshot that should be served.
    async fn reconcile(&self, upsert: &UpsertTenantBilling) -> BillingSnapshot {
        match self.store.upsert_tenant_billing(upsert).await {
            Ok(outcome) if outcome.applied => {
                info!(plan = %upsert.plan, status = %upsert.status, "Reconciled billing from Stripe");
                let audit = NewAuditEntry {
                    tenant_id: upsert.tenant_id,
                    action: "billing.reconciled".to_string(),
                    actor: "stripe_lookup".to_string(),
                    details: Some(serde_json::json!({
                        "plan": upsert.plan.as_str(),
                        "status": upsert.status.as_str(),
                        "stripe_subscription_id": upsert.stripe_subscription_id,
                    })),
                };
                if let Err(e) = self.store.append_audit(&audit).await {
                    warn!(error = %e, "Failed to audit reconciliation");
                }
                BillingSnapshot::from(&outcome.row)
            }
            // A webhook stored something newer while we were searching.
            Ok(outcome) => BillingSnapshot::from(&outcome.row),
            Err(e) => {
                warn!(error = %e, "Failed to persist reconciled billing");
                BillingSnapshot::from(upsert)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingStatus, Plan};
    use crate::services::memory::MemoryStore;
    use crate::services::stripe::{StripeError, StripeSubscription};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    struct FakeStripe {
        subscription: Mutex<Option<serde_json::Value>>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeStripe {
        fn returning(json: Option<serde_json::Value>) -> Arc<Self> {
            Arc::new(Self {
                subscription: Mutex::new(json),
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                subscription: Mutex::new(None),
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SubscriptionLookup for FakeStripe {
        async fn find_subscription(
            &self,
            _tenant_id: Uuid,
        ) -> Result<Option<StripeSubscription>, StripeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StripeError::Network("connection refused".to_string()));
            }
            let json = self.subscription.lock().unwrap().clone();
            Ok(json.map(|j| serde_json::from_value(j).unwrap()))
        }

        async fn get_subscription(
            &self,
            _subscription_id: &str,
        ) -> Result<Option<StripeSubscription>, StripeError> {
            self.find_subscription(Uuid::nil()).await
        }
    }

    fn demo() -> DemoConfig {
        DemoConfig {
            plan: Plan::Pro,
            status: BillingStatus::Trialing,
            trial_ends_at: Utc::now() + Duration::days(14),
        }
    }

    fn resolver(
        store: Arc<MemoryStore>,
        stripe: Option<Arc<FakeStripe>>,
        demo: Option<DemoConfig>,
    ) -> EntitlementsResolver {
        EntitlementsResolver::new(
            store,
            stripe.map(|s| s as Arc<dyn SubscriptionLookup>),
            PlanPriceMap::default(),
            demo,
            Duration::days(7),
            Arc::new(EntitlementsCache::new(std::time::Duration::from_secs(60))),
        )
    }

    #[tokio::test]
    async fn database_row_wins_over_everything() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        store
            .upsert_tenant_billing(&UpsertTenantBilling {
                plan: Plan::Starter,
                status: BillingStatus::Active,
                ..UpsertTenantBilling::new(tenant)
            })
            .await
            .unwrap();
        let stripe = FakeStripe::returning(Some(serde_json::json!({
            "id": "sub_1", "status": "active", "metadata": {"plan": "enterprise"}
        })));

        let resolved = resolver(store, Some(stripe.clone()), Some(demo()))
            .resolve(tenant)
            .await;
        assert_eq!(resolved.source, EntitlementSource::Database);
        assert_eq!(resolved.plan, Plan::Starter);
        assert_eq!(stripe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stripe_result_is_persisted_and_audited() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        let stripe = FakeStripe::returning(Some(serde_json::json!({
            "id": "sub_1", "status": "active", "customer": "cus_1",
            "metadata": {"plan": "enterprise", "tenant_id": tenant.to_string()}
        })));

        let resolved = resolver(store.clone(), Some(stripe), None)
            .resolve(tenant)
            .await;
        assert_eq!(resolved.source, EntitlementSource::Stripe);
        assert_eq!(resolved.plan, Plan::Enterprise);

        let row = store.get_tenant_billing(tenant).await.unwrap().unwrap();
        assert_eq!(row.plan(), Plan::Enterprise);
        assert_eq!(row.stripe_customer_id.as_deref(), Some("cus_1"));
        let audit = store.list_audit(tenant, 10).await.unwrap();
        assert_eq!(audit[0].action, "billing.reconciled");
    }

    #[tokio::test]
    async fn demo_override_only_when_configured() {
        let tenant = Uuid::new_v4();

        let with_demo = resolver(Arc::new(MemoryStore::new()), None, Some(demo()))
            .resolve(tenant)
            .await;
        assert_eq!(with_demo.source, EntitlementSource::DemoOverride);
        assert_eq!(with_demo.plan, Plan::Pro);
        assert!(with_demo.features.ai_chat);

        let without_demo = resolver(Arc::new(MemoryStore::new()), None, None)
            .resolve(tenant)
            .await;
        assert_eq!(without_demo.source, EntitlementSource::Default);
        assert_eq!(without_demo.plan, Plan::Free);
        assert_eq!(without_demo.status, BillingStatus::None);
    }

    #[tokio::test]
    async fn results_after_source_failure_are_not_cached() {
        let tenant = Uuid::new_v4();
        let stripe = FakeStripe::failing();
        let resolver = resolver(Arc::new(MemoryStore::new()), Some(stripe.clone()), None);

        let first = resolver.resolve(tenant).await;
        assert_eq!(first.source, EntitlementSource::Default);
        assert!(!first.features.ai_chat);
        resolver.resolve(tenant).await;
        assert_eq!(stripe.calls.load(Ordering::SeqCst), 2);
        assert!(resolver.cache().get(&tenant).is_none());
    }

    #[tokio::test]
    async fn healthy_results_are_cached_until_refresh() {
        let tenant = Uuid::new_v4();
        let stripe = FakeStripe::returning(None);
        let resolver = resolver(Arc::new(MemoryStore::new()), Some(stripe.clone()), None);

        resolver.resolve(tenant).await;
        resolver.resolve(tenant).await;
        assert_eq!(stripe.calls.load(Ordering::SeqCst), 1);

        *stripe.subscription.lock().unwrap() = Some(serde_json::json!({
            "id": "sub_2", "status": "active", "metadata": {"plan": "pro"}
        }));
        let refreshed = resolver.refresh(tenant).await;
        assert_eq!(refreshed.plan, Plan::Pro);
        assert_eq!(stripe.calls.load(Ordering::SeqCst), 2);
    }

    /// Pauses inside the Stripe search until released.
    #[derive(Default)]
    struct GatedStripe {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SubscriptionLookup for GatedStripe {
        async fn find_subscription(
            &self,
            _tenant_id: Uuid,
        ) -> Result<Option<StripeSubscription>, StripeError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(None)
        }

        async fn get_subscription(
            &self,
            _subscription_id: &str,
        ) -> Result<Option<StripeSubscription>, StripeError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn invalidation_during_resolution_is_not_overwritten() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        let gate = Arc::new(GatedStripe::default());
        let resolver = Arc::new(EntitlementsResolver::new(
            store.clone(),
            Some(gate.clone() as Arc<dyn SubscriptionLookup>),
            PlanPriceMap::default(),
            None,
            Duration::days(7),
            Arc::new(EntitlementsCache::new(std::time::Duration::from_secs(60))),
        ));

        let in_flight = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.resolve(tenant).await }
        });
        gate.entered.notified().await;

        // A webhook lands while the resolution is still searching Stripe.
        store
            .upsert_tenant_billing(&UpsertTenantBilling {
                plan: Plan::Pro,
                status: BillingStatus::Active,
                ..UpsertTenantBilling::new(tenant)
            })
            .await
            .unwrap();
        resolver.invalidate(&tenant);
        gate.release.notify_one();

        let stale = in_flight.await.unwrap();
        assert_eq!(stale.plan, Plan::Free);
        assert!(resolver.cache().get(&tenant).is_none());

        let fresh = resolver.resolve(tenant).await;
        assert_eq!(fresh.source, EntitlementSource::Database);
        assert_eq!(fresh.plan, Plan::Pro);
    }
}
