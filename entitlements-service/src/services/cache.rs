//! Per-tenant entitlements cache with TTL expiry.

use crate::models::Entitlements;
use crate::services::metrics::record_cache_lookup;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Entitlements,
    expires_at: Instant,
}

/// Per-tenant invalidation counter. A resolution started under an older
/// generation must not be cached.
pub type CacheGeneration = u64;

pub struct EntitlementsCache {
    entries: DashMap<Uuid, CacheEntry>,
    generations: DashMap<Uuid, CacheGeneration>,
    ttl: Duration,
}

impl EntitlementsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            generations: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, tenant_id: &Uuid) -> Option<Entitlements> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(tenant_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone());
        record_cache_lookup(hit.is_some());
        hit
    }

    /// Snapshot of the tenant's generation, taken before reading any source.
    pub fn generation(&self, tenant_id: &Uuid) -> CacheGeneration {
        self.generations.get(tenant_id).map_or(0, |g| *g)
    }

    /// Cache `value` unless the tenant was invalidated after `generation`
    /// was taken. Returns whether the value was stored.
    pub fn insert_if_current(
        &self,
        value: Entitlements,
        now: DateTime<Utc>,
        generation: CacheGeneration,
    ) -> bool {
        // Held across the insert so an invalidation cannot slip in between.
        let current = self.generations.get(&value.tenant_id);
        if current.as_deref().copied().unwrap_or(0) != generation {
            debug!(tenant_id = %value.tenant_id, "Discarding entitlements resolved before invalidation");
            return false;
        }
        self.insert(value, now);
        true
    }

    /// Cache `value`. The lifetime is the configured TTL, cut short at the
    /// next trial, grace or access boundary so the entry never outlives the
    /// state it describes.
    pub fn insert(&self, value: Entitlements, now: DateTime<Utc>) {
        let mut ttl = self.ttl;
        if let Some(boundary) = value.next_transition(now) {
            let until_boundary = (boundary - now).to_std().unwrap_or(Duration::ZERO);
            ttl = ttl.min(until_boundary);
        }
        if ttl.is_zero() {
            self.entries.remove(&value.tenant_id);
            return;
        }
        self.entries.insert(
            value.tenant_id,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn invalidate(&self, tenant_id: &Uuid) {
        let mut generation = self.generations.entry(*tenant_id).or_insert(0);
        *generation += 1;
        if self.entries.remove(tenant_id).is_some() {
            debug!(tenant_id = %tenant_id, "Entitlements cache entry invalidated");
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Periodically purge expired entries until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.purge_expired();
                if removed > 0 {
                    debug!(removed = removed, "Swept expired entitlements");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{normalize, BillingSnapshot, BillingStatus, EntitlementSource, Plan};

    fn entitlements(snapshot: BillingSnapshot, now: DateTime<Utc>) -> Entitlements {
        normalize(
            Uuid::new_v4(),
            &snapshot,
            EntitlementSource::Database,
            now,
            chrono::Duration::days(7),
        )
    }

    fn active_pro() -> BillingSnapshot {
        BillingSnapshot {
            plan: Plan::Pro,
            status: BillingStatus::Active,
            ..BillingSnapshot::unbilled()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = EntitlementsCache::new(Duration::from_secs(60));
        let value = entitlements(active_pro(), Utc::now());
        let tenant_id = value.tenant_id;

        cache.insert(value, Utc::now());
        assert!(cache.get(&tenant_id).is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get(&tenant_id).is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_is_capped_at_trial_end() {
        let cache = EntitlementsCache::new(Duration::from_secs(300));
        let now = Utc::now();
        let value = entitlements(
            BillingSnapshot {
                plan: Plan::Pro,
                status: BillingStatus::Trialing,
                trial_ends_at: Some(now + chrono::Duration::seconds(30)),
                ..BillingSnapshot::unbilled()
            },
            now,
        );
        let tenant_id = value.tenant_id;

        cache.insert(value, now);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get(&tenant_id).is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&tenant_id).is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = EntitlementsCache::new(Duration::from_secs(60));
        let value = entitlements(active_pro(), Utc::now());
        let tenant_id = value.tenant_id;

        cache.insert(value, Utc::now());
        assert_eq!(cache.len(), 1);
        cache.invalidate(&tenant_id);
        assert!(cache.get(&tenant_id).is_none());
    }

    #[tokio::test]
    async fn resolution_started_before_invalidation_is_dropped() {
        let cache = EntitlementsCache::new(Duration::from_secs(60));
        let value = entitlements(active_pro(), Utc::now());
        let tenant_id = value.tenant_id;

        let generation = cache.generation(&tenant_id);
        cache.invalidate(&tenant_id);
        assert!(!cache.insert_if_current(value.clone(), Utc::now(), generation));
        assert!(cache.get(&tenant_id).is_none());

        let generation = cache.generation(&tenant_id);
        assert!(cache.insert_if_current(value, Utc::now(), generation));
        assert!(cache.get(&tenant_id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_in_background() {
        let cache = Arc::new(EntitlementsCache::new(Duration::from_secs(10)));
        cache.insert(entitlements(active_pro(), Utc::now()), Utc::now());

        let handle = cache.clone().spawn_sweeper(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(cache.is_empty());
        handle.abort();
    }
}
