//! Test helper module for entitlements-service integration tests.
//!
//! Every test gets its own application on a random port, running in demo
//! mode over an in-memory billing store and the mock chat provider.

#![allow(dead_code)]

use chrono::Utc;
use entitlements_service::config::EntitlementsConfig;
use entitlements_service::models::{BillingStatus, Plan, UpsertTenantBilling};
use entitlements_service::services::{
    BillingStore, Database, MemoryStore, MockChatProvider, SubscriptionLookup,
};
use entitlements_service::startup::Application;
use reqwest::{Client, RequestBuilder};
use service_core::config::Config as CoreConfig;
use service_core::utils::signature::hmac_sha256_hex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_integration_test";
pub const TENANT_HEADER: &str = "X-Tenant-ID";

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A migrated Postgres store in a schema of its own.
///
/// Returns `None` (and the calling test passes vacuously) when
/// `TEST_DATABASE_URL` is not set.
pub async fn test_database() -> Option<Database> {
    let Ok(base_url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping Postgres test");
        return None;
    };
    let schema_name = format!(
        "test_entitlements_{}_{}",
        std::process::id(),
        SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst)
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&base_url)
        .await
        .expect("Failed to connect to test database");
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
        .execute(&pool)
        .await
        .ok();
    sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
        .execute(&pool)
        .await
        .expect("Failed to create test schema");
    pool.close().await;

    let separator = if base_url.contains('?') { "&" } else { "?" };
    let url = format!(
        "{}{}options=-c search_path%3D{}",
        base_url, separator, schema_name
    );
    let db = Database::new(&url, 5, 1)
        .await
        .expect("Failed to connect to test schema");
    db.run_migrations().await.expect("Failed to run migrations");
    Some(db)
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: Client,
    pub store: Arc<MemoryStore>,
}

impl TestApp {
    /// Spawn a demo-mode application with default settings.
    pub async fn spawn() -> Self {
        Self::spawn_with(&[], None).await
    }

    /// Spawn with extra environment values (overriding the defaults) and
    /// an optional Stripe lookup.
    pub async fn spawn_with(
        vars: &[(&str, &str)],
        stripe: Option<Arc<dyn SubscriptionLookup>>,
    ) -> Self {
        let mut env: HashMap<String, String> = [
            ("APP_MODE", "demo"),
            ("LOG_LEVEL", "warn"),
            ("SERVICE_NAME", "entitlements-service-test"),
            ("STRIPE_WEBHOOK_SECRET", WEBHOOK_SECRET),
            ("DEMO_PLAN", "pro"),
            ("DEMO_BILLING_STATUS", "trialing"),
            ("DEMO_TRIAL_DAYS", "14"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (key, value) in vars {
            env.insert(key.to_string(), value.to_string());
        }

        let common = CoreConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let config = EntitlementsConfig::from_lookup(common, |key| env.get(key).cloned())
            .expect("Failed to build test configuration");

        let store = Arc::new(MemoryStore::new());
        let app = Application::build_with(
            config,
            store.clone(),
            stripe,
            Arc::new(MockChatProvider::new()),
        )
        .await
        .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server by polling the health endpoint
        let client = Client::new();
        for _ in 0..50 {
            if client
                .get(format!("{}/health", address))
                .send()
                .await
                .is_ok()
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        Self {
            address,
            port,
            client,
            store,
        }
    }

    pub fn get(&self, path: &str, tenant_id: Uuid) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.address, path))
            .header(TENANT_HEADER, tenant_id.to_string())
    }

    pub fn post(&self, path: &str, tenant_id: Uuid) -> RequestBuilder {
        self.client
            .post(format!("{}{}", self.address, path))
            .header(TENANT_HEADER, tenant_id.to_string())
    }

    /// Store a billing row directly, as if a webhook had written it.
    pub async fn seed_billing(&self, tenant_id: Uuid, plan: Plan, status: BillingStatus) {
        self.store
            .upsert_tenant_billing(&UpsertTenantBilling {
                plan,
                status,
                ..UpsertTenantBilling::new(tenant_id)
            })
            .await
            .expect("Failed to seed billing row");
    }

    /// Deliver a Stripe event with a valid signature.
    pub async fn send_webhook(&self, event: &serde_json::Value) -> reqwest::Response {
        let body = serde_json::to_vec(event).expect("Failed to serialize event");
        self.client
            .post(format!("{}/webhooks/stripe", self.address))
            .header("Stripe-Signature", stripe_signature(WEBHOOK_SECRET, &body))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("Failed to execute request")
    }
}

/// `Stripe-Signature` header value for `body`, timestamped now.
pub fn stripe_signature(secret: &str, body: &[u8]) -> String {
    let t = Utc::now().timestamp();
    let mut signed = format!("{}.", t).into_bytes();
    signed.extend_from_slice(body);
    let v1 = hmac_sha256_hex(secret.as_bytes(), &signed).expect("Failed to sign payload");
    format!("t={},v1={}", t, v1)
}

pub fn stripe_event(id: &str, event_type: &str, object: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": event_type,
        "created": Utc::now().timestamp(),
        "data": { "object": object }
    })
}

pub fn user_message(content: &str) -> serde_json::Value {
    serde_json::json!({
        "messages": [{ "role": "user", "content": content }]
    })
}
