//! Stripe webhook delivery over HTTP.

mod common;

use common::{stripe_event, TestApp};
use entitlements_service::services::BillingStore;
use serde_json::{json, Value};
use uuid::Uuid;

fn subscription(tenant: Uuid, status: &str, plan: &str) -> Value {
    json!({
        "id": "sub_int_1",
        "status": status,
        "customer": "cus_int_1",
        "metadata": { "tenant_id": tenant.to_string(), "plan": plan },
        "current_period_end": chrono::Utc::now().timestamp() + 30 * 86_400,
    })
}

#[tokio::test]
async fn subscription_event_updates_entitlements_and_audit_log() {
    let app = TestApp::spawn().await;
    let tenant = Uuid::new_v4();

    let response = app
        .send_webhook(&stripe_event(
            "evt_int_1",
            "customer.subscription.created",
            subscription(tenant, "active", "enterprise"),
        ))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "processed");

    let entitlements: Value = app
        .get("/entitlements", tenant)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(entitlements["source"], "database");
    assert_eq!(entitlements["plan"], "enterprise");
    assert_eq!(entitlements["status"], "active");

    let audit: Value = app
        .get("/billing/audit-log?limit=5", tenant)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = audit["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["action"], "customer.subscription.created");
    assert_eq!(entries[0]["actor"], "stripe_webhook");
}

#[tokio::test]
async fn webhook_invalidates_cached_entitlements() {
    let app = TestApp::spawn().await;
    let tenant = Uuid::new_v4();

    let before: Value = app
        .get("/entitlements", tenant)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(before["source"], "demo_override");

    app.send_webhook(&stripe_event(
        "evt_int_2",
        "customer.subscription.updated",
        subscription(tenant, "active", "starter"),
    ))
    .await;

    let after: Value = app
        .get("/entitlements", tenant)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(after["source"], "database");
    assert_eq!(after["plan"], "starter");
}

#[tokio::test]
async fn redelivery_is_reported_as_duplicate() {
    let app = TestApp::spawn().await;
    let tenant = Uuid::new_v4();
    let event = stripe_event(
        "evt_int_3",
        "customer.subscription.created",
        subscription(tenant, "trialing", "pro"),
    );

    assert_eq!(app.send_webhook(&event).await.status().as_u16(), 200);
    let response = app.send_webhook(&event).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "duplicate");

    let audit = app.store.list_audit(tenant, 10).await.unwrap();
    assert_eq!(audit.len(), 1);
}

#[tokio::test]
async fn unknown_event_types_are_ignored() {
    let app = TestApp::spawn().await;

    let response = app
        .send_webhook(&stripe_event("evt_int_4", "charge.refunded", json!({ "id": "ch_1" })))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn bad_signature_is_rejected() {
    let app = TestApp::spawn().await;
    let body = serde_json::to_vec(&stripe_event("evt_int_5", "invoice.paid", json!({}))).unwrap();

    let response = app
        .client
        .post(format!("{}/webhooks/stripe", app.address))
        .header(
            "Stripe-Signature",
            common::stripe_signature("whsec_someone_else", &body),
        )
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let unsigned = app
        .client
        .post(format!("{}/webhooks/stripe", app.address))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(unsigned.status().as_u16(), 401);
}

#[tokio::test]
async fn webhooks_unavailable_without_secret() {
    let app = TestApp::spawn_with(&[("STRIPE_WEBHOOK_SECRET", "")], None).await;

    let response = app
        .send_webhook(&stripe_event("evt_int_6", "invoice.paid", json!({})))
        .await;
    assert_eq!(response.status().as_u16(), 503);
}

#[tokio::test]
async fn payment_failure_starts_grace_period() {
    let app = TestApp::spawn().await;
    let tenant = Uuid::new_v4();

    app.send_webhook(&stripe_event(
        "evt_int_7",
        "customer.subscription.created",
        subscription(tenant, "active", "pro"),
    ))
    .await;
    let response = app
        .send_webhook(&stripe_event(
            "evt_int_8",
            "invoice.payment_failed",
            json!({
                "id": "in_1",
                "customer": "cus_int_1",
                "subscription": "sub_int_1",
            }),
        ))
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let entitlements: Value = app
        .get("/entitlements", tenant)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(entitlements["status"], "past_due");
    assert_eq!(entitlements["plan"], "pro");
    assert_eq!(entitlements["in_grace_period"], true);
    assert!(entitlements["grace_period_ends_at"].is_string());
}
