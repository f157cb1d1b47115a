//! Postgres store tests. Each test runs in its own schema; all of them are
//! skipped when `TEST_DATABASE_URL` is not set.

mod common;

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use common::test_database;
use entitlements_service::models::{
    BillingStatus, Plan, UpsertTenantBilling, WebhookClaim, WebhookEventStatus,
};
use entitlements_service::services::{BillingStore, Database};
use uuid::Uuid;

fn period() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 1).unwrap()
}

fn subscription_write(
    tenant_id: Uuid,
    plan: Plan,
    status: BillingStatus,
    event_secs: i64,
) -> UpsertTenantBilling {
    UpsertTenantBilling {
        plan,
        status,
        stripe_customer_id: Some("cus_db".to_string()),
        stripe_subscription_id: Some("sub_db".to_string()),
        event_at: Some(Utc.timestamp_opt(event_secs, 0).unwrap()),
        ..UpsertTenantBilling::new(tenant_id)
    }
}

#[tokio::test]
async fn older_events_never_overwrite_newer_billing() {
    let Some(db) = test_database().await else {
        return;
    };
    let tenant = Uuid::new_v4();

    let first = db
        .upsert_tenant_billing(&subscription_write(
            tenant,
            Plan::Pro,
            BillingStatus::Active,
            1_800_000_200,
        ))
        .await
        .unwrap();
    assert!(first.applied);

    let stale = db
        .upsert_tenant_billing(&subscription_write(
            tenant,
            Plan::Starter,
            BillingStatus::PastDue,
            1_800_000_100,
        ))
        .await
        .unwrap();
    assert!(!stale.applied);
    assert_eq!(stale.row.plan(), Plan::Pro);
    assert_eq!(stale.row.status(), BillingStatus::Active);

    // Writes without an event time always apply and keep the stored one.
    let untimed = db
        .upsert_tenant_billing(&UpsertTenantBilling {
            event_at: None,
            ..subscription_write(tenant, Plan::Enterprise, BillingStatus::Active, 0)
        })
        .await
        .unwrap();
    assert!(untimed.applied);
    assert_eq!(untimed.row.plan(), Plan::Enterprise);
    assert_eq!(
        untimed.row.last_event_at.map(|t| t.timestamp()),
        Some(1_800_000_200)
    );

    let newer = db
        .upsert_tenant_billing(&subscription_write(
            tenant,
            Plan::Starter,
            BillingStatus::Canceled,
            1_800_000_300,
        ))
        .await
        .unwrap();
    assert!(newer.applied);
    assert_eq!(newer.row.status(), BillingStatus::Canceled);

    assert_eq!(
        db.find_tenant_by_subscription("sub_db").await.unwrap(),
        Some(tenant)
    );
    assert_eq!(
        db.find_tenant_by_customer("cus_db").await.unwrap(),
        Some(tenant)
    );
}

#[tokio::test]
async fn message_reservations_stop_at_the_limit() {
    let Some(db) = test_database().await else {
        return;
    };
    let tenant = Uuid::new_v4();

    assert_eq!(db.reserve_ai_message(tenant, period(), Some(2)).await.unwrap(), Some(1));
    assert_eq!(db.reserve_ai_message(tenant, period(), Some(2)).await.unwrap(), Some(2));
    assert_eq!(db.reserve_ai_message(tenant, period(), Some(2)).await.unwrap(), None);
    assert_eq!(db.reserve_ai_message(tenant, period(), Some(0)).await.unwrap(), None);

    db.release_ai_message(tenant, period()).await.unwrap();
    assert_eq!(db.reserve_ai_message(tenant, period(), Some(2)).await.unwrap(), Some(2));
    assert_eq!(db.reserve_ai_message(tenant, period(), None).await.unwrap(), Some(3));

    db.add_ai_tokens(tenant, period(), 12, 30).await.unwrap();
    let usage = db.get_ai_usage(tenant, period()).await.unwrap();
    assert_eq!(usage.message_count, 3);
    assert_eq!(usage.input_tokens, 12);
    assert_eq!(usage.output_tokens, 30);

    let next_month = NaiveDate::from_ymd_opt(2026, 11, 1).unwrap();
    assert_eq!(db.get_ai_usage(tenant, next_month).await.unwrap().message_count, 0);
}

#[tokio::test]
async fn concurrent_reservations_never_exceed_the_limit() {
    let Some(db) = test_database().await else {
        return;
    };
    let tenant = Uuid::new_v4();

    let attempts = (0..20).map(|_| {
        let db = db.clone();
        tokio::spawn(async move { db.reserve_ai_message(tenant, period(), Some(5)).await })
    });
    let mut granted = 0;
    for attempt in attempts.collect::<Vec<_>>() {
        if attempt.await.unwrap().unwrap().is_some() {
            granted += 1;
        }
    }
    assert_eq!(granted, 5);
    assert_eq!(db.get_ai_usage(tenant, period()).await.unwrap().message_count, 5);
}

async fn claim(db: &Database, stale_after: Duration) -> WebhookClaim {
    db.claim_webhook_event("evt_db_1", "invoice.paid", stale_after)
        .await
        .unwrap()
}

#[tokio::test]
async fn webhook_claims_reclaim_failed_and_stale_events() {
    let Some(db) = test_database().await else {
        return;
    };
    let stale_after = Duration::minutes(5);

    let claim = self::claim(&db, stale_after).await;
    assert!(matches!(claim, WebhookClaim::New));
    let claim = self::claim(&db, stale_after).await;
    assert!(matches!(claim, WebhookClaim::InFlight));

    // An attempt that stopped reporting is reclaimed.
    sqlx::query(
        "UPDATE stripe_webhook_events SET updated_utc = NOW() - INTERVAL '10 minutes' WHERE event_id = $1",
    )
    .bind("evt_db_1")
    .execute(db.pool())
    .await
    .unwrap();
    let claim = self::claim(&db, stale_after).await;
    assert!(matches!(claim, WebhookClaim::Retry { attempt: 2 }));

    db.fail_webhook_event("evt_db_1", "boom").await.unwrap();
    let claim = self::claim(&db, stale_after).await;
    assert!(matches!(claim, WebhookClaim::Retry { attempt: 3 }));

    db.complete_webhook_event("evt_db_1", WebhookEventStatus::Processed)
        .await
        .unwrap();
    let claim = self::claim(&db, stale_after).await;
    assert!(matches!(claim, WebhookClaim::AlreadyProcessed));
}
