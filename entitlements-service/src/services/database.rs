//! Postgres implementation of [`BillingStore`].

use crate::models::{
    AiUsage, AuditLogEntry, NewAuditEntry, TenantBilling, UpsertOutcome, UpsertTenantBilling,
    WebhookClaim, WebhookEventStatus,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::BillingStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const TENANT_BILLING_COLUMNS: &str = "tenant_id, plan, status, stripe_customer_id, stripe_subscription_id, trial_ends_at, current_period_end, cancel_at_period_end, payment_failed_at, last_event_at, created_utc, updated_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "entitlements-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn webhook_status(&self, event_id: &str) -> Result<Option<String>, AppError> {
        sqlx::query_scalar::<_, String>(
            "SELECT status FROM stripe_webhook_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to read webhook event", e))
    }
}

#[async_trait]
impl BillingStore for Database {
    #[instrument(skip(self))]
    async fn ping(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["ping"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Tenant billing
    // =========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn get_tenant_billing(&self, tenant_id: Uuid) -> Result<Option<TenantBilling>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_tenant_billing"])
            .start_timer();

        let row = sqlx::query_as::<_, TenantBilling>(&format!(
            "SELECT {} FROM tenant_billing WHERE tenant_id = $1",
            TENANT_BILLING_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get tenant billing", e))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn find_tenant_by_customer(&self, customer_id: &str) -> Result<Option<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_tenant_by_customer"])
            .start_timer();

        let tenant_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT tenant_id FROM tenant_billing
            WHERE stripe_customer_id = $1
            ORDER BY updated_utc DESC
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find tenant by customer", e))?;

        timer.observe_duration();
        Ok(tenant_id)
    }

    #[instrument(skip(self))]
    async fn find_tenant_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_tenant_by_subscription"])
            .start_timer();

        let tenant_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT tenant_id FROM tenant_billing
            WHERE stripe_subscription_id = $1
            ORDER BY updated_utc DESC
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find tenant by subscription", e))?;

        timer.observe_duration();
        Ok(tenant_id)
    }

    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id, plan = %input.plan, status = %input.status))]
    async fn upsert_tenant_billing(
        &self,
        input: &UpsertTenantBilling,
    ) -> Result<UpsertOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_tenant_billing"])
            .start_timer();

        // GREATEST ignores NULLs, so a write without an event time keeps the stored one.
        let written = sqlx::query_as::<_, TenantBilling>(&format!(
            r#"
            INSERT INTO tenant_billing (tenant_id, plan, status, stripe_customer_id, stripe_subscription_id, trial_ends_at, current_period_end, cancel_at_period_end, payment_failed_at, last_event_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (tenant_id) DO UPDATE SET
                plan = EXCLUDED.plan,
                status = EXCLUDED.status,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                trial_ends_at = EXCLUDED.trial_ends_at,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                payment_failed_at = EXCLUDED.payment_failed_at,
                last_event_at = GREATEST(EXCLUDED.last_event_at, tenant_billing.last_event_at),
                updated_utc = NOW()
            WHERE tenant_billing.last_event_at IS NULL
               OR EXCLUDED.last_event_at IS NULL
               OR EXCLUDED.last_event_at >= tenant_billing.last_event_at
            RETURNING {}
            "#,
            TENANT_BILLING_COLUMNS
        ))
        .bind(input.tenant_id)
        .bind(input.plan.as_str())
        .bind(input.status.as_str())
        .bind(&input.stripe_customer_id)
        .bind(&input.stripe_subscription_id)
        .bind(input.trial_ends_at)
        .bind(input.current_period_end)
        .bind(input.cancel_at_period_end)
        .bind(input.payment_failed_at)
        .bind(input.event_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to upsert tenant billing", e))?;

        timer.observe_duration();

        match written {
            Some(row) => {
                info!("Tenant billing written");
                Ok(UpsertOutcome { row, applied: true })
            }
            None => {
                warn!(event_at = ?input.event_at, "Stale billing update ignored");
                let row = self.get_tenant_billing(input.tenant_id).await?.ok_or_else(|| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Tenant billing row vanished during upsert"
                    ))
                })?;
                Ok(UpsertOutcome {
                    row,
                    applied: false,
                })
            }
        }
    }

    // =========================================================================
    // AI usage
    // =========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn get_ai_usage(&self, tenant_id: Uuid, period: NaiveDate) -> Result<AiUsage, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_ai_usage"])
            .start_timer();

        let usage = sqlx::query_as::<_, AiUsage>(
            r#"
            SELECT tenant_id, period_start, message_count, input_tokens, output_tokens
            FROM ai_usage
            WHERE tenant_id = $1 AND period_start = $2
            "#,
        )
        .bind(tenant_id)
        .bind(period)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get AI usage", e))?;

        timer.observe_duration();
        Ok(usage.unwrap_or_else(|| AiUsage::empty(tenant_id, period)))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn reserve_ai_message(
        &self,
        tenant_id: Uuid,
        period: NaiveDate,
        limit: Option<i64>,
    ) -> Result<Option<i64>, AppError> {
        if limit.is_some_and(|l| l <= 0) {
            return Ok(None);
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["reserve_ai_message"])
            .start_timer();

        let count = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO ai_usage (tenant_id, period_start, message_count)
            VALUES ($1, $2, 1)
            ON CONFLICT (tenant_id, period_start) DO UPDATE SET
                message_count = ai_usage.message_count + 1,
                updated_utc = NOW()
            WHERE $3::BIGINT IS NULL OR ai_usage.message_count < $3::BIGINT
            RETURNING message_count
            "#,
        )
        .bind(tenant_id)
        .bind(period)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to reserve AI message", e))?;

        timer.observe_duration();
        Ok(count)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn release_ai_message(&self, tenant_id: Uuid, period: NaiveDate) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["release_ai_message"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE ai_usage
            SET message_count = GREATEST(message_count - 1, 0), updated_utc = NOW()
            WHERE tenant_id = $1 AND period_start = $2
            "#,
        )
        .bind(tenant_id)
        .bind(period)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to release AI message", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn add_ai_tokens(
        &self,
        tenant_id: Uuid,
        period: NaiveDate,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_ai_tokens"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO ai_usage (tenant_id, period_start, input_tokens, output_tokens)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, period_start) DO UPDATE SET
                input_tokens = ai_usage.input_tokens + EXCLUDED.input_tokens,
                output_tokens = ai_usage.output_tokens + EXCLUDED.output_tokens,
                updated_utc = NOW()
            "#,
        )
        .bind(tenant_id)
        .bind(period)
        .bind(input_tokens.max(0))
        .bind(output_tokens.max(0))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to add AI tokens", e))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Webhook idempotency
    // =========================================================================

    #[instrument(skip(self))]
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        stale_after: ChronoDuration,
    ) -> Result<WebhookClaim, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_webhook_event"])
            .start_timer();

        let inserted = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO stripe_webhook_events (event_id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING attempts
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to claim webhook event", e))?;

        if inserted.is_some() {
            timer.observe_duration();
            return Ok(WebhookClaim::New);
        }

        let stale_before: DateTime<Utc> = Utc::now() - stale_after;
        let reclaimed = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE stripe_webhook_events
            SET status = 'processing', attempts = attempts + 1, updated_utc = NOW()
            WHERE event_id = $1
              AND (status = 'failed' OR (status = 'processing' AND updated_utc < $2))
            RETURNING attempts
            "#,
        )
        .bind(event_id)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to reclaim webhook event", e))?;

        let claim = match reclaimed {
            Some(attempt) => WebhookClaim::Retry { attempt },
            None => match self.webhook_status(event_id).await? {
                Some(status) if WebhookEventStatus::from_string(&status).is_final() => {
                    WebhookClaim::AlreadyProcessed
                }
                _ => WebhookClaim::InFlight,
            },
        };

        timer.observe_duration();
        Ok(claim)
    }

    #[instrument(skip(self))]
    async fn complete_webhook_event(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_webhook_event"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET status = $2, last_error = NULL, processed_utc = NOW(), updated_utc = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to complete webhook event", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail_webhook_event(&self, event_id: &str, error: &str) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fail_webhook_event"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET status = 'failed', last_error = $2, updated_utc = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to mark webhook event failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Audit log
    // =========================================================================

    #[instrument(skip(self, entry), fields(tenant_id = %entry.tenant_id, action = %entry.action))]
    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<AuditLogEntry, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_audit"])
            .start_timer();

        let row = sqlx::query_as::<_, AuditLogEntry>(
            r#"
            INSERT INTO billing_audit_log (entry_id, tenant_id, action, actor, details)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING entry_id, tenant_id, action, actor, details, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.tenant_id)
        .bind(&entry.action)
        .bind(&entry.actor)
        .bind(&entry.details)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to append audit entry", e))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_audit(&self, tenant_id: Uuid, limit: i64) -> Result<Vec<AuditLogEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_audit"])
            .start_timer();

        let rows = sqlx::query_as::<_, AuditLogEntry>(
            r#"
            SELECT entry_id, tenant_id, action, actor, details, created_utc
            FROM billing_audit_log
            WHERE tenant_id = $1
            ORDER BY created_utc DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list audit entries", e))?;

        timer.observe_duration();
        Ok(rows)
    }
}
