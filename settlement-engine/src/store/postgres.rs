//! PostgreSQL ledger store
//!
//! Every conditional update is one `UPDATE ... WHERE <guard> RETURNING`
//! statement, so the guard, the write and the read-back commit together.

use super::LedgerStore;
use crate::{
    config::SettlementConfig,
    models::{AuditEntry, CancelReason, Engagement, Payment, PaymentStatus, Role},
    SettlementResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;
use uuid::Uuid;

const ENGAGEMENT_COLUMNS: &str = r#"
    id, requester_id, provider_id, date, start_time, end_time, final_amount, status,
    requester_confirmed_at, provider_confirmed_at, completed_at,
    cancelled_at, cancelled_by, cancel_reason, created_at, updated_at
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, event_id, payer_id, payee_id, amount, status, synthesized,
    created_at, updated_at, settled_at
"#;

/// Ledger store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgLedger {
    pub pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration
    pub async fn connect(config: &SettlementConfig) -> SettlementResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;

        info!("Connected to settlement ledger");

        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> SettlementResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Settlement ledger migrations applied");
        Ok(())
    }

    async fn insert_payment_row(&self, payment: &Payment, guard: &str) -> SettlementResult<bool> {
        let sql = format!(
            r#"
            INSERT INTO payments ({PAYMENT_COLUMNS})
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            {guard}
            ON CONFLICT DO NOTHING
            "#
        );

        let result = sqlx::query(&sql)
            .bind(payment.id)
            .bind(payment.event_id)
            .bind(&payment.payer_id)
            .bind(&payment.payee_id)
            .bind(payment.amount)
            .bind(payment.status)
            .bind(payment.synthesized)
            .bind(payment.created_at)
            .bind(payment.updated_at)
            .bind(payment.settled_at)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    // ========== ENGAGEMENTS ==========

    async fn insert_engagement(&self, engagement: &Engagement) -> SettlementResult<()> {
        let sql = format!(
            r#"
            INSERT INTO engagements ({ENGAGEMENT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#
        );

        sqlx::query(&sql)
            .bind(engagement.id)
            .bind(&engagement.requester_id)
            .bind(&engagement.provider_id)
            .bind(engagement.date)
            .bind(engagement.start_time)
            .bind(engagement.end_time)
            .bind(engagement.final_amount)
            .bind(engagement.status)
            .bind(engagement.requester_confirmed_at)
            .bind(engagement.provider_confirmed_at)
            .bind(engagement.completed_at)
            .bind(engagement.cancelled_at)
            .bind(engagement.cancelled_by)
            .bind(engagement.cancel_reason)
            .bind(engagement.created_at)
            .bind(engagement.updated_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_engagement(&self, id: Uuid) -> SettlementResult<Option<Engagement>> {
        let sql = format!("SELECT {ENGAGEMENT_COLUMNS} FROM engagements WHERE id = $1");
        let engagement = sqlx::query_as::<_, Engagement>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(engagement)
    }

    async fn engagements_for(&self, actor_id: &str) -> SettlementResult<Vec<Engagement>> {
        let sql = format!(
            r#"
            SELECT {ENGAGEMENT_COLUMNS}
            FROM engagements
            WHERE requester_id = $1 OR provider_id = $1
            ORDER BY date, start_time NULLS FIRST, id
            "#
        );
        let engagements = sqlx::query_as::<_, Engagement>(&sql)
            .bind(actor_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(engagements)
    }

    async fn mark_confirmed(
        &self,
        id: Uuid,
        role: Role,
        at: DateTime<Utc>,
    ) -> SettlementResult<Option<Engagement>> {
        let column = match role {
            Role::Requester => "requester_confirmed_at",
            Role::Provider => "provider_confirmed_at",
        };
        let sql = format!(
            r#"
            UPDATE engagements
            SET {column} = $2, updated_at = $2
            WHERE id = $1 AND {column} IS NULL AND status <> 'CANCELLED'
            RETURNING {ENGAGEMENT_COLUMNS}
            "#
        );

        let engagement = sqlx::query_as::<_, Engagement>(&sql)
            .bind(id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;

        Ok(engagement)
    }

    async fn complete_engagement(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> SettlementResult<Option<Engagement>> {
        let sql = format!(
            r#"
            UPDATE engagements
            SET status = 'COMPLETED', completed_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'CONFIRMED'
            RETURNING {ENGAGEMENT_COLUMNS}
            "#
        );

        let engagement = sqlx::query_as::<_, Engagement>(&sql)
            .bind(id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;

        Ok(engagement)
    }

    async fn cancel_engagement(
        &self,
        id: Uuid,
        by: Role,
        reason: CancelReason,
        at: DateTime<Utc>,
    ) -> SettlementResult<Option<Engagement>> {
        let sql = format!(
            r#"
            UPDATE engagements
            SET status = 'CANCELLED', cancelled_at = $2, cancelled_by = $3,
                cancel_reason = $4, updated_at = $2
            WHERE id = $1
              AND status <> 'CANCELLED'
              AND (requester_confirmed_at IS NULL OR provider_confirmed_at IS NULL)
            RETURNING {ENGAGEMENT_COLUMNS}
            "#
        );

        let engagement = sqlx::query_as::<_, Engagement>(&sql)
            .bind(id)
            .bind(at)
            .bind(by)
            .bind(reason)
            .fetch_optional(&self.pool)
            .await?;

        Ok(engagement)
    }

    // ========== PAYMENTS ==========

    async fn insert_held_payment(&self, payment: &Payment) -> SettlementResult<bool> {
        // FOR SHARE makes a concurrent cancel or final confirmation wait, and
        // re-checks the guard against its committed row
        self.insert_payment_row(
            payment,
            r#"
            WHERE EXISTS (
                SELECT 1 FROM engagements
                WHERE id = $2
                  AND status <> 'CANCELLED'
                  AND (requester_confirmed_at IS NULL OR provider_confirmed_at IS NULL)
                FOR SHARE
            )
            AND NOT EXISTS (SELECT 1 FROM payments WHERE event_id = $2)
            "#,
        )
        .await
    }

    async fn insert_payment_if_absent(&self, payment: &Payment) -> SettlementResult<bool> {
        self.insert_payment_row(
            payment,
            "WHERE NOT EXISTS (SELECT 1 FROM payments WHERE event_id = $2)",
        )
        .await
    }

    async fn payment_for_event(&self, event_id: Uuid) -> SettlementResult<Option<Payment>> {
        let sql = format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM payments
            WHERE event_id = $1
            ORDER BY (status = 'IN_ESCROW') DESC, created_at DESC
            LIMIT 1
            "#
        );
        let payment = sqlx::query_as::<_, Payment>(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(payment)
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> SettlementResult<Option<Payment>> {
        let sql = format!(
            r#"
            UPDATE payments
            SET status = $3, updated_at = $4,
                settled_at = CASE WHEN $3 <> 'IN_ESCROW'::payment_status THEN $4 ELSE settled_at END
            WHERE id = $1 AND status = $2
            RETURNING {PAYMENT_COLUMNS}
            "#
        );

        let payment = sqlx::query_as::<_, Payment>(&sql)
            .bind(id)
            .bind(expected)
            .bind(to)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;

        Ok(payment)
    }

    // ========== AUDIT ==========

    async fn append_audit(&self, entry: &AuditEntry) -> SettlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settlement_audit
                (id, kind, event_id, payment_id, actor_id, amount, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.kind)
        .bind(entry.event_id)
        .bind(entry.payment_id)
        .bind(&entry.actor_id)
        .bind(entry.amount)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn audit_trail(&self, event_id: Uuid) -> SettlementResult<Vec<AuditEntry>> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT id, kind, event_id, payment_id, actor_id, amount, metadata, created_at
            FROM settlement_audit
            WHERE event_id = $1
            ORDER BY seq
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}
