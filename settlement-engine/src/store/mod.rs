//! Ledger store - durable home of engagements, payments and the audit trail
//!
//! Every mutating method is a conditional update: it applies only when the
//! guard described on the method still holds, and returns the freshly
//! committed row (`Some`) or reports that the guard failed (`None`).
//! Adapters must perform the guard check, the write and the read-back as
//! one atomic step per row. A lost optimistic race that the adapter cannot
//! resolve itself is reported as `SettlementError::StoreConflict`.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryLedger;
pub use postgres::PgLedger;

use crate::{
    models::{AuditEntry, CancelReason, Engagement, Payment, PaymentStatus, Role},
    SettlementResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;
use uuid::Uuid;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ========== ENGAGEMENTS ==========

    async fn insert_engagement(&self, engagement: &Engagement) -> SettlementResult<()>;

    async fn get_engagement(&self, id: Uuid) -> SettlementResult<Option<Engagement>>;

    /// Engagements where `actor_id` is either party, ordered by date
    async fn engagements_for(&self, actor_id: &str) -> SettlementResult<Vec<Engagement>>;

    /// Set `role`'s confirmation mark.
    /// Guard: that mark is null and the engagement is not cancelled.
    async fn mark_confirmed(
        &self,
        id: Uuid,
        role: Role,
        at: DateTime<Utc>,
    ) -> SettlementResult<Option<Engagement>>;

    /// Move to `COMPLETED` and stamp `completed_at`.
    /// Guard: status is `CONFIRMED`.
    async fn complete_engagement(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> SettlementResult<Option<Engagement>>;

    /// Move to `CANCELLED` and record who cancelled and why.
    /// Guard: not already cancelled, and at least one confirmation mark
    /// is still null.
    async fn cancel_engagement(
        &self,
        id: Uuid,
        by: Role,
        reason: CancelReason,
        at: DateTime<Utc>,
    ) -> SettlementResult<Option<Engagement>>;

    // ========== PAYMENTS ==========

    /// Insert an `IN_ESCROW` payment.
    /// Guard: the engagement exists, is not cancelled, has at least one
    /// confirmation mark still null, and has no payment row of any status.
    /// The engagement must not change between the check and the insert.
    async fn insert_held_payment(&self, payment: &Payment) -> SettlementResult<bool>;

    /// Insert a payment of any status.
    /// Guard: no payment row at all exists for the same event.
    async fn insert_payment_if_absent(&self, payment: &Payment) -> SettlementResult<bool>;

    /// The `IN_ESCROW` payment for an event if there is one, otherwise
    /// the most recent terminal one
    async fn payment_for_event(&self, event_id: Uuid) -> SettlementResult<Option<Payment>>;

    /// Move a payment from `expected` to `to`.
    /// Guard: current status equals `expected`.
    async fn transition_payment(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> SettlementResult<Option<Payment>>;

    // ========== AUDIT ==========

    async fn append_audit(&self, entry: &AuditEntry) -> SettlementResult<()>;

    /// Audit entries for an event in insertion order
    async fn audit_trail(&self, event_id: Uuid) -> SettlementResult<Vec<AuditEntry>>;

    /// Append an audit entry after a committed transition. A failure here
    /// is logged; the transition it describes already happened.
    async fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.append_audit(&entry).await {
            error!(kind = %entry.kind, event_id = ?entry.event_id, "failed to append audit entry: {}", e);
        }
    }
}
