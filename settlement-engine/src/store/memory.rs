//! In-memory ledger store
//!
//! Each conditional update holds the table's write guard across the guard
//! check, the write and the read-back, so it behaves like an
//! update-returning statement.

use super::LedgerStore;
use crate::{
    error::SettlementError,
    models::{
        AuditEntry, CancelReason, Engagement, EngagementStatus, Payment, PaymentStatus, Role,
    },
    SettlementResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
pub struct InMemoryLedger {
    engagements: Arc<RwLock<HashMap<Uuid, Engagement>>>,
    /// Insertion-ordered
    payments: Arc<RwLock<Vec<Payment>>>,
    audit: Arc<RwLock<Vec<AuditEntry>>>,
    /// Conditional writes left to fail with a conflict
    pending_conflicts: Arc<AtomicU32>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` conditional writes fail with
    /// `StoreConflict`, as a contended database would.
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// All payments ever recorded for an event, oldest first
    pub async fn payments_for_event(&self, event_id: Uuid) -> Vec<Payment> {
        self.payments
            .read()
            .await
            .iter()
            .filter(|p| p.event_id == Some(event_id))
            .cloned()
            .collect()
    }

    fn take_conflict(&self) -> SettlementResult<()> {
        let consumed = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(SettlementError::store_conflict("injected write conflict")),
            Err(_) => Ok(()),
        }
    }

    async fn update_engagement<F>(&self, id: Uuid, apply: F) -> SettlementResult<Option<Engagement>>
    where
        F: FnOnce(&mut Engagement) -> bool + Send,
    {
        self.take_conflict()?;
        let mut engagements = self.engagements.write().await;
        let Some(engagement) = engagements.get_mut(&id) else {
            return Ok(None);
        };
        if apply(engagement) {
            Ok(Some(engagement.clone()))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn insert_engagement(&self, engagement: &Engagement) -> SettlementResult<()> {
        let mut engagements = self.engagements.write().await;
        if engagements.contains_key(&engagement.id) {
            return Err(SettlementError::invalid_request(format!(
                "Engagement {} already exists",
                engagement.id
            )));
        }
        engagements.insert(engagement.id, engagement.clone());
        Ok(())
    }

    async fn get_engagement(&self, id: Uuid) -> SettlementResult<Option<Engagement>> {
        Ok(self.engagements.read().await.get(&id).cloned())
    }

    async fn engagements_for(&self, actor_id: &str) -> SettlementResult<Vec<Engagement>> {
        let mut found: Vec<Engagement> = self
            .engagements
            .read()
            .await
            .values()
            .filter(|e| e.involves(actor_id))
            .cloned()
            .collect();
        found.sort_by(|a, b| (a.date, a.start_time, a.id).cmp(&(b.date, b.start_time, b.id)));
        Ok(found)
    }

    async fn mark_confirmed(
        &self,
        id: Uuid,
        role: Role,
        at: DateTime<Utc>,
    ) -> SettlementResult<Option<Engagement>> {
        self.update_engagement(id, |e| {
            if e.status == EngagementStatus::Cancelled || e.mark(role).is_some() {
                return false;
            }
            match role {
                Role::Requester => e.requester_confirmed_at = Some(at),
                Role::Provider => e.provider_confirmed_at = Some(at),
            }
            e.updated_at = at;
            true
        })
        .await
    }

    async fn complete_engagement(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> SettlementResult<Option<Engagement>> {
        self.update_engagement(id, |e| {
            if e.status != EngagementStatus::Confirmed {
                return false;
            }
            e.status = EngagementStatus::Completed;
            e.completed_at = Some(at);
            e.updated_at = at;
            true
        })
        .await
    }

    async fn cancel_engagement(
        &self,
        id: Uuid,
        by: Role,
        reason: CancelReason,
        at: DateTime<Utc>,
    ) -> SettlementResult<Option<Engagement>> {
        self.update_engagement(id, |e| {
            if !e.is_actionable() {
                return false;
            }
            e.status = EngagementStatus::Cancelled;
            e.cancelled_at = Some(at);
            e.cancelled_by = Some(by);
            e.cancel_reason = Some(reason);
            e.updated_at = at;
            true
        })
        .await
    }

    async fn insert_held_payment(&self, payment: &Payment) -> SettlementResult<bool> {
        self.take_conflict()?;
        // held across the insert so a cancel or final confirmation waits for it
        let engagements = self.engagements.read().await;
        let open = payment
            .event_id
            .and_then(|id| engagements.get(&id))
            .is_some_and(|e| e.is_actionable());
        if !open {
            return Ok(false);
        }

        let mut payments = self.payments.write().await;
        if payments.iter().any(|p| p.event_id == payment.event_id) {
            return Ok(false);
        }
        payments.push(payment.clone());
        Ok(true)
    }

    async fn insert_payment_if_absent(&self, payment: &Payment) -> SettlementResult<bool> {
        self.take_conflict()?;
        let mut payments = self.payments.write().await;
        if payments
            .iter()
            .any(|p| p.event_id.is_some() && p.event_id == payment.event_id)
        {
            return Ok(false);
        }
        payments.push(payment.clone());
        Ok(true)
    }

    async fn payment_for_event(&self, event_id: Uuid) -> SettlementResult<Option<Payment>> {
        let payments = self.payments.read().await;
        let mut for_event = payments.iter().filter(|p| p.event_id == Some(event_id));
        let held = for_event.clone().find(|p| !p.status.is_terminal());
        Ok(held.or_else(|| for_event.next_back()).cloned())
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> SettlementResult<Option<Payment>> {
        self.take_conflict()?;
        let mut payments = self.payments.write().await;
        let Some(payment) = payments.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };
        if payment.status != expected {
            return Ok(None);
        }
        payment.status = to;
        payment.updated_at = at;
        if to.is_terminal() {
            payment.settled_at = Some(at);
        }
        Ok(Some(payment.clone()))
    }

    async fn append_audit(&self, entry: &AuditEntry) -> SettlementResult<()> {
        self.audit.write().await.push(entry.clone());
        Ok(())
    }

    async fn audit_trail(&self, event_id: Uuid) -> SettlementResult<Vec<AuditEntry>> {
        Ok(self
            .audit
            .read()
            .await
            .iter()
            .filter(|entry| entry.event_id == Some(event_id))
            .cloned()
            .collect())
    }
}
