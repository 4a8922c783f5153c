//! Reconciler - moves escrowed payments to their terminal state
//!
//! Release and refund both go through a conditional `IN_ESCROW -> X`
//! write, which is also what makes them fire at most once. When a release
//! finds no payment row at all, a `RELEASED` record is synthesized from the
//! engagement instead of failing, and flagged for operator audit.

use crate::{
    error::SettlementError,
    models::{AuditEntry, AuditKind, CancelReason, Engagement, Payment, PaymentStatus},
    refund_policy::{self, RefundSplit},
    retry::RetryPolicy,
    store::LedgerStore,
    SettlementResult,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a release attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    /// Held funds were released by this call
    Released(Payment),
    /// No payment existed; this call created a released record
    Synthesized(Payment),
    /// Nothing to do, the payment had already left escrow
    AlreadySettled(Payment),
}

impl ReleaseOutcome {
    /// Whether this call moved money
    pub fn fired(&self) -> bool {
        !matches!(self, Self::AlreadySettled(_))
    }

    pub fn payment(&self) -> &Payment {
        match self {
            Self::Released(p) | Self::Synthesized(p) | Self::AlreadySettled(p) => p,
        }
    }
}

/// Result of a refund attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RefundOutcome {
    /// Held funds were refunded by this call
    Refunded { payment: Payment, split: RefundSplit },
    /// The payment had already left escrow
    AlreadySettled(Payment),
    /// No payment was ever recorded for the engagement
    NoPayment,
}

impl RefundOutcome {
    pub fn split(&self) -> Option<&RefundSplit> {
        match self {
            Self::Refunded { split, .. } => Some(split),
            _ => None,
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Release the engagement's escrowed payment to the provider
    pub async fn release(
        &self,
        engagement: &Engagement,
        now: DateTime<Utc>,
    ) -> SettlementResult<ReleaseOutcome> {
        if let Some(payment) = self.current_payment(engagement).await? {
            return self.release_held(payment, now).await;
        }

        let store = self.store.as_ref();
        let synthesized = Payment::synthesized_release(engagement, now);
        let candidate = &synthesized;
        let inserted = self
            .retry
            .run("insert_payment_if_absent", move || {
                store.insert_payment_if_absent(candidate)
            })
            .await?;

        if inserted {
            return self.record_synthesized(engagement, synthesized, now).await;
        }

        // another writer recorded a payment first
        match self.current_payment(engagement).await? {
            Some(payment) => self.release_held(payment, now).await,
            None => Err(SettlementError::internal(format!(
                "payment for engagement {} vanished during release",
                engagement.id
            ))),
        }
    }

    /// Refund the engagement's escrowed payment according to `reason`
    pub async fn refund(
        &self,
        engagement: &Engagement,
        reason: CancelReason,
        now: DateTime<Utc>,
    ) -> SettlementResult<RefundOutcome> {
        let store = self.store.as_ref();

        let Some(payment) = self.current_payment(engagement).await? else {
            warn!(event_id = %engagement.id, "cancelled engagement has no payment to refund");
            return Ok(RefundOutcome::NoPayment);
        };

        let target = reason.refund_status();
        if payment.validate_transition(target).is_err() {
            return Ok(RefundOutcome::AlreadySettled(payment));
        }

        let payment_id = payment.id;
        let refunded = self
            .retry
            .run("transition_payment", move || {
                store.transition_payment(payment_id, PaymentStatus::InEscrow, target, now)
            })
            .await?;

        let Some(refunded) = refunded else {
            return Ok(RefundOutcome::AlreadySettled(
                self.current_payment(engagement).await?.unwrap_or(payment),
            ));
        };

        let Some(split) = refund_policy::breakdown(&refunded) else {
            return Ok(RefundOutcome::AlreadySettled(refunded));
        };

        info!(
            event_id = %engagement.id,
            payment_id = %refunded.id,
            status = %refunded.status,
            requester_share = split.requester_share,
            provider_share = split.provider_share,
            "Refunded escrowed payment"
        );

        store
            .record(
                AuditEntry::new(AuditKind::PaymentRefunded, Some(engagement.id), now)
                    .with_payment(&refunded)
                    .with_metadata(serde_json::json!({
                        "reason": reason,
                        "requester_share": split.requester_share,
                        "provider_share": split.provider_share,
                    })),
            )
            .await;

        Ok(RefundOutcome::Refunded {
            payment: refunded,
            split,
        })
    }

    async fn current_payment(&self, engagement: &Engagement) -> SettlementResult<Option<Payment>> {
        let store = self.store.as_ref();
        let event_id = engagement.id;
        self.retry
            .run("payment_for_event", move || store.payment_for_event(event_id))
            .await
    }

    async fn release_held(
        &self,
        payment: Payment,
        now: DateTime<Utc>,
    ) -> SettlementResult<ReleaseOutcome> {
        if payment.validate_transition(PaymentStatus::Released).is_err() {
            return Ok(ReleaseOutcome::AlreadySettled(payment));
        }

        let store = self.store.as_ref();
        let payment_id = payment.id;
        let released = self
            .retry
            .run("transition_payment", move || {
                store.transition_payment(payment_id, PaymentStatus::InEscrow, PaymentStatus::Released, now)
            })
            .await?;

        let Some(released) = released else {
            // lost the race to a concurrent release or refund
            return Ok(ReleaseOutcome::AlreadySettled(payment));
        };

        info!(
            event_id = ?released.event_id,
            payment_id = %released.id,
            amount = released.amount,
            "Released escrowed payment"
        );

        store
            .record(
                AuditEntry::new(AuditKind::PaymentReleased, released.event_id, now)
                    .with_payment(&released)
                    .with_actor(released.payee_id.clone()),
            )
            .await;

        Ok(ReleaseOutcome::Released(released))
    }

    async fn record_synthesized(
        &self,
        engagement: &Engagement,
        payment: Payment,
        now: DateTime<Utc>,
    ) -> SettlementResult<ReleaseOutcome> {
        warn!(
            event_id = %engagement.id,
            payment_id = %payment.id,
            amount = payment.amount,
            "No payment found at release; synthesized a RELEASED record for audit"
        );

        self.store
            .record(
                AuditEntry::new(AuditKind::PaymentSynthesized, Some(engagement.id), now)
                    .with_payment(&payment)
                    .with_metadata(serde_json::json!({
                        "payer_id": payment.payer_id,
                        "payee_id": payment.payee_id,
                        "source": "release without payment row",
                    })),
            )
            .await;

        Ok(ReleaseOutcome::Synthesized(payment))
    }
}
