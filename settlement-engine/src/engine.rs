//! Settlement Engine - transition functions over engagements and payments
//!
//! Every operation re-reads the ledger, checks the lifecycle rules, and
//! commits through the store's conditional updates. The engine holds no
//! state of its own between calls, so any number of instances may serve
//! the same ledger.

use crate::{
    clock::Clock,
    config::SettlementConfig,
    error::SettlementError,
    finalizer::Finalizer,
    models::{
        AuditEntry, AuditKind, CancelReason, Engagement, EngagementStatus, Payment, Role,
    },
    notifier::{self, Notifier, SYSTEM_SENDER},
    reconciler::{Reconciler, RefundOutcome, ReleaseOutcome},
    refund_policy::{self, RefundSplit},
    retry::RetryPolicy,
    store::LedgerStore,
    SettlementResult,
};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Booking request for a new engagement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEngagement {
    pub requester_id: String,
    pub provider_id: String,
    pub date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub final_amount: i64,
}

/// Result of a confirm call
#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    /// This call set the caller's confirmation mark
    pub accepted: bool,
    /// Both marks are set after this call
    pub both_confirmed: bool,
    pub engagement: Engagement,
    /// Present when this call drove the release path
    pub release: Option<ReleaseOutcome>,
}

/// Result of a cancel call
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub accepted: bool,
    pub engagement: Engagement,
    pub refund: RefundOutcome,
}

impl CancelOutcome {
    pub fn split(&self) -> Option<&RefundSplit> {
        self.refund.split()
    }
}

/// Payment with its display-time split
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentView {
    pub payment: Payment,
    pub split: Option<RefundSplit>,
}

pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    finalizer: Finalizer,
    reconciler: Reconciler,
    notifications_enabled: bool,
}

impl SettlementEngine {
    pub fn new(
        config: &SettlementConfig,
        store: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry = RetryPolicy::new(config.max_conflict_retries, config.retry_backoff());

        Self {
            finalizer: Finalizer::new(store.clone(), clock.clone(), retry),
            reconciler: Reconciler::new(store.clone(), retry),
            store,
            notifier,
            clock,
            retry,
            notifications_enabled: config.notifications_enabled,
        }
    }

    // ========== BOOKING ==========

    /// Create an engagement in `CONFIRMED`
    pub async fn book(&self, request: NewEngagement) -> SettlementResult<Engagement> {
        if request.final_amount <= 0 || request.final_amount > refund_policy::MAX_AMOUNT {
            return Err(SettlementError::invalid_request(format!(
                "Amount must be between 1 and {}, got {}",
                refund_policy::MAX_AMOUNT,
                request.final_amount
            )));
        }
        if request.requester_id.trim().is_empty() || request.provider_id.trim().is_empty() {
            return Err(SettlementError::invalid_request("Both party ids are required"));
        }
        if request.requester_id == request.provider_id {
            return Err(SettlementError::invalid_request(
                "Requester and provider must be different parties",
            ));
        }
        if let (Some(start), Some(end)) = (request.start_time, request.end_time) {
            if start == end {
                return Err(SettlementError::invalid_request(
                    "End time must differ from start time",
                ));
            }
        }

        let now = self.clock.now();
        let engagement = Engagement::new(
            request.requester_id,
            request.provider_id,
            request.date,
            request.start_time,
            request.end_time,
            request.final_amount,
            now,
        );

        self.store.insert_engagement(&engagement).await?;

        info!(
            event_id = %engagement.id,
            requester = %engagement.requester_id,
            provider = %engagement.provider_id,
            amount = engagement.final_amount,
            "Booked engagement"
        );

        self.store
            .record(
                AuditEntry::new(AuditKind::EngagementBooked, Some(engagement.id), now)
                    .with_actor(engagement.requester_id.clone())
                    .with_metadata(serde_json::json!({
                        "final_amount": engagement.final_amount,
                        "date": engagement.date,
                    })),
            )
            .await;

        Ok(engagement)
    }

    /// Record an already captured amount as held for the engagement
    pub async fn hold_funds(&self, event_id: Uuid, payer_id: &str) -> SettlementResult<Payment> {
        let engagement = self.load(event_id).await?;

        if engagement.requester_id != payer_id {
            return Err(SettlementError::forbidden(format!(
                "{} is not the requester of engagement {}",
                payer_id, event_id
            )));
        }
        if !engagement.is_actionable() {
            return Err(SettlementError::already_terminal(
                engagement.status.to_string(),
                format!("engagement {} no longer accepts funds", event_id),
            ));
        }

        let now = self.clock.now();
        let payment = Payment::held(&engagement, now);
        let store = self.store.as_ref();
        let candidate = &payment;
        let inserted = self
            .retry
            .run("insert_held_payment", move || store.insert_held_payment(candidate))
            .await?;

        if !inserted {
            // cancelled or fully confirmed since the check above
            let current = self.load(event_id).await?;
            if !current.is_actionable() {
                return Err(SettlementError::already_terminal(
                    current.status.to_string(),
                    format!("engagement {} no longer accepts funds", event_id),
                ));
            }
            return Err(SettlementError::invalid_request(format!(
                "Engagement {} already holds funds",
                event_id
            )));
        }

        info!(
            event_id = %event_id,
            payment_id = %payment.id,
            amount = payment.amount,
            "Funds held in escrow"
        );

        store
            .record(
                AuditEntry::new(AuditKind::PaymentHeld, Some(event_id), now)
                    .with_payment(&payment)
                    .with_actor(payer_id),
            )
            .await;

        Ok(payment)
    }

    // ========== CONFIRMATION ==========

    /// Set the caller's confirmation mark. When both marks are set after
    /// this call's own write, the engagement completes and the escrowed
    /// payment is released.
    pub async fn confirm(
        &self,
        event_id: Uuid,
        actor_id: &str,
        role: Role,
    ) -> SettlementResult<ConfirmOutcome> {
        let engagement = self.load(event_id).await?;
        engagement.authorize(actor_id, role)?;

        if engagement.status == EngagementStatus::Cancelled {
            return Err(cancelled(&engagement));
        }

        if engagement.mark(role).is_some() {
            return self.repeat_confirm(engagement, role).await;
        }

        let now = self.clock.now();
        let store = self.store.as_ref();
        let updated = self
            .retry
            .run("mark_confirmed", move || store.mark_confirmed(event_id, role, now))
            .await?;

        let Some(updated) = updated else {
            // a cancellation or a duplicate confirm committed first
            let current = self.load(event_id).await?;
            if current.status == EngagementStatus::Cancelled {
                return Err(cancelled(&current));
            }
            return self.repeat_confirm(current, role).await;
        };

        info!(event_id = %event_id, role = %role, "Confirmation recorded");
        store
            .record(
                AuditEntry::new(AuditKind::EngagementConfirmed, Some(event_id), now)
                    .with_actor(actor_id)
                    .with_metadata(serde_json::json!({ "role": role })),
            )
            .await;

        if !updated.both_confirmed() {
            let counterpart = updated.party(role.counterpart()).to_string();
            let text = format!(
                "The {} confirmed the engagement on {}. Confirm it too to release the payment.",
                role, updated.date
            );
            self.notify(actor_id, &counterpart, &text).await;

            return Ok(ConfirmOutcome {
                accepted: true,
                both_confirmed: false,
                engagement: updated,
                release: None,
            });
        }

        let (engagement, release) = self.settle_confirmed(updated).await?;
        Ok(ConfirmOutcome {
            accepted: true,
            both_confirmed: true,
            engagement,
            release: Some(release),
        })
    }

    /// Confirm from a role whose mark is already set: no new mark, but an
    /// interrupted completion is finished
    async fn repeat_confirm(
        &self,
        engagement: Engagement,
        role: Role,
    ) -> SettlementResult<ConfirmOutcome> {
        if !engagement.both_confirmed() {
            debug!(event_id = %engagement.id, role = %role, "already confirmed");
            return Ok(ConfirmOutcome {
                accepted: false,
                both_confirmed: false,
                engagement,
                release: None,
            });
        }

        let was_confirmed = engagement.status == EngagementStatus::Confirmed;
        let (engagement, release) = self.settle_confirmed(engagement).await?;
        if !was_confirmed && !release.fired() {
            return Err(SettlementError::already_terminal(
                engagement.status.to_string(),
                format!("both parties already confirmed engagement {}", engagement.id),
            ));
        }

        warn!(event_id = %engagement.id, "finished an interrupted completion");
        Ok(ConfirmOutcome {
            accepted: false,
            both_confirmed: true,
            engagement,
            release: Some(release),
        })
    }

    /// Completion side effects once both marks are set. Each step is a
    /// guarded write, so running this twice changes nothing.
    async fn settle_confirmed(
        &self,
        engagement: Engagement,
    ) -> SettlementResult<(Engagement, ReleaseOutcome)> {
        let now = self.clock.now();
        let store = self.store.as_ref();
        let event_id = engagement.id;

        let engagement = if engagement.status == EngagementStatus::Confirmed {
            let completed = self
                .retry
                .run("complete_engagement", move || store.complete_engagement(event_id, now))
                .await?;
            match completed {
                Some(completed) => {
                    info!(event_id = %event_id, "Engagement completed by dual confirmation");
                    store
                        .record(AuditEntry::new(
                            AuditKind::EngagementCompleted,
                            Some(event_id),
                            now,
                        ))
                        .await;
                    completed
                }
                // the finalizer moved it in between
                None => self.load(event_id).await?,
            }
        } else {
            engagement
        };

        let release = self.reconciler.release(&engagement, now).await?;

        if release.fired() {
            let text = notifier::completed_text(&engagement);
            self.notify(SYSTEM_SENDER, &engagement.requester_id, &text).await;
            self.notify(SYSTEM_SENDER, &engagement.provider_id, &text).await;
        }

        Ok((engagement, release))
    }

    // ========== CANCELLATION ==========

    /// Cancel the engagement on behalf of `cancelled_by` and refund the
    /// escrowed payment according to `reason`
    pub async fn cancel(
        &self,
        event_id: Uuid,
        actor_id: &str,
        cancelled_by: Role,
        reason: CancelReason,
    ) -> SettlementResult<CancelOutcome> {
        let engagement = self.load(event_id).await?;
        engagement.authorize(actor_id, cancelled_by)?;

        if reason.filed_by() != cancelled_by {
            return Err(SettlementError::invalid_request(format!(
                "{} cannot be filed by the {}",
                reason, cancelled_by
            )));
        }

        if engagement.status == EngagementStatus::Cancelled {
            self.finish_refund(&engagement).await?;
            return Err(cancelled(&engagement));
        }
        engagement.validate_transition(EngagementStatus::Cancelled)?;

        let now = self.clock.now();
        let store = self.store.as_ref();
        let updated = self
            .retry
            .run("cancel_engagement", move || {
                store.cancel_engagement(event_id, cancelled_by, reason, now)
            })
            .await?;

        let Some(cancelled_engagement) = updated else {
            // a confirmation or another cancellation committed first
            let current = self.load(event_id).await?;
            return Err(SettlementError::already_terminal(
                current.status.to_string(),
                format!("engagement {} can no longer be cancelled", event_id),
            ));
        };

        info!(
            event_id = %event_id,
            cancelled_by = %cancelled_by,
            reason = %reason,
            "Engagement cancelled"
        );
        store
            .record(
                AuditEntry::new(AuditKind::EngagementCancelled, Some(event_id), now)
                    .with_actor(actor_id)
                    .with_metadata(serde_json::json!({
                        "cancelled_by": cancelled_by,
                        "reason": reason,
                    })),
            )
            .await;

        let refund = self.reconciler.refund(&cancelled_engagement, reason, now).await?;

        let counterpart = cancelled_engagement.party(cancelled_by.counterpart()).to_string();
        let text =
            notifier::cancelled_text(&cancelled_engagement, cancelled_by, reason, refund.split());
        self.notify(actor_id, &counterpart, &text).await;

        Ok(CancelOutcome {
            accepted: true,
            engagement: cancelled_engagement,
            refund,
        })
    }

    /// Refund a payment left in escrow by a cancellation that committed
    /// its status write but not its refund
    async fn finish_refund(&self, engagement: &Engagement) -> SettlementResult<()> {
        let Some(reason) = engagement.cancel_reason else {
            return Ok(());
        };

        let refund = self
            .reconciler
            .refund(engagement, reason, self.clock.now())
            .await?;
        if let RefundOutcome::Refunded { split, .. } = &refund {
            warn!(event_id = %engagement.id, "finished an interrupted refund");
            if let Some(by) = engagement.cancelled_by {
                let counterpart = engagement.party(by.counterpart()).to_string();
                let text = notifier::cancelled_text(engagement, by, reason, Some(split));
                self.notify(engagement.party(by), &counterpart, &text).await;
            }
        }
        Ok(())
    }

    // ========== READS ==========

    /// Time-complete the actor's past engagements; never fails
    pub async fn finalize_due(&self, actor_id: &str) -> usize {
        self.finalizer.finalize_due(actor_id).await
    }

    /// All engagements of an actor, after a finalizer sweep
    pub async fn get_engagements_for(&self, actor_id: &str) -> SettlementResult<Vec<Engagement>> {
        let transitioned = self.finalize_due(actor_id).await;
        if transitioned > 0 {
            debug!(actor_id, transitioned, "finalized past engagements on read");
        }

        let store = self.store.as_ref();
        self.retry
            .run("engagements_for", move || store.engagements_for(actor_id))
            .await
    }

    pub async fn engagement(&self, event_id: Uuid) -> SettlementResult<Engagement> {
        self.load(event_id).await
    }

    /// Current payment of an engagement with its display split
    pub async fn payment_for(&self, event_id: Uuid) -> SettlementResult<Option<PaymentView>> {
        let store = self.store.as_ref();
        let payment = self
            .retry
            .run("payment_for_event", move || store.payment_for_event(event_id))
            .await?;

        Ok(payment.map(|payment| PaymentView {
            split: refund_policy::breakdown(&payment),
            payment,
        }))
    }

    pub async fn audit_trail(&self, event_id: Uuid) -> SettlementResult<Vec<AuditEntry>> {
        self.store.audit_trail(event_id).await
    }

    // ========== HELPERS ==========

    async fn load(&self, event_id: Uuid) -> SettlementResult<Engagement> {
        let store = self.store.as_ref();
        self.retry
            .run("get_engagement", move || store.get_engagement(event_id))
            .await?
            .ok_or_else(|| SettlementError::not_found(format!("Engagement {}", event_id)))
    }

    async fn notify(&self, from_id: &str, to_id: &str, text: &str) {
        if !self.notifications_enabled {
            return;
        }
        if let Err(e) = self.notifier.notify(from_id, to_id, text).await {
            warn!(to = to_id, "notice not delivered: {}", e);
        }
    }
}

fn cancelled(engagement: &Engagement) -> SettlementError {
    SettlementError::already_terminal(
        engagement.status.to_string(),
        format!("engagement {} was cancelled", engagement.id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::PaymentStatus;
    use crate::notifier::RecordingNotifier;
    use crate::store::InMemoryLedger;
    use chrono::{Duration, TimeZone, Utc};

    const REQ: &str = "alice";
    const PROV: &str = "bob";

    struct Harness {
        engine: Arc<SettlementEngine>,
        ledger: InMemoryLedger,
        clock: Arc<ManualClock>,
        notifier: RecordingNotifier,
    }

    fn harness() -> Harness {
        let ledger = InMemoryLedger::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 9, 1, 8, 0, 0).unwrap(),
        ));
        let notifier = RecordingNotifier::new();
        let config = SettlementConfig {
            retry_backoff_ms: 1,
            ..SettlementConfig::default()
        };
        let engine = SettlementEngine::new(
            &config,
            Arc::new(ledger.clone()),
            Arc::new(notifier.clone()),
            clock.clone(),
        );
        Harness {
            engine: Arc::new(engine),
            ledger,
            clock,
            notifier,
        }
    }

    fn request(amount: i64) -> NewEngagement {
        NewEngagement {
            requester_id: REQ.to_string(),
            provider_id: PROV.to_string(),
            date: NaiveDate::from_ymd_opt(2026, 9, 5).unwrap(),
            start_time: NaiveTime::from_hms_opt(18, 0, 0),
            end_time: NaiveTime::from_hms_opt(21, 0, 0),
            final_amount: amount,
        }
    }

    async fn funded(h: &Harness, amount: i64) -> Engagement {
        let engagement = h.engine.book(request(amount)).await.unwrap();
        h.engine.hold_funds(engagement.id, REQ).await.unwrap();
        engagement
    }

    async fn count_kind(h: &Harness, event_id: Uuid, kind: AuditKind) -> usize {
        h.engine
            .audit_trail(event_id)
            .await
            .unwrap()
            .iter()
            .filter(|entry| entry.kind == kind.as_str())
            .count()
    }

    #[tokio::test]
    async fn test_dual_confirmation_releases_payment() {
        let h = harness();
        let e = funded(&h, 100_000).await;

        let first = h.engine.confirm(e.id, REQ, Role::Requester).await.unwrap();
        assert!(first.accepted);
        assert!(!first.both_confirmed);
        assert_eq!(first.engagement.status, EngagementStatus::Confirmed);

        let second = h.engine.confirm(e.id, PROV, Role::Provider).await.unwrap();
        assert!(second.accepted);
        assert!(second.both_confirmed);
        assert_eq!(second.engagement.status, EngagementStatus::Completed);
        assert!(matches!(second.release, Some(ReleaseOutcome::Released(_))));

        let view = h.engine.payment_for(e.id).await.unwrap().unwrap();
        assert_eq!(view.payment.status, PaymentStatus::Released);
        assert_eq!(view.split.unwrap().provider_share, 100_000);
        assert_eq!(count_kind(&h, e.id, AuditKind::PaymentReleased).await, 1);

        assert_eq!(h.notifier.sent_to(REQ).await.len(), 1);
        // the provider also got the "waiting for you" notice
        assert_eq!(h.notifier.sent_to(PROV).await.len(), 2);
    }

    #[tokio::test]
    async fn test_requester_cancellation_splits_eighty_twenty() {
        let h = harness();
        let e = funded(&h, 90_000).await;

        let outcome = h
            .engine
            .cancel(e.id, REQ, Role::Requester, CancelReason::RequesterCancelled)
            .await
            .unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.engagement.status, EngagementStatus::Cancelled);
        assert_eq!(outcome.engagement.cancelled_by, Some(Role::Requester));

        let split = outcome.split().copied().unwrap();
        assert_eq!(split.requester_share, 72_000);
        assert_eq!(split.provider_share, 18_000);
        assert_eq!(split.status, PaymentStatus::RefundedPartial);

        let notices = h.notifier.sent_to(PROV).await;
        assert_eq!(notices.len(), 1);
        assert!(notices[0].text.contains("72000"));
    }

    #[tokio::test]
    async fn test_provider_no_show_refunds_in_full() {
        let h = harness();
        let e = funded(&h, 50_000).await;

        let outcome = h
            .engine
            .cancel(e.id, REQ, Role::Requester, CancelReason::ProviderNoShow)
            .await
            .unwrap();

        let split = outcome.split().copied().unwrap();
        assert_eq!(split.requester_share, 50_000);
        assert_eq!(split.provider_share, 0);

        let view = h.engine.payment_for(e.id).await.unwrap().unwrap();
        assert_eq!(view.payment.status, PaymentStatus::RefundedFull);
    }

    #[tokio::test]
    async fn test_confirmations_after_auto_completion_release_once() {
        let h = harness();
        let e = funded(&h, 60_000).await;

        h.clock.set(Utc.with_ymd_and_hms(2026, 9, 6, 0, 0, 0).unwrap());
        let listed = h.engine.get_engagements_for(PROV).await.unwrap();
        assert_eq!(listed[0].status, EngagementStatus::Completed);
        assert_eq!(
            h.engine.payment_for(e.id).await.unwrap().unwrap().payment.status,
            PaymentStatus::InEscrow
        );

        let first = h.engine.confirm(e.id, PROV, Role::Provider).await.unwrap();
        assert!(first.accepted && !first.both_confirmed);

        let second = h.engine.confirm(e.id, REQ, Role::Requester).await.unwrap();
        assert!(second.both_confirmed);
        assert!(second.release.unwrap().fired());

        let again = h.engine.confirm(e.id, REQ, Role::Requester).await;
        assert!(matches!(again, Err(SettlementError::AlreadyTerminal { .. })));

        assert_eq!(count_kind(&h, e.id, AuditKind::PaymentReleased).await, 1);
        assert_eq!(count_kind(&h, e.id, AuditKind::EngagementAutoCompleted).await, 1);
        assert_eq!(count_kind(&h, e.id, AuditKind::EngagementCompleted).await, 0);
    }

    #[tokio::test]
    async fn test_release_without_payment_synthesizes_once() {
        let h = harness();
        let e = h.engine.book(request(45_000)).await.unwrap();

        h.engine.confirm(e.id, REQ, Role::Requester).await.unwrap();
        let outcome = h.engine.confirm(e.id, PROV, Role::Provider).await.unwrap();

        let Some(ReleaseOutcome::Synthesized(payment)) = outcome.release else {
            panic!("expected a synthesized release");
        };
        assert_eq!(payment.amount, 45_000);
        assert_eq!(payment.status, PaymentStatus::Released);
        assert!(payment.synthesized);

        assert!(h.engine.confirm(e.id, PROV, Role::Provider).await.is_err());
        assert_eq!(h.ledger.payments_for_event(e.id).await.len(), 1);
        assert_eq!(count_kind(&h, e.id, AuditKind::PaymentSynthesized).await, 1);
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent_per_role() {
        let h = harness();
        let e = funded(&h, 20_000).await;

        let first = h.engine.confirm(e.id, REQ, Role::Requester).await.unwrap();
        let second = h.engine.confirm(e.id, REQ, Role::Requester).await.unwrap();

        assert!(first.accepted);
        assert!(!second.accepted);
        assert_eq!(
            first.engagement.requester_confirmed_at,
            second.engagement.requester_confirmed_at
        );
        assert_eq!(count_kind(&h, e.id, AuditKind::EngagementConfirmed).await, 1);
    }

    #[tokio::test]
    async fn test_confirm_rejects_unknown_and_mismatched_callers() {
        let h = harness();
        let e = funded(&h, 20_000).await;

        let missing = h.engine.confirm(Uuid::new_v4(), REQ, Role::Requester).await;
        assert!(matches!(missing, Err(SettlementError::NotFound(_))));

        let swapped = h.engine.confirm(e.id, REQ, Role::Provider).await;
        assert!(matches!(swapped, Err(SettlementError::Forbidden(_))));

        let stranger = h.engine.confirm(e.id, "mallory", Role::Requester).await;
        assert!(matches!(stranger, Err(SettlementError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_confirm_after_cancel_is_terminal() {
        let h = harness();
        let e = funded(&h, 20_000).await;
        h.engine
            .cancel(e.id, PROV, Role::Provider, CancelReason::ProviderCancelled)
            .await
            .unwrap();

        let result = h.engine.confirm(e.id, REQ, Role::Requester).await;
        assert!(matches!(result, Err(SettlementError::AlreadyTerminal { .. })));

        let again = h
            .engine
            .cancel(e.id, PROV, Role::Provider, CancelReason::ProviderCancelled)
            .await;
        assert!(matches!(again, Err(SettlementError::AlreadyTerminal { .. })));
        assert_eq!(count_kind(&h, e.id, AuditKind::PaymentRefunded).await, 1);
    }

    #[tokio::test]
    async fn test_cancel_after_dual_confirmation_is_rejected() {
        let h = harness();
        let e = funded(&h, 20_000).await;
        h.engine.confirm(e.id, REQ, Role::Requester).await.unwrap();
        h.engine.confirm(e.id, PROV, Role::Provider).await.unwrap();

        let result = h
            .engine
            .cancel(e.id, REQ, Role::Requester, CancelReason::RequesterCancelled)
            .await;
        assert!(matches!(result, Err(SettlementError::AlreadyTerminal { .. })));
        assert_eq!(
            h.engine.payment_for(e.id).await.unwrap().unwrap().payment.status,
            PaymentStatus::Released
        );
    }

    #[tokio::test]
    async fn test_cancel_reason_must_match_role() {
        let h = harness();
        let e = funded(&h, 20_000).await;

        let result = h
            .engine
            .cancel(e.id, PROV, Role::Provider, CancelReason::RequesterCancelled)
            .await;
        assert!(matches!(result, Err(SettlementError::InvalidRequest(_))));

        let stored = h.engine.engagement(e.id).await.unwrap();
        assert_eq!(stored.status, EngagementStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_dispute_after_auto_completion_refunds() {
        let h = harness();
        let e = funded(&h, 40_000).await;
        h.clock.advance(Duration::days(10));
        assert_eq!(h.engine.finalize_due(REQ).await, 1);

        let outcome = h
            .engine
            .cancel(e.id, REQ, Role::Requester, CancelReason::ProviderNoShow)
            .await
            .unwrap();
        assert_eq!(outcome.split().unwrap().requester_share, 40_000);
    }

    #[tokio::test]
    async fn test_retried_cancel_finishes_interrupted_refund() {
        let h = harness();
        let e = funded(&h, 90_000).await;

        // status committed, refund never written
        h.ledger
            .cancel_engagement(e.id, Role::Requester, CancelReason::RequesterCancelled, h.clock.now())
            .await
            .unwrap()
            .unwrap();

        let retried = h
            .engine
            .cancel(e.id, REQ, Role::Requester, CancelReason::RequesterCancelled)
            .await;
        assert!(matches!(retried, Err(SettlementError::AlreadyTerminal { .. })));

        let view = h.engine.payment_for(e.id).await.unwrap().unwrap();
        assert_eq!(view.payment.status, PaymentStatus::RefundedPartial);
        assert_eq!(view.split.unwrap().provider_share, 18_000);
    }

    #[tokio::test]
    async fn test_repeat_confirm_finishes_interrupted_completion() {
        let h = harness();
        let e = funded(&h, 30_000).await;

        // both marks committed, completion never ran
        h.ledger.mark_confirmed(e.id, Role::Requester, h.clock.now()).await.unwrap();
        h.ledger.mark_confirmed(e.id, Role::Provider, h.clock.now()).await.unwrap();

        let outcome = h.engine.confirm(e.id, PROV, Role::Provider).await.unwrap();
        assert!(!outcome.accepted);
        assert!(outcome.both_confirmed);
        assert_eq!(outcome.engagement.status, EngagementStatus::Completed);
        assert_eq!(count_kind(&h, e.id, AuditKind::PaymentReleased).await, 1);
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_roll_back() {
        let h = harness();
        let e = funded(&h, 10_000).await;
        h.notifier.fail_deliveries(true);

        h.engine.confirm(e.id, REQ, Role::Requester).await.unwrap();
        let outcome = h.engine.confirm(e.id, PROV, Role::Provider).await.unwrap();

        assert!(outcome.both_confirmed);
        assert!(h.notifier.sent().await.is_empty());
        assert_eq!(
            h.engine.payment_for(e.id).await.unwrap().unwrap().payment.status,
            PaymentStatus::Released
        );
    }

    #[tokio::test]
    async fn test_store_conflicts_are_retried() {
        let h = harness();
        let e = funded(&h, 10_000).await;

        h.ledger.inject_conflicts(2);
        let outcome = h.engine.confirm(e.id, REQ, Role::Requester).await.unwrap();
        assert!(outcome.accepted);

        h.ledger.inject_conflicts(10);
        let result = h.engine.confirm(e.id, PROV, Role::Provider).await;
        assert!(matches!(result, Err(SettlementError::StoreConflict(_))));
    }

    #[tokio::test]
    async fn test_booking_validation() {
        let h = harness();

        let mut zero = request(0);
        assert!(h.engine.book(zero.clone()).await.is_err());
        zero.final_amount = 100;
        zero.provider_id = REQ.to_string();
        assert!(h.engine.book(zero).await.is_err());

        let too_large = request(refund_policy::MAX_AMOUNT + 1);
        assert!(matches!(
            h.engine.book(too_large).await,
            Err(SettlementError::InvalidRequest(_))
        ));
        assert!(h.engine.book(request(500_000_000_000_000_000)).await.is_err());

        let mut same_times = request(100);
        same_times.end_time = same_times.start_time;
        assert!(matches!(
            h.engine.book(same_times).await,
            Err(SettlementError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_hold_funds_rules() {
        let h = harness();
        let e = h.engine.book(request(15_000)).await.unwrap();

        let wrong_payer = h.engine.hold_funds(e.id, PROV).await;
        assert!(matches!(wrong_payer, Err(SettlementError::Forbidden(_))));

        let payment = h.engine.hold_funds(e.id, REQ).await.unwrap();
        assert_eq!(payment.amount, 15_000);
        assert_eq!(payment.payee_id, PROV);

        let second = h.engine.hold_funds(e.id, REQ).await;
        assert!(matches!(second, Err(SettlementError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_hold_funds_rejects_cancelled_engagement() {
        let h = harness();
        let e = h.engine.book(request(15_000)).await.unwrap();
        h.engine
            .cancel(e.id, PROV, Role::Provider, CancelReason::ProviderCancelled)
            .await
            .unwrap();

        let result = h.engine.hold_funds(e.id, REQ).await;
        assert!(matches!(result, Err(SettlementError::AlreadyTerminal { .. })));
        assert!(h.ledger.payments_for_event(e.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_hold_funds_rejects_dual_confirmed_engagement() {
        let h = harness();
        let e = h.engine.book(request(15_000)).await.unwrap();
        h.engine.confirm(e.id, REQ, Role::Requester).await.unwrap();
        h.engine.confirm(e.id, PROV, Role::Provider).await.unwrap();

        let result = h.engine.hold_funds(e.id, REQ).await;
        assert!(matches!(result, Err(SettlementError::AlreadyTerminal { .. })));

        let payments = h.ledger.payments_for_event(e.id).await;
        assert_eq!(payments.len(), 1);
        assert!(payments[0].synthesized);
        assert_eq!(
            h.engine.payment_for(e.id).await.unwrap().unwrap().payment.status,
            PaymentStatus::Released
        );
    }

    #[tokio::test]
    async fn test_large_amount_cancellation_records_refund() {
        let h = harness();
        let e = funded(&h, refund_policy::MAX_AMOUNT).await;

        let outcome = h
            .engine
            .cancel(e.id, REQ, Role::Requester, CancelReason::RequesterCancelled)
            .await
            .unwrap();
        let split = outcome.split().copied().unwrap();
        assert_eq!(split.provider_share, refund_policy::MAX_AMOUNT / 5);
        assert_eq!(split.requester_share + split.provider_share, refund_policy::MAX_AMOUNT);
        assert_eq!(count_kind(&h, e.id, AuditKind::PaymentRefunded).await, 1);
        assert_eq!(h.notifier.sent_to(PROV).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_confirmations_release_exactly_once() {
        for _ in 0..25 {
            let h = harness();
            let id = funded(&h, 100_000).await.id;

            let requester = {
                let engine = h.engine.clone();
                tokio::spawn(async move { engine.confirm(id, REQ, Role::Requester).await })
            };
            let provider = {
                let engine = h.engine.clone();
                tokio::spawn(async move { engine.confirm(id, PROV, Role::Provider).await })
            };

            let a = requester.await.unwrap().unwrap();
            let b = provider.await.unwrap().unwrap();
            assert!(a.both_confirmed || b.both_confirmed);

            let stored = h.engine.engagement(id).await.unwrap();
            assert_eq!(stored.status, EngagementStatus::Completed);
            assert_eq!(count_kind(&h, id, AuditKind::PaymentReleased).await, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_and_confirm_race_has_one_winner() {
        for _ in 0..25 {
            let h = harness();
            let id = funded(&h, 50_000).await.id;
            h.engine.confirm(id, PROV, Role::Provider).await.unwrap();

            let confirm = {
                let engine = h.engine.clone();
                tokio::spawn(async move { engine.confirm(id, REQ, Role::Requester).await })
            };
            let cancel = {
                let engine = h.engine.clone();
                tokio::spawn(async move {
                    engine
                        .cancel(id, REQ, Role::Requester, CancelReason::RequesterCancelled)
                        .await
                })
            };

            let confirmed = confirm.await.unwrap();
            let cancelled = cancel.await.unwrap();
            assert!(confirmed.is_ok() != cancelled.is_ok());

            let payments = h.ledger.payments_for_event(id).await;
            assert_eq!(payments.len(), 1);
            let expected = if confirmed.is_ok() {
                PaymentStatus::Released
            } else {
                PaymentStatus::RefundedPartial
            };
            assert_eq!(payments[0].status, expected);
        }
    }
}
