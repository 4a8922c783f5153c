//! Core data models for the settlement engine
//!
//! Engagements and payments are independent ledger rows joined by
//! `event_id`. Status values are closed enums; the transition rules live
//! next to them so every caller checks the same table.

use crate::{error::SettlementError, SettlementResult};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Engagement lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "engagement_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngagementStatus {
    /// Booked and awaiting the scheduled date or confirmations
    Confirmed,
    /// Occurred, either by dual confirmation or by schedule
    Completed,
    /// Called off by one of the parties
    Cancelled,
}

impl EngagementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "CONFIRMED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for EngagementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escrowed payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "payment_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Captured and held by the platform
    InEscrow,
    /// Paid out to the payee
    Released,
    /// Returned in full to the payer
    RefundedFull,
    /// Split between payer and payee
    RefundedPartial,
}

impl PaymentStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InEscrow)
    }

    /// Share of the amount owed to the payee, in percent.
    /// `None` while the funds are still held.
    pub fn provider_percent(&self) -> Option<i64> {
        match self {
            Self::InEscrow => None,
            Self::Released => Some(100),
            Self::RefundedPartial => Some(20),
            Self::RefundedFull => Some(0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InEscrow => "IN_ESCROW",
            Self::Released => "RELEASED",
            Self::RefundedFull => "REFUNDED_FULL",
            Self::RefundedPartial => "REFUNDED_PARTIAL",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the engagement a caller acts for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "party_role", rename_all = "lowercase")]
pub enum Role {
    Requester,
    Provider,
}

impl Role {
    pub fn counterpart(&self) -> Self {
        match self {
            Self::Requester => Self::Provider,
            Self::Provider => Self::Requester,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requester => "requester",
            Self::Provider => "provider",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an engagement was called off; selects the refund split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "cancel_reason", rename_all = "snake_case")]
pub enum CancelReason {
    /// Requester withdrew; provider keeps a compensation share
    RequesterCancelled,
    /// Provider withdrew
    ProviderCancelled,
    /// Provider did not show up, reported by the requester
    ProviderNoShow,
}

impl CancelReason {
    /// Payment status recorded when this reason is applied
    pub fn refund_status(&self) -> PaymentStatus {
        match self {
            Self::RequesterCancelled => PaymentStatus::RefundedPartial,
            Self::ProviderCancelled | Self::ProviderNoShow => PaymentStatus::RefundedFull,
        }
    }

    /// Role allowed to file this reason
    pub fn filed_by(&self) -> Role {
        match self {
            Self::RequesterCancelled | Self::ProviderNoShow => Role::Requester,
            Self::ProviderCancelled => Role::Provider,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequesterCancelled => "requester_cancelled",
            Self::ProviderCancelled => "provider_cancelled",
            Self::ProviderNoShow => "provider_no_show",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled, paid booking between a requester and a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Engagement {
    pub id: Uuid,

    // Parties
    pub requester_id: String,
    pub provider_id: String,

    // Schedule
    pub date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,

    // Financials
    pub final_amount: i64,
    pub status: EngagementStatus,

    // Confirmation marks
    pub requester_confirmed_at: Option<DateTime<Utc>>,
    pub provider_confirmed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    // Cancellation
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<Role>,
    pub cancel_reason: Option<CancelReason>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Engagement {
    /// Create a new engagement in `CONFIRMED`
    pub fn new(
        requester_id: String,
        provider_id: String,
        date: NaiveDate,
        start_time: Option<NaiveTime>,
        end_time: Option<NaiveTime>,
        final_amount: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester_id,
            provider_id,
            date,
            start_time,
            end_time,
            final_amount,
            status: EngagementStatus::Confirmed,
            requester_confirmed_at: None,
            provider_confirmed_at: None,
            completed_at: None,
            cancelled_at: None,
            cancelled_by: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recorded party id for a role
    pub fn party(&self, role: Role) -> &str {
        match role {
            Role::Requester => &self.requester_id,
            Role::Provider => &self.provider_id,
        }
    }

    /// Confirmation mark for a role
    pub fn mark(&self, role: Role) -> Option<DateTime<Utc>> {
        match role {
            Role::Requester => self.requester_confirmed_at,
            Role::Provider => self.provider_confirmed_at,
        }
    }

    pub fn both_confirmed(&self) -> bool {
        self.requester_confirmed_at.is_some() && self.provider_confirmed_at.is_some()
    }

    pub fn involves(&self, actor_id: &str) -> bool {
        self.requester_id == actor_id || self.provider_id == actor_id
    }

    /// Confirm and cancel stay actionable until the engagement is
    /// cancelled or both parties have confirmed. An engagement completed
    /// by schedule alone is still open.
    pub fn is_actionable(&self) -> bool {
        self.status != EngagementStatus::Cancelled && !self.both_confirmed()
    }

    /// Reject callers that do not match the recorded party for `role`
    pub fn authorize(&self, actor_id: &str, role: Role) -> SettlementResult<()> {
        if self.party(role) != actor_id {
            return Err(SettlementError::forbidden(format!(
                "{} is not the {} of engagement {}",
                actor_id, role, self.id
            )));
        }
        Ok(())
    }

    /// When the engagement is considered over. A missing end time means
    /// the end of the scheduled day; an end before the start crosses midnight.
    pub fn effective_end(&self) -> DateTime<Utc> {
        let end = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) if end < start => {
                (self.date + Duration::days(1)).and_time(end)
            }
            (_, Some(end)) => self.date.and_time(end),
            (_, None) => self.date.and_time(end_of_day()),
        };
        end.and_utc()
    }

    /// Strictly after the effective end
    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        now > self.effective_end()
    }

    /// Validate a status transition against the lifecycle table
    pub fn validate_transition(&self, to: EngagementStatus) -> SettlementResult<()> {
        let valid = match (self.status, to) {
            (EngagementStatus::Confirmed, EngagementStatus::Completed) => true,
            // includes a dispute after an auto-completion
            (EngagementStatus::Confirmed | EngagementStatus::Completed, EngagementStatus::Cancelled) => {
                !self.both_confirmed()
            }
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(SettlementError::already_terminal(
                self.status.to_string(),
                format!("cannot move engagement {} to {}", self.id, to),
            ))
        }
    }
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

/// Escrowed amount for an engagement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub event_id: Option<Uuid>,
    pub payer_id: String,
    pub payee_id: String,
    pub amount: i64,
    pub status: PaymentStatus,

    /// Created by the reconciler instead of a capture step
    pub synthesized: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Record captured funds as held for an engagement
    pub fn held(engagement: &Engagement, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: Some(engagement.id),
            payer_id: engagement.requester_id.clone(),
            payee_id: engagement.provider_id.clone(),
            amount: engagement.final_amount,
            status: PaymentStatus::InEscrow,
            synthesized: false,
            created_at: now,
            updated_at: now,
            settled_at: None,
        }
    }

    /// Stand-in record for a release that found no payment row
    pub fn synthesized_release(engagement: &Engagement, now: DateTime<Utc>) -> Self {
        Self {
            status: PaymentStatus::Released,
            synthesized: true,
            settled_at: Some(now),
            ..Self::held(engagement, now)
        }
    }

    /// Validate a status transition; only held funds may move
    pub fn validate_transition(&self, to: PaymentStatus) -> SettlementResult<()> {
        if self.status.is_terminal() || !to.is_terminal() {
            return Err(SettlementError::already_terminal(
                self.status.to_string(),
                format!("cannot move payment {} to {}", self.id, to),
            ));
        }
        Ok(())
    }
}

/// Audit entry kinds appended by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    EngagementBooked,
    PaymentHeld,
    EngagementConfirmed,
    EngagementCompleted,
    EngagementAutoCompleted,
    EngagementCancelled,
    PaymentReleased,
    PaymentRefunded,
    PaymentSynthesized,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EngagementBooked => "engagement.booked",
            Self::PaymentHeld => "payment.held",
            Self::EngagementConfirmed => "engagement.confirmed",
            Self::EngagementCompleted => "engagement.completed",
            Self::EngagementAutoCompleted => "engagement.auto_completed",
            Self::EngagementCancelled => "engagement.cancelled",
            Self::PaymentReleased => "payment.released",
            Self::PaymentRefunded => "payment.refunded",
            Self::PaymentSynthesized => "payment.synthesized",
        }
    }
}

/// Ledger audit trail row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub kind: String,

    // References
    pub event_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,

    // Actor
    pub actor_id: Option<String>,

    pub amount: Option<i64>,
    pub metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(kind: AuditKind, event_id: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.as_str().to_string(),
            event_id,
            payment_id: None,
            actor_id: None,
            amount: None,
            metadata: serde_json::Value::Null,
            created_at: now,
        }
    }

    pub fn with_payment(mut self, payment: &Payment) -> Self {
        self.payment_id = Some(payment.id);
        self.amount = Some(payment.amount);
        self
    }

    pub fn with_actor<S: Into<String>>(mut self, actor_id: S) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
