//! Party notices
//!
//! Delivery is best effort. The engine logs a failed notice and carries on;
//! a settlement decision is never rolled back because a notice was lost.

use crate::{
    error::SettlementError,
    models::{CancelReason, Engagement, Role},
    refund_policy::RefundSplit,
    SettlementResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::RwLock;
use tracing::info;

/// Sink for human-readable system notices
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, from_id: &str, to_id: &str, text: &str) -> SettlementResult<()>;
}

/// Notice as handed to a notifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub from_id: String,
    pub to_id: String,
    pub text: String,
}

/// Writes notices to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, from_id: &str, to_id: &str, text: &str) -> SettlementResult<()> {
        info!(from = from_id, to = to_id, "notice: {}", text);
        Ok(())
    }
}

/// Keeps every notice in memory; can be switched to fail on demand
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<RwLock<Vec<Notice>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every following notice
    pub fn fail_deliveries(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<Notice> {
        self.sent.read().await.clone()
    }

    pub async fn sent_to(&self, to_id: &str) -> Vec<Notice> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|n| n.to_id == to_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, from_id: &str, to_id: &str, text: &str) -> SettlementResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SettlementError::notify_failed(format!(
                "delivery to {} refused",
                to_id
            )));
        }
        self.sent.write().await.push(Notice {
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}

/// Sender id used for notices that no party authored
pub const SYSTEM_SENDER: &str = "system";

pub fn completed_text(engagement: &Engagement) -> String {
    format!(
        "Both parties confirmed the engagement on {}. {} has been released to the provider.",
        engagement.date, engagement.final_amount
    )
}

pub fn cancelled_text(
    engagement: &Engagement,
    by: Role,
    reason: CancelReason,
    split: Option<&RefundSplit>,
) -> String {
    let mut text = format!(
        "The engagement on {} was cancelled by the {} ({}).",
        engagement.date, by, reason
    );
    if let Some(split) = split {
        text.push_str(&format!(
            " Refund: {} to the requester, {} to the provider.",
            split.requester_share, split.provider_share
        ));
    }
    text
}
