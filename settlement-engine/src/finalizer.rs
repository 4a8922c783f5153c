//! Finalizer - lazy, time-based completion of past engagements
//!
//! Runs on read paths, but is a plain idempotent sweep and can equally be
//! driven by a timer. The only write is the guarded `CONFIRMED -> COMPLETED`
//! status change; confirmation marks and payments are left alone so the
//! parties can still confirm or dispute afterwards.

use crate::{
    clock::Clock,
    models::{AuditEntry, AuditKind, EngagementStatus},
    retry::RetryPolicy,
    store::LedgerStore,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Finalizer {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl Finalizer {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    /// Complete every `CONFIRMED` engagement of `actor_id` whose effective
    /// end is strictly in the past. Returns how many this call moved.
    /// Never fails: store errors are logged and the engagement is skipped.
    pub async fn finalize_due(&self, actor_id: &str) -> usize {
        let store = self.store.as_ref();
        let now = self.clock.now();

        let engagements = match self
            .retry
            .run("engagements_for", move || store.engagements_for(actor_id))
            .await
        {
            Ok(engagements) => engagements,
            Err(e) => {
                warn!(actor_id, "finalizer could not list engagements: {}", e);
                return 0;
            }
        };

        let mut transitioned = 0;
        for engagement in engagements
            .iter()
            .filter(|e| e.status == EngagementStatus::Confirmed && e.is_past_due(now))
        {
            let id = engagement.id;
            match self
                .retry
                .run("complete_engagement", move || store.complete_engagement(id, now))
                .await
            {
                Ok(Some(completed)) => {
                    transitioned += 1;
                    info!(
                        event_id = %completed.id,
                        effective_end = %completed.effective_end(),
                        "Auto-completed past engagement"
                    );
                    store
                        .record(
                            AuditEntry::new(AuditKind::EngagementAutoCompleted, Some(completed.id), now)
                                .with_metadata(serde_json::json!({
                                    "effective_end": completed.effective_end(),
                                })),
                        )
                        .await;
                }
                // a concurrent sweep, confirmation or cancellation got there first
                Ok(None) => debug!(event_id = %id, "engagement no longer CONFIRMED, skipped"),
                Err(e) => warn!(event_id = %id, "finalizer could not complete engagement: {}", e),
            }
        }

        transitioned
    }
}
