//! Escrow settlement backend for two-party paid engagements
//!
//! This crate holds captured funds neutrally between a requester and a
//! provider and decides when they move:
//! - Dual confirmation releases the escrowed amount to the provider
//! - Cancellation refunds it according to fixed split rules
//! - A lazy finalizer completes engagements whose schedule has passed
//! - A reconciler repairs missing payment records at release time
//!
//! All state lives behind the [`store::LedgerStore`] trait; the engine
//! itself keeps nothing between calls.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod finalizer;
pub mod models;
pub mod notifier;
pub mod reconciler;
pub mod refund_policy;
pub mod retry;
pub mod store;

pub use engine::{CancelOutcome, ConfirmOutcome, NewEngagement, PaymentView, SettlementEngine};
pub use error::SettlementError;

/// Result type alias for settlement operations
pub type SettlementResult<T> = Result<T, SettlementError>;
