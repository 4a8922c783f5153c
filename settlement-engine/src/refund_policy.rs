//! Refund split rules
//!
//! Splits are never persisted. They are derived from a payment's amount
//! and status, so every place that shows one must go through [`split`].

use crate::models::{Payment, PaymentStatus};
use serde::{Deserialize, Serialize};

/// Largest amount the ledger accepts for a single engagement
pub const MAX_AMOUNT: i64 = 1_000_000_000_000_000;

/// Disbursement of an escrowed amount between the two parties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundSplit {
    pub status: PaymentStatus,
    pub requester_share: i64,
    pub provider_share: i64,
}

/// Compute the split for `amount` under a terminal payment status.
///
/// The provider share is rounded half-up to a whole currency unit and the
/// requester gets the remainder, so the two shares always sum to `amount`.
/// Returns `None` while the funds are still in escrow.
pub fn split(amount: i64, status: PaymentStatus) -> Option<RefundSplit> {
    let percent = status.provider_percent()?;
    // widened so no i64 amount can overflow; the result is within [0, amount]
    let provider_share = (i128::from(amount) * i128::from(percent) + 50).div_euclid(100) as i64;

    Some(RefundSplit {
        status,
        requester_share: amount - provider_share,
        provider_share,
    })
}

/// Split of a stored payment
pub fn breakdown(payment: &Payment) -> Option<RefundSplit> {
    split(payment.amount, payment.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requester_cancellation_keeps_twenty_percent_for_provider() {
        let s = split(90_000, PaymentStatus::RefundedPartial).unwrap();
        assert_eq!(s.requester_share, 72_000);
        assert_eq!(s.provider_share, 18_000);
    }

    #[test]
    fn test_provider_cancellation_refunds_everything() {
        let s = split(50_000, PaymentStatus::RefundedFull).unwrap();
        assert_eq!(s.requester_share, 50_000);
        assert_eq!(s.provider_share, 0);
    }

    #[test]
    fn test_release_pays_provider_in_full() {
        let s = split(100_000, PaymentStatus::Released).unwrap();
        assert_eq!(s.provider_share, 100_000);
        assert_eq!(s.requester_share, 0);
    }

    #[test]
    fn test_rounding_never_leaks() {
        for amount in [1, 2, 3, 7, 99, 101, 12_345, 999_999] {
            let s = split(amount, PaymentStatus::RefundedPartial).unwrap();
            assert_eq!(s.requester_share + s.provider_share, amount);
            // round(amount * 0.20), half-up
            let expected = ((amount as f64) * 0.20 + 0.5).floor() as i64;
            assert_eq!(s.provider_share, expected, "amount {}", amount);
        }
    }

    #[test]
    fn test_small_amounts_round_to_nearest() {
        // 0.20 * 3 = 0.6 -> 1, 0.20 * 2 = 0.4 -> 0
        assert_eq!(split(3, PaymentStatus::RefundedPartial).unwrap().provider_share, 1);
        assert_eq!(split(2, PaymentStatus::RefundedPartial).unwrap().provider_share, 0);
    }

    #[test]
    fn test_large_amounts_do_not_overflow() {
        let s = split(500_000_000_000_000_000, PaymentStatus::RefundedPartial).unwrap();
        assert_eq!(s.provider_share, 100_000_000_000_000_000);
        assert_eq!(s.requester_share, 400_000_000_000_000_000);

        let s = split(i64::MAX, PaymentStatus::RefundedPartial).unwrap();
        assert_eq!(s.requester_share + s.provider_share, i64::MAX);

        let s = split(MAX_AMOUNT, PaymentStatus::Released).unwrap();
        assert_eq!(s.provider_share, MAX_AMOUNT);
    }

    #[test]
    fn test_escrowed_funds_have_no_split() {
        assert!(split(10_000, PaymentStatus::InEscrow).is_none());
    }
}
