// Posting ledgers
//
// Collections, payments and adjustments are append-only. Each module
// validates a posting completely before its single INSERT, so a rejected
// posting never leaves a row behind.

pub mod collection;
pub mod payment;
pub mod adjustment;

pub use collection::{Collection, NewCollection};
pub use payment::{NewPayment, Payment};
pub use adjustment::{Adjustment, AdjustmentKind, NewAdjustment};

use crate::entities::Loan;

/// Week range of ledger entries attributed to one loan
///
/// Entries count when `from_week <= week <= as_of` and, if the book has a
/// later loan, `week < until_week`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerWindow {
    pub from_week: i64,
    pub until_week: Option<i64>,
    pub as_of: i64,
}

impl LedgerWindow {
    pub fn for_loan(loan: &Loan, until_week: Option<i64>, as_of: i64) -> Self {
        LedgerWindow {
            from_week: loan.week,
            until_week,
            as_of,
        }
    }

    pub fn contains(&self, week: i64) -> bool {
        week >= self.from_week
            && week <= self.as_of
            && self.until_week.map_or(true, |until| week < until)
    }

    /// Inclusive upper bound usable in SQL
    pub(crate) fn last_week(&self) -> i64 {
        match self.until_week {
            Some(until) => self.as_of.min(until - 1),
            None => self.as_of,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_contains() {
        let open = LedgerWindow { from_week: 3, until_week: None, as_of: 10 };
        assert!(!open.contains(2));
        assert!(open.contains(3));
        assert!(open.contains(10));
        assert!(!open.contains(11));
        assert_eq!(open.last_week(), 10);

        let bounded = LedgerWindow { from_week: 3, until_week: Some(6), as_of: 10 };
        assert!(bounded.contains(5));
        assert!(!bounded.contains(6));
        assert_eq!(bounded.last_week(), 5);
    }
}
