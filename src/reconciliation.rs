// ⚖️ Reconciliation Engine - authoritative loan balances
//
// Following the formula:
//   balance = principal - collections + adjustments_in - adjustments_out
//
// Entries count from the loan's origination week up to the as-of week, and
// stop where the next loan on the same book begins. Within one week entries
// apply in the order they were recorded.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::ReconciliationConfig;
use crate::entities::loan::{get_loan, list_loans, store_reconciliation, window_end};
use crate::entities::{Loan, LoanStatus};
use crate::error::{LedgerError, Result};
use crate::ledger::{adjustment, collection, payment, LedgerWindow};

// ============================================================================
// LOAN BALANCE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanBalance {
    pub loan_id: i64,
    pub book_no: i64,
    pub as_of_week: i64,
    pub principal: f64,
    pub collected: f64,
    pub adjustments_in: f64,
    pub adjustments_out: f64,

    /// Never negative: values within tolerance of zero are floored to zero
    pub balance: f64,
}

impl LoanBalance {
    pub fn is_settled(&self) -> bool {
        self.balance == 0.0
    }
}

// ============================================================================
// LOAN STATEMENT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Collection,
    Payment,
    AdjustmentIn,
    AdjustmentOut,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Collection => "collection",
            EntryKind::Payment => "disbursement",
            EntryKind::AdjustmentIn => "adjustment in",
            EntryKind::AdjustmentOut => "adjustment out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementLine {
    pub week: i64,
    pub kind: EntryKind,
    pub entry_id: i64,

    /// Amount as recorded
    pub amount: f64,

    /// Signed change to the balance (payments change nothing)
    pub effect: f64,

    pub running_balance: f64,

    #[serde(skip)]
    recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanStatement {
    pub loan_id: i64,
    pub book_no: i64,
    pub principal: f64,
    pub as_of_week: i64,
    pub lines: Vec<StatementLine>,
    pub closing_balance: f64,
}

// ============================================================================
// RECONCILIATION RESULT
// ============================================================================

/// Stored balance compared with the recomputed one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconciliationResult {
    /// Stored balance matches the ledgers
    Balanced { balance: f64 },

    /// Off by less than the major threshold
    MinorDiscrepancy {
        expected_balance: f64,
        stored_balance: f64,
        difference: f64,
        tolerance: f64,
    },

    /// Off by the major threshold or more
    MajorDiscrepancy {
        expected_balance: f64,
        stored_balance: f64,
        difference: f64,
    },
}

impl ReconciliationResult {
    pub fn is_balanced(&self) -> bool {
        matches!(self, ReconciliationResult::Balanced { .. })
    }

    pub fn has_discrepancy(&self) -> bool {
        !self.is_balanced()
    }

    pub fn difference(&self) -> f64 {
        match self {
            ReconciliationResult::Balanced { .. } => 0.0,
            ReconciliationResult::MinorDiscrepancy { difference, .. } => *difference,
            ReconciliationResult::MajorDiscrepancy { difference, .. } => *difference,
        }
    }
}

// ============================================================================
// REPORTS
// ============================================================================

/// One row of the loan book report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanReport {
    pub loan: Loan,
    pub balance: LoanBalance,
    pub disbursed: f64,
    pub result: ReconciliationResult,
    pub reconciled_at: DateTime<Utc>,
}

impl LoanReport {
    pub fn is_balanced(&self) -> bool {
        self.result.is_balanced()
    }

    pub fn summary(&self) -> String {
        format!(
            "Loan {} (book {} #{}, {}): principal {:.2}, collected {:.2}, balance {:.2}, stored {:.2}, difference {:.2}",
            self.loan.id,
            self.loan.book_no,
            self.loan.loan_no,
            self.loan.status.as_str(),
            self.balance.principal,
            self.balance.collected,
            self.balance.balance,
            self.loan.balance_amount,
            self.result.difference()
        )
    }
}

/// What a reconciliation changed on a loan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub loan_id: i64,
    pub balance: f64,
    pub previous_status: LoanStatus,
    pub status: LoanStatus,
    pub adjustment_status: bool,
}

impl ReconciliationOutcome {
    pub fn closed_now(&self) -> bool {
        self.previous_status != LoanStatus::Closed && self.status == LoanStatus::Closed
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    /// Tolerance for floating-point comparisons (default: 0.01)
    pub tolerance: f64,

    /// Threshold for minor vs major discrepancy (default: 10.00)
    pub major_discrepancy_threshold: f64,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine {
            tolerance: 0.01,
            major_discrepancy_threshold: 10.0,
        }
    }

    pub fn with_thresholds(tolerance: f64, major_threshold: f64) -> Self {
        ReconciliationEngine {
            tolerance,
            major_discrepancy_threshold: major_threshold,
        }
    }

    pub fn from_config(config: &ReconciliationConfig) -> Self {
        Self::with_thresholds(config.tolerance, config.major_discrepancy_threshold)
    }

    fn window(&self, conn: &Connection, loan: &Loan, as_of: i64) -> Result<LedgerWindow> {
        Ok(LedgerWindow::for_loan(loan, window_end(conn, loan)?, as_of))
    }

    /// Floor a raw balance, rejecting anything below zero beyond tolerance
    fn settle(&self, loan: &Loan, as_of: i64, raw: f64) -> Result<f64> {
        if raw < -self.tolerance {
            return Err(LedgerError::InconsistentLedger(format!(
                "loan {} (book {}) balance would be {:.2} at week {}",
                loan.id, loan.book_no, raw, as_of
            )));
        }
        Ok(if raw < self.tolerance { 0.0 } else { raw })
    }

    /// Balance of `loan` as of `as_of` week
    pub fn compute_balance(&self, conn: &Connection, loan: &Loan, as_of: i64) -> Result<LoanBalance> {
        let window = self.window(conn, loan, as_of)?;

        let collections = collection::for_borrower(conn, loan.user_id, loan.book_no, &window)?;
        let adjustments = adjustment::for_book(conn, loan.book_no, &window)?;

        let collected = collection::total(&collections);
        let adjustments_in: f64 = adjustments
            .iter()
            .filter(|a| a.to_book == loan.book_no)
            .map(|a| a.amount)
            .sum();
        let adjustments_out: f64 = adjustments
            .iter()
            .filter(|a| a.from_book == loan.book_no)
            .map(|a| a.amount)
            .sum();

        let raw = loan.amount - collected + adjustments_in - adjustments_out;
        let balance = self.settle(loan, as_of, raw)?;

        Ok(LoanBalance {
            loan_id: loan.id,
            book_no: loan.book_no,
            as_of_week: as_of,
            principal: loan.amount,
            collected,
            adjustments_in,
            adjustments_out,
            balance,
        })
    }

    /// Every entry attributed to `loan` with the running balance after it
    pub fn statement(&self, conn: &Connection, loan: &Loan, as_of: i64) -> Result<LoanStatement> {
        let window = self.window(conn, loan, as_of)?;
        let mut lines = Vec::new();

        for c in collection::for_borrower(conn, loan.user_id, loan.book_no, &window)? {
            lines.push(StatementLine {
                week: c.week,
                kind: EntryKind::Collection,
                entry_id: c.id,
                amount: c.amount,
                effect: -c.amount,
                running_balance: 0.0,
                recorded_at: Some(c.created_at),
            });
        }

        for p in payment::for_loan(conn, loan.id, window.last_week())? {
            lines.push(StatementLine {
                week: p.week,
                kind: EntryKind::Payment,
                entry_id: p.id,
                amount: p.amount,
                effect: 0.0,
                running_balance: 0.0,
                recorded_at: Some(p.created_at),
            });
        }

        for a in adjustment::for_book(conn, loan.book_no, &window)? {
            let effect = a.effect_on(loan.book_no);
            lines.push(StatementLine {
                week: a.adjustment_week,
                kind: if effect >= 0.0 { EntryKind::AdjustmentIn } else { EntryKind::AdjustmentOut },
                entry_id: a.id,
                amount: a.amount,
                effect,
                running_balance: 0.0,
                recorded_at: Some(a.created_at),
            });
        }

        // Same week: creation order
        lines.sort_by(|a, b| {
            a.week
                .cmp(&b.week)
                .then(a.recorded_at.cmp(&b.recorded_at))
                .then(a.entry_id.cmp(&b.entry_id))
        });

        let mut running = loan.amount;
        for line in &mut lines {
            running += line.effect;
            line.running_balance = running;
        }

        Ok(LoanStatement {
            loan_id: loan.id,
            book_no: loan.book_no,
            principal: loan.amount,
            as_of_week: as_of,
            closing_balance: self.settle(loan, as_of, running)?,
            lines,
        })
    }

    /// Recompute a loan's balance and status and store them
    ///
    /// Disbursed loans close once the balance reaches zero, or as soon as an
    /// adjustment posted against them carries the closing flag.
    pub fn reconcile(&self, conn: &Connection, loan_id: i64, as_of: i64) -> Result<ReconciliationOutcome> {
        let loan = get_loan(conn, loan_id)?;
        let balance = self.compute_balance(conn, &loan, as_of)?;
        let forced = adjustment::closes_loan(conn, loan.id, as_of)?;

        let status = if loan.status == LoanStatus::Disbursed && (balance.is_settled() || forced) {
            LoanStatus::Closed
        } else {
            loan.status
        };
        let adjustment_status = loan.adjustment_status || forced;

        store_reconciliation(conn, loan.id, balance.balance, status, adjustment_status)?;

        let outcome = ReconciliationOutcome {
            loan_id: loan.id,
            balance: balance.balance,
            previous_status: loan.status,
            status,
            adjustment_status,
        };
        tracing::debug!(
            loan_id = loan.id,
            book_no = loan.book_no,
            as_of,
            balance = outcome.balance,
            status = status.as_str(),
            "reconciled loan"
        );
        Ok(outcome)
    }

    /// Compare the stored balance of `loan` against the ledgers
    pub fn audit(&self, conn: &Connection, loan: &Loan, as_of: i64) -> Result<LoanReport> {
        let balance = self.compute_balance(conn, loan, as_of)?;
        let disbursed = payment::total_for_loan(conn, loan.id)?;
        let result = self.classify(balance.balance, loan.balance_amount);

        Ok(LoanReport {
            loan: loan.clone(),
            balance,
            disbursed,
            result,
            reconciled_at: Utc::now(),
        })
    }

    /// Audit every loan on the books
    pub fn report(&self, conn: &Connection, as_of: i64) -> Result<Vec<LoanReport>> {
        list_loans(conn)?
            .iter()
            .map(|loan| self.audit(conn, loan, as_of))
            .collect()
    }

    fn classify(&self, expected: f64, stored: f64) -> ReconciliationResult {
        let difference = (expected - stored).abs();

        if difference < self.tolerance {
            ReconciliationResult::Balanced { balance: expected }
        } else if difference < self.major_discrepancy_threshold {
            ReconciliationResult::MinorDiscrepancy {
                expected_balance: expected,
                stored_balance: stored,
                difference,
                tolerance: self.tolerance,
            }
        } else {
            ReconciliationResult::MajorDiscrepancy {
                expected_balance: expected,
                stored_balance: stored,
                difference,
            }
        }
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
