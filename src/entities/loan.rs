// 💰 Loan Entity - a principal lent against one book
//
// Balance, status and adjustment status are the only fields that change
// after creation, and only the reconciliation engine writes them.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::timestamp_column;
use crate::entities::borrower::get_borrower;
use crate::error::{ensure_amount, Entity, LedgerError, Result};
use crate::weeks::ensure_week;

// ============================================================================
// LOAN STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanStatus {
    AwaitingApproval,
    Approved,
    Disbursed,
    Closed,
    Rejected,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::AwaitingApproval => "Awaiting Approval",
            LoanStatus::Approved => "Approved",
            LoanStatus::Disbursed => "Disbursed",
            LoanStatus::Closed => "Closed",
            LoanStatus::Rejected => "Rejected",
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            LoanStatus::AwaitingApproval => 0,
            LoanStatus::Approved => 1,
            LoanStatus::Disbursed => 2,
            LoanStatus::Closed => 3,
            LoanStatus::Rejected => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<LoanStatus> {
        match code {
            0 => Some(LoanStatus::AwaitingApproval),
            1 => Some(LoanStatus::Approved),
            2 => Some(LoanStatus::Disbursed),
            3 => Some(LoanStatus::Closed),
            4 => Some(LoanStatus::Rejected),
            _ => None,
        }
    }

    /// Loan still occupies its book
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            LoanStatus::AwaitingApproval | LoanStatus::Approved | LoanStatus::Disbursed
        )
    }

    pub fn can_transition_to(&self, next: LoanStatus) -> bool {
        use LoanStatus::*;
        matches!(
            (self, next),
            (AwaitingApproval, Approved)
                | (AwaitingApproval, Rejected)
                | (Approved, Disbursed)
                | (Disbursed, Closed)
        )
    }
}

impl std::str::FromStr for LoanStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_', ' '], "").as_str() {
            "awaitingapproval" | "awaiting" => Ok(LoanStatus::AwaitingApproval),
            "approved" => Ok(LoanStatus::Approved),
            "disbursed" => Ok(LoanStatus::Disbursed),
            "closed" => Ok(LoanStatus::Closed),
            "rejected" => Ok(LoanStatus::Rejected),
            other => Err(format!("unknown loan status: {}", other)),
        }
    }
}

// ============================================================================
// LOAN ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: i64,

    /// Sequence number within the book (1, 2, ...)
    pub loan_no: i64,

    pub user_id: i64,
    pub book_no: i64,
    pub group_id: i64,

    /// Origination week
    pub week: i64,

    pub status: LoanStatus,
    pub is_eligible: bool,

    /// Principal
    pub amount: f64,

    /// Balance as of the last reconciliation
    pub balance_amount: f64,

    /// Set when an adjustment forced early closure
    pub adjustment_status: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLoan {
    pub user_id: i64,
    pub book_no: i64,
    pub group_id: i64,
    pub week: i64,
    pub amount: f64,
    pub is_eligible: bool,
}

const SELECT_LOAN: &str = "SELECT id, loan_no, user_id, book_no, anbiyam, week, status,
        is_eligible, amount, balance_amount, adjustment_status, created_at, updated_at
     FROM loans";

pub fn create_loan(conn: &Connection, loan: &NewLoan) -> Result<Loan> {
    ensure_amount("principal", loan.amount)?;
    if loan.amount == 0.0 {
        return Err(LedgerError::Validation("principal must be greater than zero".to_string()));
    }

    let borrower = get_borrower(conn, loan.user_id)?;
    if borrower.book_no != loan.book_no {
        return Err(LedgerError::Validation(format!(
            "borrower {} holds book {}, not book {}",
            borrower.id, borrower.book_no, loan.book_no
        )));
    }
    if borrower.group_id != loan.group_id {
        return Err(LedgerError::Validation(format!(
            "borrower {} belongs to group {}, not group {}",
            borrower.id, borrower.group_id, loan.group_id
        )));
    }
    ensure_week(conn, loan.week)?;

    let book_loans = loans_for_book(conn, loan.book_no)?;
    if let Some(open) = book_loans.iter().find(|l| l.status.is_open()) {
        return Err(LedgerError::Validation(format!(
            "book {} already has open loan #{} ({})",
            loan.book_no,
            open.loan_no,
            open.status.as_str()
        )));
    }
    if let Some(last) = book_loans.last() {
        if loan.week < last.week {
            return Err(LedgerError::Validation(format!(
                "loan week {} precedes loan #{} on book {} (week {})",
                loan.week, last.loan_no, loan.book_no, last.week
            )));
        }
        // Entries already posted from this week on belong to the previous loan
        if let Some(posted) = latest_entry_week(conn, loan.book_no, last.id)? {
            if posted >= loan.week {
                return Err(LedgerError::Validation(format!(
                    "book {} has entries through week {} for loan #{}, a new loan must start after it",
                    loan.book_no, posted, last.loan_no
                )));
            }
        }
    }
    let loan_no = book_loans.last().map_or(1, |l| l.loan_no + 1);

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO loans (
            loan_no, user_id, book_no, anbiyam, week, status, is_eligible,
            amount, balance_amount, adjustment_status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 0, ?9, ?9)",
        params![
            loan_no,
            loan.user_id,
            loan.book_no,
            loan.group_id,
            loan.week,
            LoanStatus::AwaitingApproval.code(),
            loan.is_eligible,
            loan.amount,
            now,
        ],
    )?;

    get_loan(conn, conn.last_insert_rowid())
}

pub fn get_loan(conn: &Connection, id: i64) -> Result<Loan> {
    conn.query_row(&format!("{} WHERE id = ?1", SELECT_LOAN), params![id], loan_from_row)
        .optional()?
        .ok_or_else(|| LedgerError::not_found(Entity::Loan, id))
}

pub fn list_loans(conn: &Connection) -> Result<Vec<Loan>> {
    query_loans(conn, &format!("{} ORDER BY book_no, loan_no", SELECT_LOAN), [])
}

/// Every loan ever issued on `book_no`, oldest first
pub fn loans_for_book(conn: &Connection, book_no: i64) -> Result<Vec<Loan>> {
    query_loans(
        conn,
        &format!("{} WHERE book_no = ?1 ORDER BY loan_no", SELECT_LOAN),
        params![book_no],
    )
}

pub fn by_status(conn: &Connection, status: LoanStatus) -> Result<Vec<Loan>> {
    query_loans(
        conn,
        &format!("{} WHERE status = ?1 ORDER BY book_no, loan_no", SELECT_LOAN),
        params![status.code()],
    )
}

/// First week that no longer belongs to this loan: the origination week of
/// the next loan on the same book
pub fn window_end(conn: &Connection, loan: &Loan) -> Result<Option<i64>> {
    let end = conn
        .query_row(
            "SELECT week FROM loans WHERE book_no = ?1 AND loan_no > ?2
             ORDER BY loan_no LIMIT 1",
            params![loan.book_no, loan.loan_no],
            |row| row.get(0),
        )
        .optional()?;
    Ok(end)
}

/// Latest week with a collection or adjustment on `book_no`, or a payment on `loan_id`
pub fn latest_entry_week(conn: &Connection, book_no: i64, loan_id: i64) -> Result<Option<i64>> {
    let week: Option<i64> = conn.query_row(
        "SELECT MAX(week) FROM (
            SELECT week FROM collection WHERE book_no = ?1
            UNION ALL
            SELECT adjustment_week FROM adjustments WHERE from_book = ?1 OR to_book = ?1
            UNION ALL
            SELECT week FROM payments WHERE loan_id = ?2
        )",
        params![book_no, loan_id],
        |row| row.get(0),
    )?;
    Ok(week)
}

/// The loan on `book_no` whose window covers `week`
pub fn loan_covering_week(conn: &Connection, book_no: i64, week: i64) -> Result<Option<Loan>> {
    let loan = conn
        .query_row(
            &format!(
                "{} WHERE book_no = ?1 AND week <= ?2 ORDER BY loan_no DESC LIMIT 1",
                SELECT_LOAN
            ),
            params![book_no, week],
            loan_from_row,
        )
        .optional()?;
    Ok(loan)
}

/// Move a loan along its lifecycle, rejecting transitions the lifecycle forbids
pub fn transition(conn: &Connection, id: i64, next: LoanStatus) -> Result<Loan> {
    let loan = get_loan(conn, id)?;
    if !loan.status.can_transition_to(next) {
        return Err(LedgerError::Validation(format!(
            "loan {} cannot move from {} to {}",
            id,
            loan.status.as_str(),
            next.as_str()
        )));
    }
    if next == LoanStatus::Approved && !loan.is_eligible {
        return Err(LedgerError::Validation(format!(
            "loan {} is not marked eligible",
            id
        )));
    }

    conn.execute(
        "UPDATE loans SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![next.code(), Utc::now().to_rfc3339(), id],
    )?;
    get_loan(conn, id)
}

/// Persist a reconciliation result
pub fn store_reconciliation(
    conn: &Connection,
    id: i64,
    balance: f64,
    status: LoanStatus,
    adjustment_status: bool,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE loans SET balance_amount = ?1, status = ?2, adjustment_status = ?3, updated_at = ?4
         WHERE id = ?5",
        params![balance, status.code(), adjustment_status, Utc::now().to_rfc3339(), id],
    )?;
    if changed == 0 {
        return Err(LedgerError::not_found(Entity::Loan, id));
    }
    Ok(())
}

fn query_loans<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Loan>> {
    let mut stmt = conn.prepare(sql)?;
    let loans = stmt
        .query_map(params, loan_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(loans)
}

fn loan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Loan> {
    let status_code: i64 = row.get(6)?;
    let status = LoanStatus::from_code(status_code).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(6, status_code)
    })?;

    Ok(Loan {
        id: row.get(0)?,
        loan_no: row.get(1)?,
        user_id: row.get(2)?,
        book_no: row.get(3)?,
        group_id: row.get(4)?,
        week: row.get(5)?,
        status,
        is_eligible: row.get(7)?,
        amount: row.get(8)?,
        balance_amount: row.get(9)?,
        adjustment_status: row.get(10)?,
        created_at: timestamp_column(row, 11)?,
        updated_at: timestamp_column(row, 12)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================
