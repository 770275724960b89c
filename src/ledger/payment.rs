// 💸 Payment Ledger - disbursements applied against a loan
//
// Each payment carries the caller's reference. A reference is accepted once;
// replaying it is rejected, which makes retries of the same request safe.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::timestamp_column;
use crate::entities::loan::get_loan;
use crate::entities::{Loan, LoanStatus};
use crate::error::{ensure_amount, LedgerError, Result};
use crate::weeks::ensure_week;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub reference: String,
    pub loan_id: i64,
    pub book_no: i64,
    pub week: i64,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPayment {
    /// Caller-supplied payment id
    pub reference: String,
    pub loan_id: i64,
    pub book_no: i64,
    pub week: i64,
    pub amount: f64,
}

impl NewPayment {
    /// Payment with a freshly generated reference
    pub fn with_generated_reference(loan_id: i64, book_no: i64, week: i64, amount: f64) -> Self {
        NewPayment {
            reference: uuid::Uuid::new_v4().to_string(),
            loan_id,
            book_no,
            week,
            amount,
        }
    }
}

/// Check a payment against its loan. Returns the loan it applies to.
pub fn validate(conn: &Connection, payment: &NewPayment, tolerance: f64) -> Result<Loan> {
    ensure_amount("payment", payment.amount)?;
    if payment.reference.trim().is_empty() {
        return Err(LedgerError::Validation("payment reference is required".to_string()));
    }
    if find_by_reference(conn, &payment.reference)?.is_some() {
        return Err(LedgerError::DuplicatePosting(format!(
            "payment reference '{}' was already posted",
            payment.reference
        )));
    }

    let loan = get_loan(conn, payment.loan_id)?;
    if loan.book_no != payment.book_no {
        return Err(LedgerError::Validation(format!(
            "loan {} is on book {}, payment names book {}",
            loan.id, loan.book_no, payment.book_no
        )));
    }
    ensure_week(conn, payment.week)?;
    if payment.week < loan.week {
        return Err(LedgerError::Validation(format!(
            "payment week {} precedes loan {} origination week {}",
            payment.week, loan.id, loan.week
        )));
    }
    if !matches!(loan.status, LoanStatus::Approved | LoanStatus::Disbursed) {
        return Err(LedgerError::Validation(format!(
            "loan {} is {}, payments need an approved loan",
            loan.id,
            loan.status.as_str()
        )));
    }

    let paid = total_for_loan(conn, loan.id)?;
    if paid + payment.amount > loan.amount + tolerance {
        return Err(LedgerError::Validation(format!(
            "payment of {:.2} would disburse {:.2} against a principal of {:.2}",
            payment.amount,
            paid + payment.amount,
            loan.amount
        )));
    }

    Ok(loan)
}

pub fn insert(conn: &Connection, payment: &NewPayment) -> Result<Payment> {
    let created_at = Utc::now();

    let result = conn.execute(
        "INSERT INTO payments (reference, loan_id, book_no, week, amount, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            payment.reference,
            payment.loan_id,
            payment.book_no,
            payment.week,
            payment.amount,
            created_at.to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(Payment {
            id: conn.last_insert_rowid(),
            reference: payment.reference.clone(),
            loan_id: payment.loan_id,
            book_no: payment.book_no,
            week: payment.week,
            amount: payment.amount,
            created_at,
        }),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(LedgerError::DuplicatePosting(format!(
                "payment reference '{}' was already posted",
                payment.reference
            )))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn find_by_reference(conn: &Connection, reference: &str) -> Result<Option<Payment>> {
    let payment = conn
        .query_row(
            "SELECT id, reference, loan_id, book_no, week, amount, created_at
             FROM payments WHERE reference = ?1",
            params![reference],
            payment_from_row,
        )
        .optional()?;
    Ok(payment)
}

/// Payments on a loan up to and including `as_of`, in (week, insertion) order
pub fn for_loan(conn: &Connection, loan_id: i64, as_of: i64) -> Result<Vec<Payment>> {
    let mut stmt = conn.prepare(
        "SELECT id, reference, loan_id, book_no, week, amount, created_at
         FROM payments
         WHERE loan_id = ?1 AND week <= ?2
         ORDER BY week ASC, id ASC",
    )?;

    let payments = stmt
        .query_map(params![loan_id, as_of], payment_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(payments)
}

pub fn total_for_loan(conn: &Connection, loan_id: i64) -> Result<f64> {
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0.0) FROM payments WHERE loan_id = ?1",
        params![loan_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

fn payment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: row.get(0)?,
        reference: row.get(1)?,
        loan_id: row.get(2)?,
        book_no: row.get(3)?,
        week: row.get(4)?,
        amount: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
    })
}
