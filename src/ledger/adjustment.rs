// ⚖️ Adjustment Ledger - balance corrections between two books
//
// One adjustment row moves `amount` out of `from_book` and into `to_book`.
// Both sides live in the same row, so the pair can never be half-applied.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::{date_column, date_to_sql, timestamp_column};
use crate::entities::borrower::find_by_book;
use crate::entities::loan::get_loan;
use crate::entities::{Loan, LoanStatus};
use crate::error::{ensure_amount, LedgerError, Result};
use crate::ledger::LedgerWindow;
use crate::weeks::resolve_date;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentKind {
    /// Write-off or transfer between books
    Adjustment,
    /// Cash reconciliation
    Cash,
}

impl AdjustmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentKind::Adjustment => "adjustment",
            AdjustmentKind::Cash => "cash",
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            AdjustmentKind::Adjustment => 1,
            AdjustmentKind::Cash => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<AdjustmentKind> {
        match code {
            1 => Some(AdjustmentKind::Adjustment),
            2 => Some(AdjustmentKind::Cash),
            _ => None,
        }
    }
}

impl std::str::FromStr for AdjustmentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "adjustment" => Ok(AdjustmentKind::Adjustment),
            "cash" => Ok(AdjustmentKind::Cash),
            other => Err(format!("unknown adjustment kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub id: i64,
    pub loan_id: i64,
    pub from_book: i64,
    pub to_book: i64,

    /// Origination of the referenced loan
    pub loan_date: NaiveDate,
    pub loan_week: i64,

    pub adjustment_week: i64,
    pub adjustment_date: NaiveDate,
    pub amount: f64,
    pub kind: AdjustmentKind,

    /// Forces the referenced loan closed regardless of balance
    pub closes_loan: bool,

    pub created_at: DateTime<Utc>,
}

impl Adjustment {
    /// Signed effect on `book_no`: positive when value moves into the book
    pub fn effect_on(&self, book_no: i64) -> f64 {
        if self.to_book == book_no {
            self.amount
        } else if self.from_book == book_no {
            -self.amount
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAdjustment {
    pub loan_id: i64,
    pub from_book: i64,
    pub to_book: i64,
    pub adjustment_week: i64,
    pub amount: f64,
    pub kind: AdjustmentKind,
    #[serde(default)]
    pub closes_loan: bool,
}

/// An adjustment that passed validation, with dates resolved
#[derive(Debug, Clone)]
pub struct CheckedAdjustment {
    pub entry: NewAdjustment,
    pub loan: Loan,
    pub loan_date: NaiveDate,
    pub adjustment_date: NaiveDate,
}

pub fn validate(conn: &Connection, adj: &NewAdjustment) -> Result<CheckedAdjustment> {
    ensure_amount("adjustment", adj.amount)?;

    let loan = get_loan(conn, adj.loan_id)?;

    if adj.from_book == adj.to_book {
        return Err(LedgerError::InconsistentLedger(format!(
            "adjustment moves value from book {} to itself",
            adj.from_book
        )));
    }
    for book in [adj.from_book, adj.to_book] {
        if find_by_book(conn, book)?.is_none() {
            return Err(LedgerError::InconsistentLedger(format!(
                "adjustment for loan {} references unknown book {}",
                loan.id, book
            )));
        }
    }
    if loan.book_no != adj.from_book && loan.book_no != adj.to_book {
        return Err(LedgerError::InconsistentLedger(format!(
            "loan {} is on book {}, adjustment moves {} -> {}",
            loan.id, loan.book_no, adj.from_book, adj.to_book
        )));
    }

    if adj.closes_loan && loan.status != LoanStatus::Disbursed {
        return Err(LedgerError::Validation(format!(
            "loan {} is {}, only a disbursed loan can be closed by adjustment",
            loan.id,
            loan.status.as_str()
        )));
    }

    let adjustment_date = resolve_date(conn, adj.adjustment_week)?;
    if adj.adjustment_week < loan.week {
        return Err(LedgerError::Validation(format!(
            "adjustment week {} precedes loan {} origination week {}",
            adj.adjustment_week, loan.id, loan.week
        )));
    }
    let loan_date = resolve_date(conn, loan.week)?;

    Ok(CheckedAdjustment {
        entry: adj.clone(),
        loan,
        loan_date,
        adjustment_date,
    })
}

pub fn insert(conn: &Connection, checked: &CheckedAdjustment) -> Result<Adjustment> {
    let adj = &checked.entry;
    let created_at = Utc::now();

    conn.execute(
        "INSERT INTO adjustments (
            loan_id, from_book, to_book, loan_date, loan_week, adjustment_week,
            adjustment_date, amount, amount_type, closes_loan, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            adj.loan_id,
            adj.from_book,
            adj.to_book,
            date_to_sql(checked.loan_date),
            checked.loan.week,
            adj.adjustment_week,
            date_to_sql(checked.adjustment_date),
            adj.amount,
            adj.kind.code(),
            adj.closes_loan,
            created_at.to_rfc3339(),
        ],
    )?;

    Ok(Adjustment {
        id: conn.last_insert_rowid(),
        loan_id: adj.loan_id,
        from_book: adj.from_book,
        to_book: adj.to_book,
        loan_date: checked.loan_date,
        loan_week: checked.loan.week,
        adjustment_week: adj.adjustment_week,
        adjustment_date: checked.adjustment_date,
        amount: adj.amount,
        kind: adj.kind,
        closes_loan: adj.closes_loan,
        created_at,
    })
}

/// Adjustments touching `book_no` on either side inside `window`, in (week, insertion) order
pub fn for_book(conn: &Connection, book_no: i64, window: &LedgerWindow) -> Result<Vec<Adjustment>> {
    let mut stmt = conn.prepare(
        "SELECT id, loan_id, from_book, to_book, loan_date, loan_week, adjustment_week,
                adjustment_date, amount, amount_type, closes_loan, created_at
         FROM adjustments
         WHERE (from_book = ?1 OR to_book = ?1)
           AND adjustment_week >= ?2 AND adjustment_week <= ?3
         ORDER BY adjustment_week ASC, id ASC",
    )?;

    let adjustments = stmt
        .query_map(
            params![book_no, window.from_week, window.last_week()],
            adjustment_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(adjustments)
}

/// Whether any adjustment posted against `loan_id` up to `as_of` forces closure
pub fn closes_loan(conn: &Connection, loan_id: i64, as_of: i64) -> Result<bool> {
    let closing: i64 = conn.query_row(
        "SELECT COUNT(*) FROM adjustments
         WHERE loan_id = ?1 AND closes_loan = 1 AND adjustment_week <= ?2",
        params![loan_id, as_of],
        |row| row.get(0),
    )?;
    Ok(closing > 0)
}

fn adjustment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Adjustment> {
    let kind_code: i64 = row.get(9)?;
    let kind = AdjustmentKind::from_code(kind_code)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(9, kind_code))?;

    Ok(Adjustment {
        id: row.get(0)?,
        loan_id: row.get(1)?,
        from_book: row.get(2)?,
        to_book: row.get(3)?,
        loan_date: date_column(row, 4)?,
        loan_week: row.get(5)?,
        adjustment_week: row.get(6)?,
        adjustment_date: date_column(row, 7)?,
        amount: row.get(8)?,
        kind,
        closes_loan: row.get(10)?,
        created_at: timestamp_column(row, 11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::entities::borrower::{create_borrower, NewBorrower};
    use crate::entities::group::{create_group, NewGroup};
    use crate::entities::loan::{create_loan, transition};
    use crate::entities::NewLoan;
    use crate::weeks::register_week;

    fn setup() -> (Connection, Loan) {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        register_week(&conn, 1, NaiveDate::from_ymd_opt(2025, 1, 5).unwrap()).unwrap();
        register_week(&conn, 2, NaiveDate::from_ymd_opt(2025, 1, 12).unwrap()).unwrap();
        let group = create_group(
            &conn,
            &NewGroup {
                name: "St. Antony".to_string(),
                village: "Kovilpatti".to_string(),
                collection_agent: "Selvam".to_string(),
            },
        )
        .unwrap();
        let mut user_id = 0;
        for (book_no, name) in [(101, "Mary"), (102, "Rosy")] {
            let borrower = create_borrower(
                &conn,
                &NewBorrower {
                    book_no,
                    name: name.to_string(),
                    group_id: group.id,
                    village: "Kovilpatti".to_string(),
                    guardian: "Joseph".to_string(),
                },
            )
            .unwrap();
            if book_no == 102 {
                user_id = borrower.id;
            }
        }
        let loan = create_loan(
            &conn,
            &NewLoan {
                user_id,
                book_no: 102,
                group_id: group.id,
                week: 1,
                amount: 1000.0,
                is_eligible: true,
            },
        )
        .unwrap();
        (conn, loan)
    }

    fn adjustment(loan: &Loan, from_book: i64, to_book: i64) -> NewAdjustment {
        NewAdjustment {
            loan_id: loan.id,
            from_book,
            to_book,
            adjustment_week: 2,
            amount: 50.0,
            kind: AdjustmentKind::Adjustment,
            closes_loan: false,
        }
    }

    #[test]
    fn test_validate_resolves_dates() {
        let (conn, loan) = setup();
        let checked = validate(&conn, &adjustment(&loan, 101, 102)).unwrap();
        assert_eq!(checked.loan_date, NaiveDate::from_ymd_opt(2025, 1, 5).unwrap());
        assert_eq!(checked.adjustment_date, NaiveDate::from_ymd_opt(2025, 1, 12).unwrap());

        let stored = insert(&conn, &checked).unwrap();
        assert_eq!(stored.loan_week, 1);
        assert_eq!(stored.effect_on(102), 50.0);
        assert_eq!(stored.effect_on(101), -50.0);
        assert_eq!(stored.effect_on(300), 0.0);
    }

    #[test]
    fn test_book_mismatches_are_inconsistent() {
        let (conn, loan) = setup();

        // Unknown book
        assert!(validate(&conn, &adjustment(&loan, 999, 102)).unwrap_err().is_inconsistent());
        // Same book on both sides
        assert!(validate(&conn, &adjustment(&loan, 102, 102)).unwrap_err().is_inconsistent());
        // Value may also leave the loan's book
        assert!(validate(&conn, &adjustment(&loan, 102, 101)).is_ok());
    }

    #[test]
    fn test_negative_amount_is_inconsistent() {
        let (conn, loan) = setup();
        let mut adj = adjustment(&loan, 101, 102);
        adj.amount = -50.0;
        assert!(validate(&conn, &adj).unwrap_err().is_inconsistent());
    }

    #[test]
    fn test_unknown_week_is_not_found() {
        let (conn, loan) = setup();
        let mut adj = adjustment(&loan, 101, 102);
        adj.adjustment_week = 12;
        assert!(validate(&conn, &adj).unwrap_err().is_not_found());
    }

    #[test]
    fn test_for_book_and_closure() {
        let (conn, loan) = setup();
        let mut closing = adjustment(&loan, 101, 102);
        closing.closes_loan = true;
        closing.kind = AdjustmentKind::Cash;

        // Nothing to close before disbursement
        assert!(matches!(
            validate(&conn, &closing).unwrap_err(),
            LedgerError::Validation(_)
        ));
        transition(&conn, loan.id, LoanStatus::Approved).unwrap();
        assert!(validate(&conn, &closing).is_err());
        transition(&conn, loan.id, LoanStatus::Disbursed).unwrap();

        insert(&conn, &validate(&conn, &closing).unwrap()).unwrap();

        let window = LedgerWindow { from_week: 1, until_week: None, as_of: 2 };
        let rows = for_book(&conn, 101, &window).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, AdjustmentKind::Cash);

        let before = LedgerWindow { from_week: 1, until_week: None, as_of: 1 };
        assert!(for_book(&conn, 101, &before).unwrap().is_empty());

        assert!(!closes_loan(&conn, loan.id, 1).unwrap());
        assert!(closes_loan(&conn, loan.id, 2).unwrap());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Cash".parse::<AdjustmentKind>().unwrap(), AdjustmentKind::Cash);
        assert_eq!(AdjustmentKind::from_code(1), Some(AdjustmentKind::Adjustment));
        assert!("refund".parse::<AdjustmentKind>().is_err());
    }
}
