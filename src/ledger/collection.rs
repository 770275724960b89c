// 🧾 Collection Ledger - money collected from a borrower in a given week

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::{date_column, date_to_sql, timestamp_column};
use crate::entities::borrower::get_borrower;
use crate::error::{ensure_amount, LedgerError, Result};
use crate::ledger::LedgerWindow;
use crate::weeks::resolve_date;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: i64,
    pub user_id: i64,
    pub group_id: i64,
    pub book_no: i64,

    /// Borrower name at the time of collection
    pub name: String,

    pub amount: f64,
    pub week: i64,

    /// Settlement Sunday for `week`
    pub sunday_date: NaiveDate,

    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCollection {
    pub user_id: i64,
    pub book_no: i64,
    pub group_id: i64,
    pub amount: f64,
    pub week: i64,
}

impl NewCollection {
    /// Hash identifying one line of one collection sheet, for re-import detection
    pub fn idempotency_hash(&self, sheet: &str, line: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{:.2}",
            sheet, line, self.book_no, self.user_id, self.week, self.amount
        ));
        format!("{:x}", hasher.finalize())
    }
}

/// A collection that passed validation, ready to insert
#[derive(Debug, Clone)]
pub struct CheckedCollection {
    pub entry: NewCollection,
    pub name: String,
    pub sunday_date: NaiveDate,
}

pub fn validate(conn: &Connection, entry: &NewCollection) -> Result<CheckedCollection> {
    ensure_amount("collection", entry.amount)?;

    let borrower = get_borrower(conn, entry.user_id)?;
    if borrower.book_no != entry.book_no {
        return Err(LedgerError::Validation(format!(
            "borrower {} holds book {}, collection names book {}",
            borrower.id, borrower.book_no, entry.book_no
        )));
    }
    if borrower.group_id != entry.group_id {
        return Err(LedgerError::Validation(format!(
            "borrower {} belongs to group {}, collection names group {}",
            borrower.id, borrower.group_id, entry.group_id
        )));
    }

    let sunday_date = resolve_date(conn, entry.week)?;

    Ok(CheckedCollection {
        entry: entry.clone(),
        name: borrower.name,
        sunday_date,
    })
}

/// Insert a validated collection. Returns None when `idempotency_hash` was already imported.
pub fn insert(
    conn: &Connection,
    checked: &CheckedCollection,
    idempotency_hash: Option<&str>,
) -> Result<Option<Collection>> {
    let entry = &checked.entry;
    let created_at = Utc::now();

    let result = conn.execute(
        "INSERT INTO collection (
            user_id, anbiyam, book_no, name, amount, week, sunday_date, idempotency_hash, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.user_id,
            entry.group_id,
            entry.book_no,
            checked.name,
            entry.amount,
            entry.week,
            date_to_sql(checked.sunday_date),
            idempotency_hash,
            created_at.to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(Some(Collection {
            id: conn.last_insert_rowid(),
            user_id: entry.user_id,
            group_id: entry.group_id,
            book_no: entry.book_no,
            name: checked.name.clone(),
            amount: entry.amount,
            week: entry.week,
            sunday_date: checked.sunday_date,
            created_at,
        })),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if idempotency_hash.is_some()
                && err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Collections from `user_id` on `book_no` inside `window`, in (week, insertion) order
pub fn for_borrower(
    conn: &Connection,
    user_id: i64,
    book_no: i64,
    window: &LedgerWindow,
) -> Result<Vec<Collection>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, anbiyam, book_no, name, amount, week, sunday_date, created_at
         FROM collection
         WHERE user_id = ?1 AND book_no = ?2 AND week >= ?3 AND week <= ?4
         ORDER BY week ASC, id ASC",
    )?;

    let collections = stmt
        .query_map(
            params![user_id, book_no, window.from_week, window.last_week()],
            collection_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(collections)
}

/// All collections settled in `week`, for the weekly sheet
pub fn for_week(conn: &Connection, week: i64) -> Result<Vec<Collection>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, anbiyam, book_no, name, amount, week, sunday_date, created_at
         FROM collection
         WHERE week = ?1
         ORDER BY anbiyam ASC, book_no ASC, id ASC",
    )?;

    let collections = stmt
        .query_map(params![week], collection_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(collections)
}

pub fn total(collections: &[Collection]) -> f64 {
    collections.iter().map(|c| c.amount).sum()
}

fn collection_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Collection> {
    Ok(Collection {
        id: row.get(0)?,
        user_id: row.get(1)?,
        group_id: row.get(2)?,
        book_no: row.get(3)?,
        name: row.get(4)?,
        amount: row.get(5)?,
        week: row.get(6)?,
        sunday_date: date_column(row, 7)?,
        created_at: timestamp_column(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_rows, setup_database};
    use crate::entities::borrower::{create_borrower, NewBorrower};
    use crate::entities::group::{create_group, NewGroup};
    use crate::weeks::register_week;

    fn setup() -> (Connection, NewCollection) {
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
        let borrower = create_borrower(
            &conn,
            &NewBorrower {
                book_no: 101,
                name: "Mary".to_string(),
                group_id: group.id,
                village: "Kovilpatti".to_string(),
                guardian: "Joseph".to_string(),
            },
        )
        .unwrap();
        let entry = NewCollection {
            user_id: borrower.id,
            book_no: 101,
            group_id: group.id,
            amount: 100.0,
            week: 1,
        };
        (conn, entry)
    }

    #[test]
    fn test_validate_and_insert() {
        let (conn, entry) = setup();
        let checked = validate(&conn, &entry).unwrap();
        assert_eq!(checked.name, "Mary");
        assert_eq!(checked.sunday_date, NaiveDate::from_ymd_opt(2025, 1, 5).unwrap());

        let stored = insert(&conn, &checked, None).unwrap().unwrap();
        assert_eq!(stored.amount, 100.0);
        assert_eq!(for_week(&conn, 1).unwrap(), vec![stored]);
    }

    #[test]
    fn test_negative_amount_is_inconsistent() {
        let (conn, mut entry) = setup();
        entry.amount = -10.0;
        assert!(validate(&conn, &entry).unwrap_err().is_inconsistent());
    }

    #[test]
    fn test_unknown_week_and_borrower() {
        let (conn, entry) = setup();

        let mut unknown_week = entry.clone();
        unknown_week.week = 8;
        assert!(validate(&conn, &unknown_week).unwrap_err().is_not_found());

        let mut unknown_user = entry.clone();
        unknown_user.user_id = 77;
        assert!(validate(&conn, &unknown_user).unwrap_err().is_not_found());

        let mut wrong_book = entry;
        wrong_book.book_no = 202;
        assert!(matches!(
            validate(&conn, &wrong_book).unwrap_err(),
            LedgerError::Validation(_)
        ));
    }

    #[test]
    fn test_repeat_import_hash_is_skipped() {
        let (conn, entry) = setup();
        let checked = validate(&conn, &entry).unwrap();
        let hash = entry.idempotency_hash("week1.csv", 2);
        assert_eq!(hash.len(), 64);

        assert!(insert(&conn, &checked, Some(&hash)).unwrap().is_some());
        assert!(insert(&conn, &checked, Some(&hash)).unwrap().is_none());
        // Manual postings carry no hash and may repeat
        assert!(insert(&conn, &checked, None).unwrap().is_some());

        assert_eq!(count_rows(&conn, "collection").unwrap(), 2);
    }

    #[test]
    fn test_window_ordering() {
        let (conn, entry) = setup();
        let mut week2 = entry.clone();
        week2.week = 2;
        week2.amount = 30.0;

        insert(&conn, &validate(&conn, &week2).unwrap(), None).unwrap();
        insert(&conn, &validate(&conn, &entry).unwrap(), None).unwrap();

        let all = LedgerWindow { from_week: 1, until_week: None, as_of: 2 };
        let rows = for_borrower(&conn, entry.user_id, 101, &all).unwrap();
        assert_eq!(rows.iter().map(|c| c.week).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(total(&rows), 130.0);

        let first_only = LedgerWindow { from_week: 1, until_week: None, as_of: 1 };
        assert_eq!(total(&for_borrower(&conn, entry.user_id, 101, &first_only).unwrap()), 100.0);
    }
}
