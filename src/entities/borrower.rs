// 👤 Borrower Entity - one borrower per book, one group at a time

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::timestamp_column;
use crate::entities::group::get_group;
use crate::error::{Entity, LedgerError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Borrower {
    pub id: i64,

    /// Book number; unique across borrowers
    pub book_no: i64,

    pub name: String,

    /// Collection group (Anbiyam) id
    pub group_id: i64,

    pub village: String,
    pub guardian: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBorrower {
    pub book_no: i64,
    pub name: String,
    pub group_id: i64,
    pub village: String,
    pub guardian: String,
}

const SELECT_BORROWER: &str =
    "SELECT id, book_no, name, anbiyam, village, guardian, created_at FROM users";

pub fn create_borrower(conn: &Connection, borrower: &NewBorrower) -> Result<Borrower> {
    if borrower.name.trim().is_empty() {
        return Err(LedgerError::Validation("borrower name is required".to_string()));
    }
    if borrower.book_no <= 0 {
        return Err(LedgerError::Validation(format!(
            "book number must be positive, got {}",
            borrower.book_no
        )));
    }

    let group = get_group(conn, borrower.group_id)?;
    if !group.active {
        return Err(LedgerError::Validation(format!(
            "group '{}' is inactive",
            group.name
        )));
    }

    if find_by_book(conn, borrower.book_no)?.is_some() {
        return Err(LedgerError::Validation(format!(
            "book {} is already assigned",
            borrower.book_no
        )));
    }

    conn.execute(
        "INSERT INTO users (book_no, name, anbiyam, village, guardian, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            borrower.book_no,
            borrower.name.trim(),
            borrower.group_id,
            borrower.village,
            borrower.guardian,
            Utc::now().to_rfc3339(),
        ],
    )?;

    get_borrower(conn, conn.last_insert_rowid())
}

pub fn get_borrower(conn: &Connection, id: i64) -> Result<Borrower> {
    conn.query_row(
        &format!("{} WHERE id = ?1", SELECT_BORROWER),
        params![id],
        borrower_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found(Entity::Borrower, id))
}

pub fn find_by_book(conn: &Connection, book_no: i64) -> Result<Option<Borrower>> {
    let borrower = conn
        .query_row(
            &format!("{} WHERE book_no = ?1", SELECT_BORROWER),
            params![book_no],
            borrower_from_row,
        )
        .optional()?;
    Ok(borrower)
}

/// Borrower holding `book_no`, NotFound(Book) when the book is unknown
pub fn require_book(conn: &Connection, book_no: i64) -> Result<Borrower> {
    find_by_book(conn, book_no)?.ok_or_else(|| LedgerError::not_found(Entity::Book, book_no))
}

pub fn list_borrowers(conn: &Connection) -> Result<Vec<Borrower>> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY book_no", SELECT_BORROWER))?;
    let borrowers = stmt
        .query_map([], borrower_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(borrowers)
}

pub fn by_group(conn: &Connection, group_id: i64) -> Result<Vec<Borrower>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE anbiyam = ?1 ORDER BY book_no",
        SELECT_BORROWER
    ))?;
    let borrowers = stmt
        .query_map(params![group_id], borrower_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(borrowers)
}

fn borrower_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Borrower> {
    Ok(Borrower {
        id: row.get(0)?,
        book_no: row.get(1)?,
        name: row.get(2)?,
        group_id: row.get(3)?,
        village: row.get(4)?,
        guardian: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
    })
}
