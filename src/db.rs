use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::identity::Actor;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Event for audit trail: every posting and lifecycle change is appended here
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: impl ToString,
        data: serde_json::Value,
        actor: &Actor,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Open (or create) a file-backed ledger database and make sure the schema exists
pub fn open_database(path: &Path, wal: bool) -> Result<Connection> {
    let conn = Connection::open(path)?;
    if wal {
        // Enable WAL mode for crash recovery
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, path = %path.display(), "opened ledger database");
    }
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Week registry
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS weeks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            week INTEGER UNIQUE NOT NULL,
            sunday_date TEXT UNIQUE NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Groups, borrowers, loans
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS anbiyam (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            village TEXT NOT NULL,
            collection_agent TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_no INTEGER UNIQUE NOT NULL,
            name TEXT NOT NULL,
            anbiyam INTEGER NOT NULL REFERENCES anbiyam(id),
            village TEXT NOT NULL,
            guardian TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS loans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            loan_no INTEGER NOT NULL,
            user_id INTEGER NOT NULL REFERENCES users(id),
            book_no INTEGER NOT NULL REFERENCES users(book_no),
            anbiyam INTEGER NOT NULL REFERENCES anbiyam(id),
            week INTEGER NOT NULL REFERENCES weeks(week),
            status INTEGER NOT NULL,
            is_eligible INTEGER NOT NULL,
            amount REAL NOT NULL,
            balance_amount REAL NOT NULL,
            adjustment_status INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (book_no, loan_no)
        )",
        [],
    )?;

    // ==========================================================================
    // Ledgers (append-only)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS collection (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            anbiyam INTEGER NOT NULL REFERENCES anbiyam(id),
            book_no INTEGER NOT NULL REFERENCES users(book_no),
            name TEXT NOT NULL,
            amount REAL NOT NULL CHECK (amount >= 0),
            week INTEGER NOT NULL REFERENCES weeks(week),
            sunday_date TEXT NOT NULL,
            idempotency_hash TEXT UNIQUE,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            reference TEXT UNIQUE NOT NULL,
            loan_id INTEGER NOT NULL REFERENCES loans(id),
            book_no INTEGER NOT NULL,
            week INTEGER NOT NULL REFERENCES weeks(week),
            amount REAL NOT NULL CHECK (amount >= 0),
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS adjustments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            loan_id INTEGER NOT NULL REFERENCES loans(id),
            from_book INTEGER NOT NULL REFERENCES users(book_no),
            to_book INTEGER NOT NULL REFERENCES users(book_no),
            loan_date TEXT NOT NULL,
            loan_week INTEGER NOT NULL,
            adjustment_week INTEGER NOT NULL REFERENCES weeks(week),
            adjustment_date TEXT NOT NULL,
            amount REAL NOT NULL CHECK (amount >= 0),
            amount_type INTEGER NOT NULL,
            closes_loan INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_collection_book_week ON collection(book_no, week)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_loan ON payments(loan_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_adjustments_books ON adjustments(from_book, to_book, adjustment_week)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_loans_book ON loans(book_no, loan_no)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: timestamp_column(row, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Number of rows in a ledger table
pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    let count: i64 =
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// Column helpers
// ============================================================================

pub fn date_to_sql(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
