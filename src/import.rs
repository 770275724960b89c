// 📥 Collection sheet import - CSV → collection ledger
//
// A sheet is one week's collection list for a route:
//
//   Book,Name,Amount
//   101,Mary,100
//   102,Rosy,50
//
// Every line is validated before the first insert. Re-importing the same
// sheet is a no-op: each line carries an idempotency hash.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use crate::entities::borrower::require_book;
use crate::error::Result;
use crate::ledger::collection::{self, NewCollection};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SheetRow {
    #[serde(rename = "Book")]
    pub book_no: i64,

    /// Informational; the borrower's registered name is what gets stored
    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "Amount")]
    pub amount: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub rows: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub total_amount: f64,

    /// Books that received new collections
    pub books: BTreeSet<i64>,
}

pub fn read_sheet<R: Read>(reader: R) -> Result<Vec<SheetRow>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        rows.push(result?);
    }
    Ok(rows)
}

pub fn load_sheet(path: &Path) -> Result<Vec<SheetRow>> {
    let file = std::fs::File::open(path)?;
    read_sheet(file)
}

/// Post every row of `rows` as week `week` collections
///
/// `sheet` names the source (usually the file name) and feeds the idempotency hash.
pub fn import_rows(conn: &Connection, sheet: &str, week: i64, rows: &[SheetRow]) -> Result<ImportSummary> {
    let mut checked = Vec::with_capacity(rows.len());
    for (line, row) in rows.iter().enumerate() {
        let borrower = require_book(conn, row.book_no)?;
        let entry = NewCollection {
            user_id: borrower.id,
            book_no: row.book_no,
            group_id: borrower.group_id,
            amount: row.amount,
            week,
        };
        let hash = entry.idempotency_hash(sheet, line + 1);
        checked.push((collection::validate(conn, &entry)?, hash));
    }

    let mut summary = ImportSummary {
        rows: rows.len(),
        ..Default::default()
    };
    for (entry, hash) in &checked {
        match collection::insert(conn, entry, Some(hash))? {
            Some(stored) => {
                summary.inserted += 1;
                summary.total_amount += stored.amount;
                summary.books.insert(stored.book_no);
            }
            None => summary.duplicates += 1,
        }
    }

    tracing::info!(
        sheet,
        week,
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        "imported collection sheet"
    );
    Ok(summary)
}
