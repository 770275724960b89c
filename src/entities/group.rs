// 🏘️ Collection Group (Anbiyam) - a borrower route served by one collection agent

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Entity, LedgerError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub village: String,
    pub collection_agent: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGroup {
    pub name: String,
    pub village: String,
    pub collection_agent: String,
}

pub fn create_group(conn: &Connection, group: &NewGroup) -> Result<Group> {
    if group.name.trim().is_empty() {
        return Err(LedgerError::Validation("group name is required".to_string()));
    }

    let result = conn.execute(
        "INSERT INTO anbiyam (name, village, collection_agent, active) VALUES (?1, ?2, ?3, 1)",
        params![group.name.trim(), group.village, group.collection_agent],
    );

    match result {
        Ok(_) => get_group(conn, conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(LedgerError::Validation(format!(
                "group '{}' already exists",
                group.name.trim()
            )))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_group(conn: &Connection, id: i64) -> Result<Group> {
    conn.query_row(
        "SELECT id, name, village, collection_agent, active FROM anbiyam WHERE id = ?1",
        params![id],
        group_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found(Entity::Group, id))
}

/// Find group by name (case-insensitive)
pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Group>> {
    let group = conn
        .query_row(
            "SELECT id, name, village, collection_agent, active FROM anbiyam
             WHERE lower(name) = lower(?1)",
            params![name],
            group_from_row,
        )
        .optional()?;
    Ok(group)
}

pub fn list_groups(conn: &Connection) -> Result<Vec<Group>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, village, collection_agent, active FROM anbiyam ORDER BY id",
    )?;
    let groups = stmt
        .query_map([], group_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(groups)
}

pub fn set_active(conn: &Connection, id: i64, active: bool) -> Result<()> {
    let changed = conn.execute(
        "UPDATE anbiyam SET active = ?1 WHERE id = ?2",
        params![active, id],
    )?;
    if changed == 0 {
        return Err(LedgerError::not_found(Entity::Group, id));
    }
    Ok(())
}

fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        village: row.get(2)?,
        collection_agent: row.get(3)?,
        active: row.get(4)?,
    })
}
