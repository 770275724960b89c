// 📅 Week Registry - the ledger's time axis
//
// Every collection, payment and adjustment is stamped with a week number.
// A week number maps to the Sunday its collection cycle settles on.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::{date_column, date_to_sql};
use crate::error::{Entity, LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Week {
    pub week: i64,
    pub sunday_date: NaiveDate,
}

impl Week {
    /// Last calendar day covered by this week
    pub fn end_date(&self) -> NaiveDate {
        self.sunday_date + Duration::days(6)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.sunday_date <= date && date <= self.end_date()
    }
}

/// Register the next week. Week numbers and dates must both move forward.
pub fn register_week(conn: &Connection, week: i64, sunday_date: NaiveDate) -> Result<Week> {
    if sunday_date.weekday() != Weekday::Sun {
        return Err(LedgerError::Validation(format!(
            "{} is a {:?}, weeks must start on a Sunday",
            sunday_date,
            sunday_date.weekday()
        )));
    }

    if let Some(latest) = latest_week(conn)? {
        if week <= latest.week {
            return Err(LedgerError::Validation(format!(
                "week {} registered out of order (latest is week {})",
                week, latest.week
            )));
        }
        if sunday_date <= latest.sunday_date {
            return Err(LedgerError::Validation(format!(
                "date {} for week {} is not after week {} ({})",
                sunday_date, week, latest.week, latest.sunday_date
            )));
        }
    }

    conn.execute(
        "INSERT INTO weeks (week, sunday_date) VALUES (?1, ?2)",
        params![week, date_to_sql(sunday_date)],
    )?;

    tracing::info!(week, date = %sunday_date, "registered week");
    Ok(Week { week, sunday_date })
}

/// Week number covering `date` (its Sunday through the following Saturday)
pub fn resolve_week(conn: &Connection, date: NaiveDate) -> Result<i64> {
    let week = conn
        .query_row(
            "SELECT week, sunday_date FROM weeks
             WHERE sunday_date <= ?1
             ORDER BY sunday_date DESC
             LIMIT 1",
            params![date_to_sql(date)],
            week_from_row,
        )
        .optional()?;

    match week {
        Some(w) if w.contains(date) => Ok(w.week),
        _ => Err(LedgerError::not_found(Entity::Week, date)),
    }
}

/// Sunday date registered for `week`
pub fn resolve_date(conn: &Connection, week: i64) -> Result<NaiveDate> {
    conn.query_row(
        "SELECT sunday_date FROM weeks WHERE week = ?1",
        params![week],
        |row| date_column(row, 0),
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found(Entity::Week, week))
}

pub fn ensure_week(conn: &Connection, week: i64) -> Result<()> {
    resolve_date(conn, week).map(|_| ())
}

pub fn latest_week(conn: &Connection) -> Result<Option<Week>> {
    let week = conn
        .query_row(
            "SELECT week, sunday_date FROM weeks ORDER BY week DESC LIMIT 1",
            [],
            week_from_row,
        )
        .optional()?;
    Ok(week)
}

pub fn list_weeks(conn: &Connection) -> Result<Vec<Week>> {
    let mut stmt = conn.prepare("SELECT week, sunday_date FROM weeks ORDER BY week ASC")?;
    let weeks = stmt
        .query_map([], week_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(weeks)
}

fn week_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Week> {
    Ok(Week {
        week: row.get(0)?,
        sunday_date: date_column(row, 1)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    fn sunday(day: u32) -> NaiveDate {
        // January 2025: 5, 12, 19, 26 are Sundays
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_register_and_resolve() {
        let conn = setup();
        register_week(&conn, 1, sunday(5)).unwrap();
        register_week(&conn, 2, sunday(12)).unwrap();

        assert_eq!(resolve_date(&conn, 1).unwrap(), sunday(5));
        assert_eq!(resolve_date(&conn, 2).unwrap(), sunday(12));

        assert_eq!(resolve_week(&conn, sunday(5)).unwrap(), 1);
        // Wednesday of week 1 and Saturday of week 2
        assert_eq!(resolve_week(&conn, NaiveDate::from_ymd_opt(2025, 1, 8).unwrap()).unwrap(), 1);
        assert_eq!(resolve_week(&conn, NaiveDate::from_ymd_opt(2025, 1, 18).unwrap()).unwrap(), 2);
    }

    #[test]
    fn test_unregistered_week_is_not_found() {
        let conn = setup();
        register_week(&conn, 1, sunday(5)).unwrap();

        let err = resolve_date(&conn, 9).unwrap_err();
        assert!(err.is_not_found());

        // Before the first week and after the last week's Saturday
        assert!(resolve_week(&conn, NaiveDate::from_ymd_opt(2025, 1, 4).unwrap()).unwrap_err().is_not_found());
        assert!(resolve_week(&conn, sunday(12)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_gap_between_weeks_is_not_found() {
        let conn = setup();
        register_week(&conn, 1, sunday(5)).unwrap();
        register_week(&conn, 2, sunday(19)).unwrap();

        let in_gap = NaiveDate::from_ymd_opt(2025, 1, 14).unwrap();
        assert!(resolve_week(&conn, in_gap).unwrap_err().is_not_found());
    }

    #[test]
    fn test_out_of_order_registration_rejected() {
        let conn = setup();
        register_week(&conn, 2, sunday(12)).unwrap();

        // Lower week number
        assert!(register_week(&conn, 1, sunday(19)).is_err());
        // Same week number
        assert!(register_week(&conn, 2, sunday(19)).is_err());
        // Higher number but earlier date
        assert!(register_week(&conn, 3, sunday(5)).is_err());

        assert_eq!(list_weeks(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_non_sunday_rejected() {
        let conn = setup();
        let monday = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        let err = register_week(&conn, 1, monday).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_latest_week() {
        let conn = setup();
        assert!(latest_week(&conn).unwrap().is_none());

        register_week(&conn, 1, sunday(5)).unwrap();
        register_week(&conn, 2, sunday(12)).unwrap();

        let latest = latest_week(&conn).unwrap().unwrap();
        assert_eq!(latest.week, 2);
        assert_eq!(latest.end_date(), NaiveDate::from_ymd_opt(2025, 1, 18).unwrap());
    }
}
