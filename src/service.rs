// 🏦 Ledger Service - the single entry point for callers
//
// Owns the one SQLite connection. Every mutating call takes the lock, opens
// an IMMEDIATE transaction, validates, writes, re-reconciles the loans it
// touched and records an audit event. Any error drops the transaction, so a
// rejected posting leaves the database exactly as it was.

use chrono::NaiveDate;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::config::LedgerConfig;
use crate::db::{get_events_for_entity, insert_event, open_database, setup_database, Event};
use crate::entities::{borrower, group, loan};
use crate::entities::{Borrower, Group, Loan, LoanStatus, NewBorrower, NewGroup, NewLoan};
use crate::error::{Entity, LedgerError, Result};
use crate::identity::Actor;
use crate::import::{self, ImportSummary};
use crate::ledger::{adjustment, collection, payment};
use crate::ledger::{Adjustment, Collection, NewAdjustment, NewCollection, NewPayment, Payment};
use crate::reconciliation::{
    LoanBalance, LoanReport, LoanStatement, ReconciliationEngine, ReconciliationOutcome,
};
use crate::weeks::{self, Week};

pub struct LedgerService {
    conn: Mutex<Connection>,
    engine: ReconciliationEngine,
}

impl LedgerService {
    pub fn new(conn: Connection, engine: ReconciliationEngine) -> Result<Self> {
        setup_database(&conn)?;
        Ok(LedgerService {
            conn: Mutex::new(conn),
            engine,
        })
    }

    pub fn open(config: &LedgerConfig) -> Result<Self> {
        let conn = open_database(&config.database.path, config.database.wal)?;
        Self::new(conn, ReconciliationEngine::from_config(&config.reconciliation))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?, ReconciliationEngine::new())
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-call dropped its transaction uncommitted; the data is intact
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    fn write<T>(
        &self,
        operation: &str,
        actor: &Actor,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock();
        let result = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(LedgerError::from)
            .and_then(|tx| {
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            });

        if let Err(e) = &result {
            tracing::warn!(operation, actor = %actor, error = %e, "ledger operation rejected");
        }
        result
    }

    // ========================================================================
    // WEEK REGISTRY
    // ========================================================================

    pub fn register_week(&self, actor: &Actor, week: i64, sunday_date: NaiveDate) -> Result<Week> {
        self.write("register_week", actor, |tx| {
            let registered = weeks::register_week(tx, week, sunday_date)?;
            record(tx, "week_registered", "week", week, serde_json::json!({"sunday_date": sunday_date}), actor)?;
            Ok(registered)
        })
    }

    pub fn resolve_week(&self, date: NaiveDate) -> Result<i64> {
        self.read(|conn| weeks::resolve_week(conn, date))
    }

    pub fn resolve_date(&self, week: i64) -> Result<NaiveDate> {
        self.read(|conn| weeks::resolve_date(conn, week))
    }

    pub fn list_weeks(&self) -> Result<Vec<Week>> {
        self.read(weeks::list_weeks)
    }

    /// Latest registered week; "as of now" for stored balances
    pub fn current_week(&self) -> Result<i64> {
        self.read(current_week)
    }

    // ========================================================================
    // GROUPS, BORROWERS, LOANS
    // ========================================================================

    pub fn create_group(&self, actor: &Actor, new_group: &NewGroup) -> Result<Group> {
        self.write("create_group", actor, |tx| {
            let created = group::create_group(tx, new_group)?;
            record(tx, "group_created", "group", created.id, serde_json::to_value(&created)?, actor)?;
            Ok(created)
        })
    }

    pub fn list_groups(&self) -> Result<Vec<Group>> {
        self.read(group::list_groups)
    }

    /// Inactive groups take no new borrowers
    pub fn set_group_active(&self, actor: &Actor, group_id: i64, active: bool) -> Result<Group> {
        let event_type = if active { "group_activated" } else { "group_deactivated" };
        self.write(event_type, actor, |tx| {
            group::set_active(tx, group_id, active)?;
            record(tx, event_type, "group", group_id, serde_json::json!({"active": active}), actor)?;
            group::get_group(tx, group_id)
        })
    }

    pub fn group_by_name(&self, name: &str) -> Result<Group> {
        self.read(|conn| {
            group::find_by_name(conn, name)?.ok_or_else(|| LedgerError::not_found(Entity::Group, name))
        })
    }

    pub fn borrower_for_book(&self, book_no: i64) -> Result<Borrower> {
        self.read(|conn| borrower::require_book(conn, book_no))
    }

    pub fn create_borrower(&self, actor: &Actor, new_borrower: &NewBorrower) -> Result<Borrower> {
        self.write("create_borrower", actor, |tx| {
            let created = borrower::create_borrower(tx, new_borrower)?;
            record(tx, "borrower_created", "borrower", created.id, serde_json::to_value(&created)?, actor)?;
            Ok(created)
        })
    }

    pub fn list_borrowers(&self) -> Result<Vec<Borrower>> {
        self.read(borrower::list_borrowers)
    }

    pub fn borrowers_in_group(&self, group_id: i64) -> Result<Vec<Borrower>> {
        self.read(|conn| {
            group::get_group(conn, group_id)?;
            borrower::by_group(conn, group_id)
        })
    }

    /// Open a loan. The book's previous loan loses the weeks from here on, so
    /// both are reconciled.
    pub fn create_loan(&self, actor: &Actor, new_loan: &NewLoan) -> Result<Loan> {
        self.write("create_loan", actor, |tx| {
            let previous = loan::loans_for_book(tx, new_loan.book_no)?.pop();
            let created = loan::create_loan(tx, new_loan)?;

            let as_of = current_week(tx)?;
            if let Some(prev) = previous {
                self.engine.reconcile(tx, prev.id, as_of)?;
            }
            self.engine.reconcile(tx, created.id, as_of)?;

            record(
                tx,
                "loan_created",
                "loan",
                created.id,
                serde_json::json!({
                    "loan_no": created.loan_no,
                    "book_no": created.book_no,
                    "week": created.week,
                    "amount": created.amount,
                }),
                actor,
            )?;
            tracing::info!(loan_id = created.id, book_no = created.book_no, amount = created.amount, actor = %actor, "loan created");
            loan::get_loan(tx, created.id)
        })
    }

    pub fn approve_loan(&self, actor: &Actor, loan_id: i64) -> Result<Loan> {
        self.change_status(actor, loan_id, LoanStatus::Approved, "loan_approved")
    }

    pub fn reject_loan(&self, actor: &Actor, loan_id: i64) -> Result<Loan> {
        self.change_status(actor, loan_id, LoanStatus::Rejected, "loan_rejected")
    }

    fn change_status(&self, actor: &Actor, loan_id: i64, next: LoanStatus, event_type: &str) -> Result<Loan> {
        self.write(event_type, actor, |tx| {
            let updated = loan::transition(tx, loan_id, next)?;
            record(tx, event_type, "loan", loan_id, serde_json::json!({"status": next.as_str()}), actor)?;
            tracing::info!(loan_id, status = next.as_str(), actor = %actor, "loan status changed");
            Ok(updated)
        })
    }

    pub fn get_loan(&self, loan_id: i64) -> Result<Loan> {
        self.read(|conn| loan::get_loan(conn, loan_id))
    }

    pub fn list_loans(&self) -> Result<Vec<Loan>> {
        self.read(loan::list_loans)
    }

    pub fn loans_by_status(&self, status: LoanStatus) -> Result<Vec<Loan>> {
        self.read(|conn| loan::by_status(conn, status))
    }

    // ========================================================================
    // POSTINGS
    // ========================================================================

    pub fn post_collection(&self, actor: &Actor, entry: &NewCollection) -> Result<Collection> {
        self.write("post_collection", actor, |tx| {
            let checked = collection::validate(tx, entry)?;
            let stored = collection::insert(tx, &checked, None)?.ok_or_else(|| {
                LedgerError::DuplicatePosting("collection was already recorded".to_string())
            })?;

            self.reconcile_books(tx, &[(stored.book_no, stored.week)], None)?;
            record(tx, "collection_posted", "collection", stored.id, serde_json::to_value(&stored)?, actor)?;
            tracing::info!(
                collection_id = stored.id,
                book_no = stored.book_no,
                week = stored.week,
                amount = stored.amount,
                actor = %actor,
                "collection posted"
            );
            Ok(stored)
        })
    }

    /// Post a payment; the first payment on an approved loan marks it disbursed.
    /// A reference that was already posted is rejected.
    pub fn post_payment(&self, actor: &Actor, new_payment: &NewPayment) -> Result<Payment> {
        self.write("post_payment", actor, |tx| {
            let target = payment::validate(tx, new_payment, self.engine.tolerance)?;
            let stored = payment::insert(tx, new_payment)?;

            if target.status == LoanStatus::Approved {
                loan::transition(tx, target.id, LoanStatus::Disbursed)?;
                record(tx, "loan_disbursed", "loan", target.id, serde_json::json!({"payment_id": stored.id}), actor)?;
            }
            self.reconcile_books(tx, &[], Some(target.id))?;

            record(tx, "payment_posted", "payment", stored.id, serde_json::to_value(&stored)?, actor)?;
            tracing::info!(
                payment_id = stored.id,
                reference = %stored.reference,
                loan_id = stored.loan_id,
                amount = stored.amount,
                actor = %actor,
                "payment posted"
            );
            Ok(stored)
        })
    }

    /// Post an adjustment. Loans on both books are reconciled in the same
    /// transaction as the insert.
    pub fn post_adjustment(&self, actor: &Actor, new_adjustment: &NewAdjustment) -> Result<Adjustment> {
        self.write("post_adjustment", actor, |tx| {
            let checked = adjustment::validate(tx, new_adjustment)?;
            let stored = adjustment::insert(tx, &checked)?;

            self.reconcile_books(
                tx,
                &[
                    (stored.from_book, stored.adjustment_week),
                    (stored.to_book, stored.adjustment_week),
                ],
                Some(stored.loan_id),
            )?;

            record(tx, "adjustment_posted", "adjustment", stored.id, serde_json::to_value(&stored)?, actor)?;
            tracing::info!(
                adjustment_id = stored.id,
                loan_id = stored.loan_id,
                from_book = stored.from_book,
                to_book = stored.to_book,
                amount = stored.amount,
                kind = stored.kind.as_str(),
                actor = %actor,
                "adjustment posted"
            );
            Ok(stored)
        })
    }

    /// Import a week's collection sheet; all rows commit together or not at all
    pub fn import_collection_sheet(&self, actor: &Actor, path: &Path, week: i64) -> Result<ImportSummary> {
        let rows = import::load_sheet(path)?;
        let sheet = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        self.write("import_collection_sheet", actor, |tx| {
            let summary = import::import_rows(tx, &sheet, week, &rows)?;
            let touched: Vec<(i64, i64)> = summary.books.iter().map(|book| (*book, week)).collect();
            self.reconcile_books(tx, &touched, None)?;
            record(tx, "collection_sheet_imported", "week", week, serde_json::to_value(&summary)?, actor)?;
            Ok(summary)
        })
    }

    /// Collections settled in `week`, grouped by group then book
    pub fn collections_for_week(&self, week: i64) -> Result<Vec<Collection>> {
        self.read(|conn| {
            weeks::ensure_week(conn, week)?;
            collection::for_week(conn, week)
        })
    }

    /// Reconcile the loans covering each (book, week) plus `loan_id`, as of the latest week
    fn reconcile_books(
        &self,
        tx: &Connection,
        books: &[(i64, i64)],
        loan_id: Option<i64>,
    ) -> Result<Vec<ReconciliationOutcome>> {
        let mut loan_ids: BTreeSet<i64> = loan_id.into_iter().collect();
        for (book_no, week) in books {
            if let Some(covering) = loan::loan_covering_week(tx, *book_no, *week)? {
                loan_ids.insert(covering.id);
            }
        }

        let as_of = current_week(tx)?;
        let mut outcomes = Vec::with_capacity(loan_ids.len());
        for id in loan_ids {
            let outcome = self.engine.reconcile(tx, id, as_of)?;
            if outcome.closed_now() {
                tracing::info!(loan_id = id, adjustment_status = outcome.adjustment_status, "loan closed");
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Balance of a loan as of `as_of_week`, computed from the ledgers
    pub fn get_loan_balance(&self, loan_id: i64, as_of_week: i64) -> Result<LoanBalance> {
        self.read(|conn| {
            let target = loan::get_loan(conn, loan_id)?;
            weeks::ensure_week(conn, as_of_week)?;
            if as_of_week < target.week {
                return Err(LedgerError::Validation(format!(
                    "loan {} originates in week {}, after week {}",
                    loan_id, target.week, as_of_week
                )));
            }
            self.engine.compute_balance(conn, &target, as_of_week)
        })
    }

    pub fn get_loan_status(&self, loan_id: i64) -> Result<LoanStatus> {
        self.read(|conn| Ok(loan::get_loan(conn, loan_id)?.status))
    }

    /// Running statement of a loan, up to `as_of` or the latest week
    pub fn loan_statement(&self, loan_id: i64, as_of: Option<i64>) -> Result<LoanStatement> {
        self.read(|conn| {
            let target = loan::get_loan(conn, loan_id)?;
            let as_of = match as_of {
                Some(week) => {
                    weeks::ensure_week(conn, week)?;
                    week
                }
                None => current_week(conn)?,
            };
            self.engine.statement(conn, &target, as_of)
        })
    }

    /// Every loan with its recomputed balance and any drift from the stored one
    pub fn loan_report(&self, as_of: Option<i64>) -> Result<Vec<LoanReport>> {
        self.read(|conn| {
            let as_of = match as_of {
                Some(week) => {
                    weeks::ensure_week(conn, week)?;
                    week
                }
                None => current_week(conn)?,
            };
            self.engine.report(conn, as_of)
        })
    }

    pub fn events_for(&self, entity_type: &str, entity_id: i64) -> Result<Vec<Event>> {
        self.read(|conn| get_events_for_entity(conn, entity_type, &entity_id.to_string()))
    }
}

fn current_week(conn: &Connection) -> Result<i64> {
    weeks::latest_week(conn)?
        .map(|w| w.week)
        .ok_or_else(|| LedgerError::not_found(Entity::Week, "latest"))
}

fn record(
    conn: &Connection,
    event_type: &str,
    entity_type: &str,
    entity_id: i64,
    data: serde_json::Value,
    actor: &Actor,
) -> Result<()> {
    insert_event(conn, &Event::new(event_type, entity_type, entity_id, data, actor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::count_rows;
    use crate::identity::Role;

    fn cashier() -> Actor {
        Actor::new(2, "meena", Role::Cashier)
    }

    #[test]
    fn test_current_week_requires_registry() {
        let service = LedgerService::open_in_memory().unwrap();
        let err = service.read(current_week).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_failed_write_rolls_back_event() {
        let service = LedgerService::open_in_memory().unwrap();
        let sunday = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
        service.register_week(&cashier(), 1, sunday).unwrap();

        // Out of order: rejected, and no second event is left behind
        assert!(service.register_week(&cashier(), 1, sunday).is_err());

        service
            .read(|conn| {
                assert_eq!(count_rows(conn, "weeks")?, 1);
                assert_eq!(count_rows(conn, "events")?, 1);
                Ok(())
            })
            .unwrap();

        let events = service.events_for("week", 1).unwrap();
        assert_eq!(events[0].actor, "meena#2 (Cashier)");
    }
}
