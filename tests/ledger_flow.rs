// End-to-end ledger flows through LedgerService

use chrono::NaiveDate;
use std::sync::Arc;
use std::thread;
use microloan_ledger::db::count_rows;
use microloan_ledger::{
    Actor, AdjustmentKind, EntryKind, LedgerConfig, LedgerError, LedgerService, Loan, LoanStatus,
    NewAdjustment, NewBorrower, NewCollection, NewGroup, NewLoan, NewPayment, Role,
};

const SUNDAYS: [(i64, u32); 4] = [(1, 5), (2, 12), (3, 19), (4, 26)];

fn cashier() -> Actor {
    Actor::new(7, "meena", Role::Cashier)
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
}

/// Four weeks, one group, books 101..=103
fn seeded(service: &LedgerService) {
    let actor = cashier();
    for (week, day) in SUNDAYS {
        service.register_week(&actor, week, date(day)).unwrap();
    }
    let group = service
        .create_group(
            &actor,
            &NewGroup {
                name: "St. Antony".to_string(),
                village: "Kovilpatti".to_string(),
                collection_agent: "Selvam".to_string(),
            },
        )
        .unwrap();
    for (book_no, name) in [(101, "Mary"), (102, "Rosy"), (103, "Anthoniammal")] {
        service
            .create_borrower(
                &actor,
                &NewBorrower {
                    book_no,
                    name: name.to_string(),
                    group_id: group.id,
                    village: "Kovilpatti".to_string(),
                    guardian: "Joseph".to_string(),
                },
            )
            .unwrap();
    }
}

/// Approved and fully disbursed loan of `amount` on `book_no`
fn disbursed_loan(service: &LedgerService, book_no: i64, week: i64, amount: f64) -> Loan {
    let actor = cashier();
    let borrower = service.borrower_for_book(book_no).unwrap();
    let loan = service
        .create_loan(
            &actor,
            &NewLoan {
                user_id: borrower.id,
                book_no,
                group_id: borrower.group_id,
                week,
                amount,
                is_eligible: true,
            },
        )
        .unwrap();
    service.approve_loan(&actor, loan.id).unwrap();
    service
        .post_payment(
            &actor,
            &NewPayment {
                reference: format!("PAY-{}-{}", book_no, loan.loan_no),
                loan_id: loan.id,
                book_no,
                week,
                amount,
            },
        )
        .unwrap();
    service.get_loan(loan.id).unwrap()
}

fn collect(service: &LedgerService, book_no: i64, week: i64, amount: f64) -> microloan_ledger::Result<()> {
    let borrower = service.borrower_for_book(book_no)?;
    service.post_collection(
        &cashier(),
        &NewCollection {
            user_id: borrower.id,
            book_no,
            group_id: borrower.group_id,
            amount,
            week,
        },
    )?;
    Ok(())
}

fn adjust(service: &LedgerService, loan: &Loan, from: i64, to: i64, week: i64, amount: f64) -> microloan_ledger::Result<()> {
    service.post_adjustment(
        &cashier(),
        &NewAdjustment {
            loan_id: loan.id,
            from_book: from,
            to_book: to,
            adjustment_week: week,
            amount,
            kind: AdjustmentKind::Adjustment,
            closes_loan: false,
        },
    )?;
    Ok(())
}

#[test]
fn test_collections_and_adjustment_reach_expected_balance() {
    let service = LedgerService::open_in_memory().unwrap();
    seeded(&service);
    let loan = disbursed_loan(&service, 102, 1, 1000.0);
    assert_eq!(loan.status, LoanStatus::Disbursed);

    collect(&service, 102, 1, 100.0).unwrap();
    assert_eq!(service.get_loan_balance(loan.id, 1).unwrap().balance, 900.0);

    collect(&service, 102, 2, 100.0).unwrap();
    adjust(&service, &loan, 101, 102, 2, 50.0).unwrap();

    let balance = service.get_loan_balance(loan.id, 2).unwrap();
    assert_eq!(balance.collected, 200.0);
    assert_eq!(balance.adjustments_in, 50.0);
    assert_eq!(balance.balance, 850.0);

    // Week 1 is unaffected by later postings
    assert_eq!(service.get_loan_balance(loan.id, 1).unwrap().balance, 900.0);

    let statement = service.loan_statement(loan.id, Some(2)).unwrap();
    let kinds: Vec<EntryKind> = statement.lines.iter().map(|l| l.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EntryKind::Payment,
            EntryKind::Collection,
            EntryKind::Collection,
            EntryKind::AdjustmentIn,
        ]
    );
    assert_eq!(statement.closing_balance, 850.0);

    // Stored balance follows the latest registered week
    assert_eq!(service.get_loan(loan.id).unwrap().balance_amount, 850.0);
}

#[test]
fn test_collections_summing_to_principal_close_the_loan() {
    let service = LedgerService::open_in_memory().unwrap();
    seeded(&service);
    let loan = disbursed_loan(&service, 101, 1, 1000.0);

    collect(&service, 101, 1, 400.0).unwrap();
    collect(&service, 101, 2, 600.0).unwrap();

    assert_eq!(service.get_loan_status(loan.id).unwrap(), LoanStatus::Closed);
    assert_eq!(service.get_loan_balance(loan.id, 2).unwrap().balance, 0.0);
    assert_eq!(service.get_loan_balance(loan.id, 1).unwrap().balance, 600.0);

    // A second loan on the same book starts its own window
    let second = disbursed_loan(&service, 101, 3, 500.0);
    assert_eq!(second.loan_no, 2);
    collect(&service, 101, 3, 50.0).unwrap();
    assert_eq!(service.get_loan_balance(second.id, 3).unwrap().balance, 450.0);
    assert_eq!(service.get_loan_balance(loan.id, 3).unwrap().balance, 0.0);
}

#[test]
fn test_zero_collection_leaves_balance() {
    let service = LedgerService::open_in_memory().unwrap();
    seeded(&service);
    let loan = disbursed_loan(&service, 101, 1, 1000.0);

    collect(&service, 101, 1, 0.0).unwrap();
    assert_eq!(service.get_loan_balance(loan.id, 1).unwrap().balance, 1000.0);
    assert_eq!(service.get_loan_status(loan.id).unwrap(), LoanStatus::Disbursed);
}

#[test]
fn test_unregistered_weeks_are_not_found() {
    let service = LedgerService::open_in_memory().unwrap();
    seeded(&service);
    let loan = disbursed_loan(&service, 101, 1, 1000.0);

    assert_eq!(service.resolve_week(date(15)).unwrap(), 2);
    assert!(service.resolve_week(date(1)).unwrap_err().is_not_found());
    assert!(service.resolve_date(9).unwrap_err().is_not_found());
    assert!(collect(&service, 101, 9, 10.0).unwrap_err().is_not_found());
    assert!(service.get_loan_balance(loan.id, 9).unwrap_err().is_not_found());
    assert!(service.get_loan_balance(404, 1).unwrap_err().is_not_found());
}

#[test]
fn test_replayed_payment_reference_is_rejected() {
    let service = LedgerService::open_in_memory().unwrap();
    seeded(&service);
    let borrower = service.borrower_for_book(101).unwrap();
    let loan = service
        .create_loan(
            &cashier(),
            &NewLoan {
                user_id: borrower.id,
                book_no: 101,
                group_id: borrower.group_id,
                week: 1,
                amount: 1000.0,
                is_eligible: true,
            },
        )
        .unwrap();
    service.approve_loan(&cashier(), loan.id).unwrap();

    let payment = NewPayment {
        reference: "UPI-2025-0001".to_string(),
        loan_id: loan.id,
        book_no: 101,
        week: 1,
        amount: 400.0,
    };
    service.post_payment(&cashier(), &payment).unwrap();
    assert_eq!(service.get_loan_status(loan.id).unwrap(), LoanStatus::Disbursed);

    let err = service.post_payment(&cashier(), &payment).unwrap_err();
    assert!(matches!(err, LedgerError::DuplicatePosting(_)));

    let statement = service.loan_statement(loan.id, None).unwrap();
    let payments = statement
        .lines
        .iter()
        .filter(|l| l.kind == EntryKind::Payment)
        .count();
    assert_eq!(payments, 1);
}

#[test]
fn test_failed_postings_leave_tables_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = LedgerConfig::default();
    config.database.path = dir.path().join("ledger.db");

    let service = LedgerService::open(&config).unwrap();
    seeded(&service);
    let loan = disbursed_loan(&service, 102, 1, 1000.0);
    collect(&service, 102, 1, 900.0).unwrap();

    let counts = || {
        let conn = rusqlite::Connection::open(&config.database.path).unwrap();
        ["collection", "payments", "adjustments", "events"]
            .iter()
            .map(|table| count_rows(&conn, table).unwrap())
            .collect::<Vec<_>>()
    };
    let before = counts();

    // Overpaying drives the balance below zero
    assert!(collect(&service, 102, 2, 200.0).unwrap_err().is_inconsistent());
    // Negative amounts
    assert!(collect(&service, 102, 2, -5.0).unwrap_err().is_inconsistent());
    // Neither side of the adjustment is the loan's book
    assert!(adjust(&service, &loan, 101, 103, 2, 50.0).unwrap_err().is_inconsistent());
    // Same book on both sides
    assert!(adjust(&service, &loan, 102, 102, 2, 50.0).unwrap_err().is_inconsistent());
    // Unknown book
    assert!(adjust(&service, &loan, 999, 102, 2, 50.0).unwrap_err().is_inconsistent());
    // Moving more out than is owed
    assert!(adjust(&service, &loan, 102, 101, 2, 500.0).unwrap_err().is_inconsistent());

    assert_eq!(counts(), before);
    assert_eq!(service.get_loan_balance(loan.id, 2).unwrap().balance, 100.0);
    assert_eq!(service.get_loan(loan.id).unwrap().balance_amount, 100.0);
}

#[test]
fn test_balance_never_grows_without_incoming_adjustment() {
    let service = LedgerService::open_in_memory().unwrap();
    seeded(&service);
    let loan = disbursed_loan(&service, 103, 1, 1000.0);

    collect(&service, 103, 1, 150.0).unwrap();
    collect(&service, 103, 2, 0.0).unwrap();
    adjust(&service, &loan, 103, 101, 3, 75.0).unwrap();
    collect(&service, 103, 4, 225.0).unwrap();

    let balances: Vec<f64> = (1..=4)
        .map(|week| service.get_loan_balance(loan.id, week).unwrap().balance)
        .collect();
    assert_eq!(balances, vec![850.0, 850.0, 775.0, 550.0]);
    assert!(balances.windows(2).all(|w| w[1] <= w[0]));
}

#[test]
fn test_closing_adjustment_closes_loan() {
    let service = LedgerService::open_in_memory().unwrap();
    seeded(&service);
    let loan = disbursed_loan(&service, 102, 1, 1000.0);
    collect(&service, 102, 1, 100.0).unwrap();

    service
        .post_adjustment(
            &cashier(),
            &NewAdjustment {
                loan_id: loan.id,
                from_book: 102,
                to_book: 101,
                adjustment_week: 2,
                amount: 300.0,
                kind: AdjustmentKind::Cash,
                closes_loan: true,
            },
        )
        .unwrap();

    let closed = service.get_loan(loan.id).unwrap();
    assert_eq!(closed.status, LoanStatus::Closed);
    assert!(closed.adjustment_status);
    assert_eq!(closed.balance_amount, 600.0);
}

#[test]
fn test_events_record_the_actor() {
    let service = LedgerService::open_in_memory().unwrap();
    seeded(&service);
    let loan = disbursed_loan(&service, 101, 1, 1000.0);

    let events = service.events_for("loan", loan.id).unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["loan_created", "loan_approved", "loan_disbursed"]);
    assert!(events.iter().all(|e| e.actor == "meena#7 (Cashier)"));
}

#[test]
fn test_collection_sheet_import_commits_once() {
    let dir = tempfile::tempdir().unwrap();
    let sheet = dir.path().join("week2.csv");
    std::fs::write(&sheet, "Book,Name,Amount\n101,Mary,100\n102,Rosy,250\n").unwrap();

    let service = LedgerService::open_in_memory().unwrap();
    seeded(&service);
    let first = disbursed_loan(&service, 101, 1, 1000.0);
    let second = disbursed_loan(&service, 102, 1, 250.0);

    let summary = service.import_collection_sheet(&cashier(), &sheet, 2).unwrap();
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.total_amount, 350.0);

    let again = service.import_collection_sheet(&cashier(), &sheet, 2).unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.duplicates, 2);

    assert_eq!(service.get_loan(first.id).unwrap().balance_amount, 900.0);
    assert_eq!(service.get_loan_status(second.id).unwrap(), LoanStatus::Closed);

    let report = service.loan_report(None).unwrap();
    assert_eq!(report.len(), 2);
    assert!(report.iter().all(|r| r.is_balanced()));
}

#[test]
fn test_new_loan_cannot_reuse_weeks_of_closed_loan() {
    let service = LedgerService::open_in_memory().unwrap();
    seeded(&service);
    let first = disbursed_loan(&service, 101, 1, 100.0);
    collect(&service, 101, 2, 100.0).unwrap();
    assert_eq!(service.get_loan_status(first.id).unwrap(), LoanStatus::Closed);

    let borrower = service.borrower_for_book(101).unwrap();
    let request = |week| NewLoan {
        user_id: borrower.id,
        book_no: 101,
        group_id: borrower.group_id,
        week,
        amount: 400.0,
        is_eligible: true,
    };

    // Week 2 already carries the repayment that closed the first loan
    let err = service.create_loan(&cashier(), &request(2)).unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));

    let closed = service.get_loan(first.id).unwrap();
    assert_eq!(closed.status, LoanStatus::Closed);
    assert_eq!(closed.balance_amount, 0.0);
    assert_eq!(service.get_loan_balance(first.id, 2).unwrap().balance, 0.0);

    let second = service.create_loan(&cashier(), &request(3)).unwrap();
    assert_eq!(service.get_loan_balance(second.id, 3).unwrap().balance, 400.0);
    assert_eq!(service.get_loan_balance(first.id, 3).unwrap().balance, 0.0);

    let report = service.loan_report(None).unwrap();
    assert!(report.iter().all(|r| r.is_balanced()));
}

#[test]
fn test_concurrent_collections_are_serialized() {
    let service = Arc::new(LedgerService::open_in_memory().unwrap());
    seeded(&service);
    let loan = disbursed_loan(&service, 101, 1, 10000.0);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                for _ in 0..10 {
                    collect(&service, 101, 2, 10.0).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(service.get_loan(loan.id).unwrap().balance_amount, 9200.0);
    assert_eq!(service.get_loan_balance(loan.id, 2).unwrap().collected, 800.0);

    let statement = service.loan_statement(loan.id, None).unwrap();
    let collections = statement
        .lines
        .iter()
        .filter(|l| l.kind == EntryKind::Collection)
        .count();
    assert_eq!(collections, 80);
}

#[test]
fn test_listings_and_group_deactivation() {
    let service = LedgerService::open_in_memory().unwrap();
    seeded(&service);
    let open = disbursed_loan(&service, 101, 1, 1000.0);
    let closed = disbursed_loan(&service, 102, 1, 100.0);
    collect(&service, 101, 2, 100.0).unwrap();
    collect(&service, 102, 2, 100.0).unwrap();

    let disbursed = service.loans_by_status(LoanStatus::Disbursed).unwrap();
    assert_eq!(disbursed.iter().map(|l| l.id).collect::<Vec<_>>(), vec![open.id]);
    let done = service.loans_by_status(LoanStatus::Closed).unwrap();
    assert_eq!(done.iter().map(|l| l.id).collect::<Vec<_>>(), vec![closed.id]);

    let sheet = service.collections_for_week(2).unwrap();
    assert_eq!(sheet.iter().map(|c| c.book_no).collect::<Vec<_>>(), vec![101, 102]);
    assert!(service.collections_for_week(3).unwrap().is_empty());
    assert!(service.collections_for_week(9).unwrap_err().is_not_found());

    let group = service.group_by_name("st. antony").unwrap();
    assert_eq!(service.borrowers_in_group(group.id).unwrap().len(), 3);

    let inactive = service.set_group_active(&cashier(), group.id, false).unwrap();
    assert!(!inactive.active);
    let err = service
        .create_borrower(
            &cashier(),
            &NewBorrower {
                book_no: 104,
                name: "Lourdu".to_string(),
                group_id: group.id,
                village: "Kovilpatti".to_string(),
                guardian: "Joseph".to_string(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));

    let events = service.events_for("group", group.id).unwrap();
    assert_eq!(events.last().unwrap().event_type, "group_deactivated");
    assert!(service.set_group_active(&cashier(), 404, true).unwrap_err().is_not_found());
}
