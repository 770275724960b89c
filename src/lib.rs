// Microloan Ledger - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod identity;
pub mod import;
pub mod ledger;
pub mod reconciliation;
pub mod service;
pub mod weeks;

// Re-export commonly used types
pub use config::LedgerConfig;
pub use db::{get_events_for_entity, insert_event, open_database, setup_database, Event};
pub use entities::{Borrower, Group, Loan, LoanStatus, NewBorrower, NewGroup, NewLoan};
pub use error::{Entity, LedgerError, Result};
pub use identity::{Actor, Role};
pub use import::{ImportSummary, SheetRow};
pub use ledger::{
    Adjustment, AdjustmentKind, Collection, LedgerWindow, NewAdjustment, NewCollection,
    NewPayment, Payment,
};
pub use reconciliation::{
    EntryKind, LoanBalance, LoanReport, LoanStatement, ReconciliationEngine,
    ReconciliationOutcome, ReconciliationResult, StatementLine,
};
pub use service::LedgerService;
pub use weeks::Week;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
