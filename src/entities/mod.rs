// Entity Models
// Groups, borrowers and loans. Each module owns its table's reads and writes.

pub mod group;
pub mod borrower;
pub mod loan;

pub use group::{Group, NewGroup};
pub use borrower::{Borrower, NewBorrower};
pub use loan::{Loan, LoanStatus, NewLoan};
