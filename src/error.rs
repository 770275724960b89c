// Ledger errors
// Every fallible library call returns one of these; binaries wrap them in anyhow.

use std::fmt;

/// Entity kinds that can be looked up and missed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Week,
    Group,
    Borrower,
    Book,
    Loan,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Week => "week",
            Entity::Group => "group",
            Entity::Borrower => "borrower",
            Entity::Book => "book",
            Entity::Loan => "loan",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: Entity, key: String },

    #[error("Inconsistent ledger: {0}")]
    InconsistentLedger(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Duplicate posting: {0}")]
    DuplicatePosting(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    pub fn not_found(entity: Entity, key: impl fmt::Display) -> Self {
        LedgerError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound { .. })
    }

    pub fn is_inconsistent(&self) -> bool {
        matches!(self, LedgerError::InconsistentLedger(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Reject negative (or non-finite) amounts before anything is written
pub fn ensure_amount(what: &str, amount: f64) -> Result<()> {
    if !amount.is_finite() {
        return Err(LedgerError::Validation(format!(
            "{} amount must be a finite number",
            what
        )));
    }
    if amount < 0.0 {
        return Err(LedgerError::InconsistentLedger(format!(
            "{} amount must be >= 0, got {:.2}",
            what, amount
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = LedgerError::not_found(Entity::Week, 42);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "week not found: 42");
    }

    #[test]
    fn test_ensure_amount() {
        assert!(ensure_amount("collection", 0.0).is_ok());
        assert!(ensure_amount("collection", 150.5).is_ok());

        let negative = ensure_amount("payment", -1.0).unwrap_err();
        assert!(negative.is_inconsistent());

        let nan = ensure_amount("payment", f64::NAN).unwrap_err();
        assert!(matches!(nan, LedgerError::Validation(_)));
    }
}
