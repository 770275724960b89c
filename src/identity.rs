// Caller identity
// The presentation layer authenticates; the ledger only records who acted.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Cashier,
    Accountant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Cashier => "Cashier",
            Role::Accountant => "Accountant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "cashier" => Ok(Role::Cashier),
            "accountant" => Ok(Role::Accountant),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Authenticated identity passed into every mutating ledger call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub admin_id: i64,
    pub username: String,
    pub role: Role,
}

impl Actor {
    pub fn new(admin_id: i64, username: impl Into<String>, role: Role) -> Self {
        Actor {
            admin_id,
            username: username.into(),
            role,
        }
    }

    /// Identity used by batch jobs and tests
    pub fn system() -> Self {
        Actor::new(0, "system", Role::Admin)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ({})", self.username, self.admin_id, self.role.as_str())
    }
}
