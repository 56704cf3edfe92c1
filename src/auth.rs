//! Caller roles and the privilege gate for ledger deletions.
//!
//! The engine does not authenticate anyone. Callers resolve the acting user
//! against their own directory and pass the user id plus a `Role`; the only
//! decision taken here is whether that role may remove a transaction
//! recorded under somebody else's session.

use serde::{Deserialize, Serialize};

/// Role of the user performing an operation, supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Cashier,
    Manager,
    Admin,
}

impl Role {
    /// Privileged roles may delete transactions from sessions they do not own.
    pub fn is_privileged(self) -> bool {
        matches!(self, Role::Manager | Role::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Cashier => "cashier",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }
}
