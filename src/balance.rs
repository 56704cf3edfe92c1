//! Pure balance arithmetic.
//!
//! Everything here folds over an already-loaded ledger; no storage access.
//! The one deliberate wrinkle, inherited from the business rule: an expense
//! flagged as not affecting physical cash contributes 0 to the balance, not
//! its negated amount. It is still an expense for reporting purposes.

use crate::ledger::{Transaction, TransactionKind};

/// Signed effect of one movement on the physical drawer, minor units.
pub fn cash_delta(transaction: &Transaction) -> i64 {
    match &transaction.kind {
        TransactionKind::Expense {
            affects_physical_cash,
        } => {
            if *affects_physical_cash {
                -transaction.amount
            } else {
                0
            }
        }
        TransactionKind::Purchase { .. } => -transaction.amount,
        TransactionKind::Income { payment_method } => {
            if payment_method.is_cash() {
                transaction.amount
            } else {
                0
            }
        }
    }
}

/// Balance after each movement, in ledger order. Empty ledger yields an
/// empty sequence.
pub fn running_balances(opening_amount: i64, transactions: &[Transaction]) -> Vec<i64> {
    let mut balance = opening_amount;
    transactions
        .iter()
        .map(|t| {
            balance += cash_delta(t);
            balance
        })
        .collect()
}

/// Final balance: the opening amount plus every movement's cash effect.
pub fn current_balance(opening_amount: i64, transactions: &[Transaction]) -> i64 {
    opening_amount + transactions.iter().map(cash_delta).sum::<i64>()
}

/// Render minor units as a decimal string, e.g. `-1500` -> `"-15.00"`.
pub fn format_minor(amount: i64) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

// ===========================================================================
// Tests
// ===========================================================================
