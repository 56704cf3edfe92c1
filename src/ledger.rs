//! Append-only transaction ledger.
//!
//! Movements against an open session come in three variants (expense,
//! purchase, income), stored in one table with a `kind` discriminator. The
//! ledger stays policy-light: it enforces amount positivity, session
//! openness, and a description on outflows; category and cost-center are
//! optional attrs whose policies belong to the caller.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::Role;
use crate::balance;
use crate::db::{self, DbState};
use crate::error::{EngineError, EngineResult};
use crate::sessions::{self, SessionStatus};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
    Other,
}

impl PaymentMethod {
    /// Only cash-settled incomes move the physical drawer balance.
    pub fn is_cash(self) -> bool {
        matches!(self, PaymentMethod::Cash)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::Other => "other",
        }
    }

    fn parse(s: &str) -> PaymentMethod {
        match s {
            "card" => PaymentMethod::Card,
            "transfer" => PaymentMethod::Transfer,
            "other" => PaymentMethod::Other,
            _ => PaymentMethod::Cash,
        }
    }
}

/// Variant-specific data of a ledger movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionKind {
    /// Outflow; excluded from cash math when `affects_physical_cash` is false.
    Expense { affects_physical_cash: bool },
    /// Stock outflow; amount is always `quantity * unit_price`.
    Purchase {
        quantity: i64,
        unit_price: i64,
        supplier: Option<String>,
    },
    /// Inflow (reposition, loan, reimbursement, deposit).
    Income { payment_method: PaymentMethod },
}

impl TransactionKind {
    pub(crate) fn discriminator(&self) -> &'static str {
        match self {
            TransactionKind::Expense { .. } => "expense",
            TransactionKind::Purchase { .. } => "purchase",
            TransactionKind::Income { .. } => "income",
        }
    }
}

/// One recorded movement. `amount` is a positive magnitude in minor units;
/// the signed cash effect comes from [`balance::cash_delta`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i64,
    pub session_id: i64,
    pub amount: i64,
    pub description: String,
    pub category: Option<String>,
    pub cost_center: Option<String>,
    #[serde(flatten)]
    pub kind: TransactionKind,
    pub created_by: String,
    pub created_at: String,
}

/// Input for [`add_transaction`]. Purchases carry no amount of their own;
/// the ledger derives it from quantity and unit price.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NewTransaction {
    Expense {
        amount: i64,
        description: String,
        category: Option<String>,
        cost_center: Option<String>,
        affects_physical_cash: bool,
    },
    Purchase {
        description: String,
        quantity: i64,
        unit_price: i64,
        supplier: Option<String>,
        category: Option<String>,
        cost_center: Option<String>,
    },
    Income {
        amount: i64,
        description: String,
        payment_method: PaymentMethod,
        category: Option<String>,
        cost_center: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Append a movement to an open session's ledger.
pub fn add_transaction(
    db: &DbState,
    session_id: i64,
    created_by: &str,
    input: NewTransaction,
) -> EngineResult<Transaction> {
    let conn = db::lock_conn(db)?;

    let session = sessions::get_session_on(&conn, session_id)?;
    if session.status != SessionStatus::Open {
        return Err(EngineError::State(format!(
            "session {} is closed, no further transactions may be recorded",
            session.session_number
        )));
    }

    let created_by = created_by.trim();
    if created_by.is_empty() {
        return Err(EngineError::Validation("recording user is required".into()));
    }

    let (amount, description, category, cost_center, kind) = match input {
        NewTransaction::Expense {
            amount,
            description,
            category,
            cost_center,
            affects_physical_cash,
        } => {
            require_description(&description)?;
            (
                amount,
                description,
                category,
                cost_center,
                TransactionKind::Expense {
                    affects_physical_cash,
                },
            )
        }
        NewTransaction::Purchase {
            description,
            quantity,
            unit_price,
            supplier,
            category,
            cost_center,
        } => {
            require_description(&description)?;
            if quantity <= 0 || unit_price <= 0 {
                return Err(EngineError::Validation(
                    "purchase quantity and unit price must be positive".into(),
                ));
            }
            let amount = quantity.checked_mul(unit_price).ok_or_else(|| {
                EngineError::Validation("purchase amount overflows".into())
            })?;
            (
                amount,
                description,
                category,
                cost_center,
                TransactionKind::Purchase {
                    quantity,
                    unit_price,
                    supplier,
                },
            )
        }
        NewTransaction::Income {
            amount,
            description,
            payment_method,
            category,
            cost_center,
        } => (
            amount,
            description,
            category,
            cost_center,
            TransactionKind::Income { payment_method },
        ),
    };

    if amount <= 0 {
        return Err(EngineError::Validation("amount must be positive".into()));
    }

    let now = Utc::now().to_rfc3339();
    let (affects, quantity, unit_price, supplier, payment_method) = match &kind {
        TransactionKind::Expense {
            affects_physical_cash,
        } => (Some(*affects_physical_cash as i64), None, None, None, None),
        TransactionKind::Purchase {
            quantity,
            unit_price,
            supplier,
        } => (
            None,
            Some(*quantity),
            Some(*unit_price),
            supplier.clone(),
            None,
        ),
        TransactionKind::Income { payment_method } => {
            (None, None, None, None, Some(payment_method.as_str()))
        }
    };

    conn.execute(
        "INSERT INTO cash_transactions (
            session_id, kind, amount, description, category, cost_center,
            affects_physical_cash, quantity, unit_price, supplier,
            payment_method, created_by, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            session_id,
            kind.discriminator(),
            amount,
            description,
            category,
            cost_center,
            affects,
            quantity,
            unit_price,
            supplier,
            payment_method,
            created_by,
            now,
        ],
    )?;

    let transaction = Transaction {
        id: conn.last_insert_rowid(),
        session_id,
        amount,
        description,
        category,
        cost_center,
        kind,
        created_by: created_by.to_string(),
        created_at: now,
    };

    info!(
        session = %session.session_number,
        transaction_id = transaction.id,
        kind = transaction.kind.discriminator(),
        amount,
        "Transaction recorded"
    );

    Ok(transaction)
}

/// Physically remove a movement from a still-open session.
///
/// Only the session owner or a privileged role may remove; the state check
/// comes first so a closed session rejects everyone alike.
pub fn remove_transaction(
    db: &DbState,
    transaction_id: i64,
    requester_id: &str,
    requester_role: Role,
) -> EngineResult<()> {
    let conn = db::lock_conn(db)?;

    let session_id: i64 = conn
        .query_row(
            "SELECT session_id FROM cash_transactions WHERE id = ?1",
            params![transaction_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| {
            EngineError::NotFound(format!("transaction {transaction_id} does not exist"))
        })?;

    let session = sessions::get_session_on(&conn, session_id)?;
    if session.status != SessionStatus::Open {
        return Err(EngineError::State(format!(
            "session {} is closed, its ledger is immutable",
            session.session_number
        )));
    }
    if session.opened_by != requester_id && !requester_role.is_privileged() {
        return Err(EngineError::Permission(format!(
            "user {requester_id} ({}) may not remove transactions from session {}",
            requester_role.as_str(),
            session.session_number
        )));
    }

    conn.execute(
        "DELETE FROM cash_transactions WHERE id = ?1",
        params![transaction_id],
    )?;

    info!(
        session = %session.session_number,
        transaction_id,
        requester = requester_id,
        "Transaction removed"
    );

    Ok(())
}

/// All movements of a session in creation order (ties broken by id).
pub fn list_transactions(db: &DbState, session_id: i64) -> EngineResult<Vec<Transaction>> {
    let conn = db::lock_conn(db)?;
    sessions::get_session_on(&conn, session_id)?;
    list_transactions_on(&conn, session_id)
}

/// Current physical balance of a session: opening amount plus the signed
/// cash effect of every movement so far. Informational; never blocks closure.
pub fn get_running_balance(db: &DbState, session_id: i64) -> EngineResult<i64> {
    let conn = db::lock_conn(db)?;
    let session = sessions::get_session_on(&conn, session_id)?;
    let transactions = list_transactions_on(&conn, session_id)?;
    Ok(balance::current_balance(
        session.opening_amount,
        &transactions,
    ))
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

pub(crate) fn list_transactions_on(
    conn: &Connection,
    session_id: i64,
) -> EngineResult<Vec<Transaction>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, kind, amount, description, category, cost_center,
                affects_physical_cash, quantity, unit_price, supplier,
                payment_method, created_by, created_at
         FROM cash_transactions
         WHERE session_id = ?1
         ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![session_id], row_to_transaction)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
    let kind_str: String = row.get(2)?;
    let kind = match kind_str.as_str() {
        "expense" => TransactionKind::Expense {
            affects_physical_cash: row.get::<_, Option<i64>>(7)?.unwrap_or(1) != 0,
        },
        "purchase" => TransactionKind::Purchase {
            quantity: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
            unit_price: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
            supplier: row.get(10)?,
        },
        _ => TransactionKind::Income {
            payment_method: row
                .get::<_, Option<String>>(11)?
                .map(|s| PaymentMethod::parse(&s))
                .unwrap_or(PaymentMethod::Cash),
        },
    };
    Ok(Transaction {
        id: row.get(0)?,
        session_id: row.get(1)?,
        amount: row.get(3)?,
        description: row.get(4)?,
        category: row.get(5)?,
        cost_center: row.get(6)?,
        kind,
        created_by: row.get(12)?,
        created_at: row.get(13)?,
    })
}

fn require_description(description: &str) -> EngineResult<()> {
    if description.trim().is_empty() {
        return Err(EngineError::Validation("description is required".into()));
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;
    use crate::registers::create_register;
    use crate::sessions::open_session;

    fn expense(amount: i64, affects: bool) -> NewTransaction {
        NewTransaction::Expense {
            amount,
            description: "cleaning supplies".into(),
            category: Some("maintenance".into()),
            cost_center: None,
            affects_physical_cash: affects,
        }
    }

    fn income(amount: i64, method: PaymentMethod) -> NewTransaction {
        NewTransaction::Income {
            amount,
            description: "float reposition".into(),
            payment_method: method,
            category: None,
            cost_center: None,
        }
    }

    fn open_test_session(db: &DbState, opening: i64) -> crate::sessions::CashSession {
        let reg = create_register(db, "Front", None).expect("register").id;
        open_session(db, reg, "maria", opening, None).expect("open session")
    }

    #[test]
    fn test_add_expense_and_list_in_order() {
        let db = test_db();
        let session = open_test_session(&db, 50_000);

        let first = add_transaction(&db, session.id, "maria", expense(1_000, true)).expect("add");
        let second =
            add_transaction(&db, session.id, "maria", income(2_000, PaymentMethod::Cash))
                .expect("add");

        let listed = list_transactions(&db, session.id).expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
        assert_eq!(
            listed[0].kind,
            TransactionKind::Expense {
                affects_physical_cash: true
            }
        );
        assert_eq!(listed[0].category.as_deref(), Some("maintenance"));
    }

    #[test]
    fn test_purchase_amount_is_quantity_times_unit_price() {
        let db = test_db();
        let session = open_test_session(&db, 50_000);

        let purchase = add_transaction(
            &db,
            session.id,
            "maria",
            NewTransaction::Purchase {
                description: "coffee beans".into(),
                quantity: 4,
                unit_price: 1_250,
                supplier: Some("Roastery SA".into()),
                category: None,
                cost_center: Some("kitchen".into()),
            },
        )
        .expect("add purchase");

        assert_eq!(purchase.amount, 5_000);
        match purchase.kind {
            TransactionKind::Purchase {
                quantity,
                unit_price,
                ..
            } => {
                assert_eq!(quantity, 4);
                assert_eq!(unit_price, 1_250);
            }
            other => panic!("expected purchase, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_failures() {
        let db = test_db();
        let session = open_test_session(&db, 50_000);

        let cases: Vec<NewTransaction> = vec![
            expense(0, true),
            expense(-500, true),
            NewTransaction::Expense {
                amount: 100,
                description: "  ".into(),
                category: None,
                cost_center: None,
                affects_physical_cash: true,
            },
            NewTransaction::Purchase {
                description: "beans".into(),
                quantity: 0,
                unit_price: 500,
                supplier: None,
                category: None,
                cost_center: None,
            },
            NewTransaction::Purchase {
                description: "beans".into(),
                quantity: 2,
                unit_price: -10,
                supplier: None,
                category: None,
                cost_center: None,
            },
            income(0, PaymentMethod::Cash),
        ];

        for case in cases {
            let err = add_transaction(&db, session.id, "maria", case.clone()).unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)), "case {case:?}");
        }
    }

    #[test]
    fn test_purchase_amount_overflow_rejected() {
        let db = test_db();
        let session = open_test_session(&db, 50_000);

        let err = add_transaction(
            &db,
            session.id,
            "maria",
            NewTransaction::Purchase {
                description: "bulk order".into(),
                quantity: i64::MAX,
                unit_price: 2,
                supplier: None,
                category: None,
                cost_center: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(list_transactions(&db, session.id).expect("list").is_empty());
    }

    #[test]
    fn test_add_to_missing_session_not_found() {
        let db = test_db();
        let err = add_transaction(&db, 7, "maria", expense(100, true)).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_add_to_closed_session_state_error() {
        let db = test_db();
        let session = open_test_session(&db, 50_000);
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE cash_sessions SET status = 'closed' WHERE id = ?1",
                params![session.id],
            )
            .expect("close by hand");
        }
        let err = add_transaction(&db, session.id, "maria", expense(100, true)).unwrap_err();
        assert!(matches!(err, EngineError::State(_)));
    }

    #[test]
    fn test_remove_by_owner_and_by_privileged() {
        let db = test_db();
        let session = open_test_session(&db, 50_000);
        let a = add_transaction(&db, session.id, "maria", expense(100, true)).expect("a");
        let b = add_transaction(&db, session.id, "jorge", expense(200, true)).expect("b");

        // Session owner removes, even a row recorded by someone else
        remove_transaction(&db, b.id, "maria", Role::Cashier).expect("owner removes");
        // Privileged non-owner removes
        remove_transaction(&db, a.id, "admin-user", Role::Admin).expect("admin removes");

        assert!(list_transactions(&db, session.id).expect("list").is_empty());
    }

    #[test]
    fn test_remove_by_unprivileged_stranger_denied() {
        let db = test_db();
        let session = open_test_session(&db, 50_000);
        let tx = add_transaction(&db, session.id, "maria", expense(100, true)).expect("add");

        let err = remove_transaction(&db, tx.id, "jorge", Role::Cashier).unwrap_err();
        assert!(matches!(err, EngineError::Permission(_)));
        assert_eq!(list_transactions(&db, session.id).expect("list").len(), 1);
    }

    #[test]
    fn test_remove_from_closed_session_fails_for_everyone() {
        let db = test_db();
        let session = open_test_session(&db, 50_000);
        let tx = add_transaction(&db, session.id, "maria", expense(100, true)).expect("add");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE cash_sessions SET status = 'closed' WHERE id = ?1",
                params![session.id],
            )
            .expect("close by hand");
        }

        for role in [Role::Cashier, Role::Admin] {
            let err = remove_transaction(&db, tx.id, "maria", role).unwrap_err();
            assert!(matches!(err, EngineError::State(_)), "role {role:?}");
        }
    }

    #[test]
    fn test_remove_missing_transaction_not_found() {
        let db = test_db();
        open_test_session(&db, 50_000);
        let err = remove_transaction(&db, 99, "maria", Role::Admin).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_running_balance_reflects_removal() {
        let db = test_db();
        let session = open_test_session(&db, 50_000);
        add_transaction(&db, session.id, "maria", income(10_000, PaymentMethod::Cash))
            .expect("income");
        let exp = add_transaction(&db, session.id, "maria", expense(4_000, true)).expect("expense");
        assert_eq!(get_running_balance(&db, session.id).expect("balance"), 56_000);

        remove_transaction(&db, exp.id, "maria", Role::Cashier).expect("remove");
        assert_eq!(get_running_balance(&db, session.id).expect("balance"), 60_000);
    }

    #[test]
    fn test_non_cash_income_does_not_move_balance() {
        let db = test_db();
        let session = open_test_session(&db, 50_000);
        add_transaction(&db, session.id, "maria", income(9_000, PaymentMethod::Transfer))
            .expect("transfer income");
        assert_eq!(get_running_balance(&db, session.id).expect("balance"), 50_000);
    }
}
