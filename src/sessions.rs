//! Session lifecycle management.
//!
//! A session is one cashier's open-to-close drawer shift. This module owns
//! the `open`/`closed` state machine: it is the only place a session gets
//! created, and the closure reconciler is the only place one gets closed.
//! The open-slot check-then-insert runs inside a `BEGIN IMMEDIATE`
//! transaction and is backed by a partial unique index, so two concurrent
//! opens on the same register can never both succeed.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::balance::format_minor;
use crate::db::{self, DbState};
use crate::error::{EngineError, EngineResult};
use crate::registers;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
        }
    }
}

/// One cashier shift. Amounts are minor units, timestamps RFC3339.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashSession {
    pub id: i64,
    pub session_number: String,
    pub register_id: i64,
    pub opened_by: String,
    pub status: SessionStatus,
    pub opening_amount: i64,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub closing_amount: Option<i64>,
    pub expected_amount: Option<i64>,
    pub difference: Option<i64>,
    pub notes: Option<String>,
}

/// Closing figures of the most recent closed session on a register, used to
/// seed the next opening count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastClosedBalance {
    pub session_id: i64,
    pub session_number: String,
    pub closing_amount: i64,
    pub expected_amount: i64,
    pub difference: i64,
    pub closed_at: String,
}

/// Per-kind counts and sums for one session's ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session_id: i64,
    pub expense_count: i64,
    pub expense_total: i64,
    pub purchase_count: i64,
    pub purchase_total: i64,
    pub income_count: i64,
    pub income_total: i64,
    pub transaction_count: i64,
    /// Cash incomes minus cash-affecting expenses minus purchases.
    pub net_cash_flow: i64,
}

// ---------------------------------------------------------------------------
// Opening
// ---------------------------------------------------------------------------

/// Open a session on a register with a declared opening amount.
///
/// Fails with `Validation` when the amount is not positive or the register
/// is inactive, `NotFound` for an unknown register, and `Conflict` when the
/// register already has an open session.
pub fn open_session(
    db: &DbState,
    register_id: i64,
    opened_by: &str,
    declared_amount: i64,
    notes: Option<&str>,
) -> EngineResult<CashSession> {
    if declared_amount <= 0 {
        return Err(EngineError::Validation(
            "opening amount must be positive".into(),
        ));
    }
    let opened_by = opened_by.trim();
    if opened_by.is_empty() {
        return Err(EngineError::Validation("opening user is required".into()));
    }

    let conn = db::lock_conn(db)?;

    let register = registers::get_register_on(&conn, register_id)?;
    if !register.is_active {
        return Err(EngineError::Validation(format!(
            "register {} ({}) is inactive",
            register.id, register.name
        )));
    }

    let now = Utc::now().to_rfc3339();

    // Check-then-insert must be atomic with the sequence bump
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<CashSession> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT session_number FROM cash_sessions
                 WHERE register_id = ?1 AND status = 'open'",
                params![register_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(open_number) = existing {
            return Err(EngineError::Conflict(format!(
                "register {register_id} already has open session {open_number}"
            )));
        }

        let seq = next_sequence(&conn, register_id)?;
        let session_number = format!("S{register_id}-{seq:05}");

        conn.execute(
            "INSERT INTO cash_sessions (
                session_number, register_id, opened_by, status,
                opening_amount, opened_at, notes
            ) VALUES (?1, ?2, ?3, 'open', ?4, ?5, ?6)",
            params![session_number, register_id, opened_by, declared_amount, now, notes],
        )
        .map_err(|e| map_open_slot_violation(e, register_id))?;

        Ok(CashSession {
            id: conn.last_insert_rowid(),
            session_number,
            register_id,
            opened_by: opened_by.to_string(),
            status: SessionStatus::Open,
            opening_amount: declared_amount,
            opened_at: now.clone(),
            closed_at: None,
            closing_amount: None,
            expected_amount: None,
            difference: None,
            notes: notes.map(String::from),
        })
    })();

    match result {
        Ok(session) => {
            conn.execute_batch("COMMIT")?;
            info!(
                session = %session.session_number,
                register_id,
                opening_amount = session.opening_amount,
                "Session opened"
            );
            Ok(session)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Open a session from a verified physical count.
///
/// The drawer is counted against the expected carry-over (usually the last
/// closed session's balance); when the two disagree the discrepancy is
/// recorded on the session notes. The counted amount always wins as the
/// opening amount.
pub fn open_session_verified(
    db: &DbState,
    register_id: i64,
    opened_by: &str,
    counted_amount: i64,
    expected_amount: i64,
    notes: Option<&str>,
) -> EngineResult<CashSession> {
    let delta = counted_amount - expected_amount;
    let combined = if delta != 0 {
        warn!(
            register_id,
            expected = expected_amount,
            counted = counted_amount,
            "Opening count disagrees with expected carry-over"
        );
        let line = format!(
            "Opening verification: expected {}, counted {}, discrepancy {}",
            format_minor(expected_amount),
            format_minor(counted_amount),
            format_minor(delta)
        );
        match notes {
            Some(n) if !n.trim().is_empty() => Some(format!("{line}\n{n}")),
            _ => Some(line),
        }
    } else {
        notes.map(String::from)
    };

    open_session(db, register_id, opened_by, counted_amount, combined.as_deref())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Fetch a session by id, `NotFound` if absent.
pub fn get_session(db: &DbState, session_id: i64) -> EngineResult<CashSession> {
    let conn = db::lock_conn(db)?;
    get_session_on(&conn, session_id)
}

/// The open session on a register, if any.
pub fn get_active_session(db: &DbState, register_id: i64) -> EngineResult<Option<CashSession>> {
    let conn = db::lock_conn(db)?;
    let session = conn
        .query_row(
            &format!("{SESSION_COLUMNS} WHERE register_id = ?1 AND status = 'open'"),
            params![register_id],
            row_to_session,
        )
        .optional()?;
    Ok(session)
}

/// All currently open sessions across registers, ordered by register.
pub fn list_open_sessions(db: &DbState) -> EngineResult<Vec<CashSession>> {
    let conn = db::lock_conn(db)?;
    let mut stmt =
        conn.prepare(&format!("{SESSION_COLUMNS} WHERE status = 'open' ORDER BY register_id"))?;
    let rows = stmt.query_map([], row_to_session)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Closing figures of the most recently closed session on a register.
pub fn last_closed_balance(
    db: &DbState,
    register_id: i64,
) -> EngineResult<Option<LastClosedBalance>> {
    let conn = db::lock_conn(db)?;
    let row = conn
        .query_row(
            "SELECT id, session_number, closing_amount, expected_amount, difference, closed_at
             FROM cash_sessions
             WHERE register_id = ?1 AND status = 'closed'
             ORDER BY closed_at DESC, id DESC LIMIT 1",
            params![register_id],
            |row| {
                Ok(LastClosedBalance {
                    session_id: row.get(0)?,
                    session_number: row.get(1)?,
                    closing_amount: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    expected_amount: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    difference: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    closed_at: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Per-kind ledger counts and sums for a session's dashboard card.
pub fn session_stats(db: &DbState, session_id: i64) -> EngineResult<SessionStats> {
    let conn = db::lock_conn(db)?;
    // Session must exist even when its ledger is empty
    get_session_on(&conn, session_id)?;

    let mut stats = SessionStats {
        session_id,
        ..Default::default()
    };

    let mut stmt = conn.prepare(
        "SELECT kind, COUNT(*), COALESCE(SUM(amount), 0)
         FROM cash_transactions WHERE session_id = ?1 GROUP BY kind",
    )?;
    let rows = stmt.query_map(params![session_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    for r in rows {
        let (kind, count, total) = r?;
        match kind.as_str() {
            "expense" => {
                stats.expense_count = count;
                stats.expense_total = total;
            }
            "purchase" => {
                stats.purchase_count = count;
                stats.purchase_total = total;
            }
            "income" => {
                stats.income_count = count;
                stats.income_total = total;
            }
            _ => {}
        }
        stats.transaction_count += count;
    }

    let cash_incomes: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM cash_transactions
         WHERE session_id = ?1 AND kind = 'income' AND payment_method = 'cash'",
        params![session_id],
        |row| row.get(0),
    )?;
    let cash_expenses: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM cash_transactions
         WHERE session_id = ?1 AND kind = 'expense' AND affects_physical_cash = 1",
        params![session_id],
        |row| row.get(0),
    )?;
    stats.net_cash_flow = cash_incomes - cash_expenses - stats.purchase_total;

    Ok(stats)
}

// ---------------------------------------------------------------------------
// Internal helpers (shared with the ledger and reconciler)
// ---------------------------------------------------------------------------

pub(crate) const SESSION_COLUMNS: &str =
    "SELECT id, session_number, register_id, opened_by, status, opening_amount,
            opened_at, closed_at, closing_amount, expected_amount, difference, notes
     FROM cash_sessions";

pub(crate) fn get_session_on(conn: &Connection, session_id: i64) -> EngineResult<CashSession> {
    conn.query_row(
        &format!("{SESSION_COLUMNS} WHERE id = ?1"),
        params![session_id],
        row_to_session,
    )
    .optional()?
    .ok_or_else(|| EngineError::NotFound(format!("session {session_id} does not exist")))
}

pub(crate) fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<CashSession> {
    let status: String = row.get(4)?;
    Ok(CashSession {
        id: row.get(0)?,
        session_number: row.get(1)?,
        register_id: row.get(2)?,
        opened_by: row.get(3)?,
        status: if status == "open" {
            SessionStatus::Open
        } else {
            SessionStatus::Closed
        },
        opening_amount: row.get(5)?,
        opened_at: row.get(6)?,
        closed_at: row.get(7)?,
        closing_amount: row.get(8)?,
        expected_amount: row.get(9)?,
        difference: row.get(10)?,
        notes: row.get(11)?,
    })
}

/// Bump and return the per-register session sequence. Runs inside the
/// caller's transaction; stored in settings so force-deleted sessions can
/// never cause a number to be reissued.
fn next_sequence(conn: &Connection, register_id: i64) -> EngineResult<i64> {
    let key = register_id.to_string();
    let seq = db::get_setting(conn, "session_seq", &key)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0)
        + 1;
    db::set_setting(conn, "session_seq", &key, &seq.to_string())?;
    Ok(seq)
}

fn map_open_slot_violation(e: rusqlite::Error, register_id: i64) -> EngineError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return EngineError::Conflict(format!(
                "register {register_id} already has an open session"
            ));
        }
    }
    EngineError::Db(e)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;
    use crate::registers::create_register;

    fn setup_register(db: &DbState) -> i64 {
        create_register(db, "Front Desk", None).expect("register").id
    }

    #[test]
    fn test_open_session_assigns_number_and_state() {
        let db = test_db();
        let reg = setup_register(&db);

        let session = open_session(&db, reg, "maria", 50_000, Some("morning shift"))
            .expect("open session");
        assert_eq!(session.session_number, "S1-00001");
        assert_eq!(session.status, SessionStatus::Open);
        assert_eq!(session.opening_amount, 50_000);
        assert_eq!(session.notes.as_deref(), Some("morning shift"));
        assert!(session.closed_at.is_none());

        let active = get_active_session(&db, reg).expect("query").expect("some");
        assert_eq!(active.id, session.id);
    }

    #[test]
    fn test_open_rejects_non_positive_amount() {
        let db = test_db();
        let reg = setup_register(&db);
        for amount in [0, -500] {
            let err = open_session(&db, reg, "maria", amount, None).unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)), "amount {amount}");
        }
    }

    #[test]
    fn test_open_unknown_register_not_found() {
        let db = test_db();
        let err = open_session(&db, 42, "maria", 1_000, None).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_open_inactive_register_rejected() {
        let db = test_db();
        let reg = setup_register(&db);
        crate::registers::set_register_active(&db, reg, false).expect("deactivate");
        let err = open_session(&db, reg, "maria", 1_000, None).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_second_open_conflicts_and_names_existing() {
        let db = test_db();
        let reg = setup_register(&db);
        open_session(&db, reg, "maria", 50_000, None).expect("first");

        let err = open_session(&db, reg, "jorge", 10_000, None).unwrap_err();
        match err {
            EngineError::Conflict(msg) => assert!(msg.contains("S1-00001"), "got: {msg}"),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_session_numbers_survive_force_delete() {
        let db = test_db();
        let reg = setup_register(&db);
        let first = open_session(&db, reg, "maria", 50_000, None).expect("first");
        assert_eq!(first.session_number, "S1-00001");

        // Out-of-band deletion must not cause number reuse
        {
            let conn = db.conn.lock().unwrap();
            conn.execute("DELETE FROM cash_sessions WHERE id = ?1", params![first.id])
                .expect("force delete");
        }

        let second = open_session(&db, reg, "maria", 50_000, None).expect("second");
        assert_eq!(second.session_number, "S1-00002");
    }

    #[test]
    fn test_numbers_are_scoped_per_register() {
        let db = test_db();
        let front = setup_register(&db);
        let back = create_register(&db, "Back Office", None).expect("register").id;

        let a = open_session(&db, front, "maria", 10_000, None).expect("front");
        let b = open_session(&db, back, "jorge", 20_000, None).expect("back");
        assert_eq!(a.session_number, "S1-00001");
        assert_eq!(b.session_number, "S2-00001");
    }

    #[test]
    fn test_verified_open_records_discrepancy() {
        let db = test_db();
        let reg = setup_register(&db);

        let session = open_session_verified(&db, reg, "maria", 48_500, 50_000, Some("late count"))
            .expect("open");
        assert_eq!(session.opening_amount, 48_500);
        let notes = session.notes.expect("notes present");
        assert!(notes.contains("Opening verification"), "got: {notes}");
        assert!(notes.contains("discrepancy -15.00"), "got: {notes}");
        assert!(notes.contains("late count"), "got: {notes}");
    }

    #[test]
    fn test_verified_open_clean_count_keeps_notes_untouched() {
        let db = test_db();
        let reg = setup_register(&db);

        let session = open_session_verified(&db, reg, "maria", 50_000, 50_000, Some("ok"))
            .expect("open");
        assert_eq!(session.notes.as_deref(), Some("ok"));
    }

    #[test]
    fn test_concurrent_opens_single_winner() {
        let db = test_db();
        let reg = setup_register(&db);

        let outcomes: Vec<EngineResult<CashSession>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let db = &db;
                    scope.spawn(move || open_session(db, reg, &format!("user{i}"), 10_000, None))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let wins = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1, "exactly one open_session call may win");
        for r in outcomes.iter().filter(|r| r.is_err()) {
            assert!(matches!(r.as_ref().unwrap_err(), EngineError::Conflict(_)));
        }
    }

    #[test]
    fn test_list_open_sessions_across_registers() {
        let db = test_db();
        let front = setup_register(&db);
        let back = create_register(&db, "Back Office", None).expect("register").id;
        open_session(&db, front, "maria", 10_000, None).expect("front");
        open_session(&db, back, "jorge", 20_000, None).expect("back");

        let open = list_open_sessions(&db).expect("list");
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].register_id, front);
        assert_eq!(open[1].register_id, back);
    }

    #[test]
    fn test_session_stats_counts_and_net_flow() {
        use crate::ledger::{add_transaction, NewTransaction, PaymentMethod};

        let db = test_db();
        let reg = setup_register(&db);
        let session = open_session(&db, reg, "maria", 50_000, None).expect("open");

        add_transaction(
            &db,
            session.id,
            "maria",
            NewTransaction::Expense {
                amount: 10_000,
                description: "supplies".into(),
                category: None,
                cost_center: None,
                affects_physical_cash: true,
            },
        )
        .expect("cash expense");
        add_transaction(
            &db,
            session.id,
            "maria",
            NewTransaction::Expense {
                amount: 5_000,
                description: "bank-paid invoice".into(),
                category: None,
                cost_center: None,
                affects_physical_cash: false,
            },
        )
        .expect("non-cash expense");
        add_transaction(
            &db,
            session.id,
            "maria",
            NewTransaction::Purchase {
                description: "stock".into(),
                quantity: 2,
                unit_price: 3_000,
                supplier: None,
                category: None,
                cost_center: None,
            },
        )
        .expect("purchase");
        add_transaction(
            &db,
            session.id,
            "maria",
            NewTransaction::Income {
                amount: 20_000,
                description: "reposition".into(),
                payment_method: PaymentMethod::Cash,
                category: None,
                cost_center: None,
            },
        )
        .expect("income");

        let stats = session_stats(&db, session.id).expect("stats");
        assert_eq!(stats.expense_count, 2);
        assert_eq!(stats.expense_total, 15_000);
        assert_eq!(stats.purchase_count, 1);
        assert_eq!(stats.purchase_total, 6_000);
        assert_eq!(stats.income_count, 1);
        assert_eq!(stats.income_total, 20_000);
        assert_eq!(stats.transaction_count, 4);
        // cash incomes 20,000 - cash expenses 10,000 - purchases 6,000
        assert_eq!(stats.net_cash_flow, 4_000);
    }

    #[test]
    fn test_session_stats_missing_session_not_found() {
        let db = test_db();
        let err = session_stats(&db, 9).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_last_closed_balance_roundtrip() {
        let db = test_db();
        let reg = setup_register(&db);
        assert!(last_closed_balance(&db, reg).expect("query").is_none());

        let session = open_session(&db, reg, "maria", 50_000, None).expect("open");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE cash_sessions SET status = 'closed', closed_at = ?1,
                        closing_amount = 52000, expected_amount = 51000, difference = 1000
                 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), session.id],
            )
            .expect("close by hand");
        }

        let last = last_closed_balance(&db, reg).expect("query").expect("some");
        assert_eq!(last.session_number, "S1-00001");
        assert_eq!(last.closing_amount, 52_000);
        assert_eq!(last.difference, 1_000);
    }
}
