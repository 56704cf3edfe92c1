//! Closure reconciliation.
//!
//! At close time the drawer's expected cash is re-derived from the ledger
//! and the external sales totals, compared against the physically counted
//! amount, and classified. The classification precedence matters: a zero
//! difference is always `Balanced`, and a negative expected figure forces a
//! deficit-class verdict no matter which way the difference points. A
//! positive difference against a negative expectation means the count fell
//! short of covering the deficit, not that there is a surplus.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::balance::format_minor;
use crate::db::{self, DbState};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{self, Transaction, TransactionKind};
use crate::sales::{SalesProvider, SalesTotals};
use crate::sessions::{self, CashSession, SessionStatus};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Counted cash equals expected cash exactly.
    Balanced,
    /// Counted above a non-negative expectation.
    Surplus,
    /// Counted below a non-negative expectation.
    Shortage,
    /// Expected cash was already negative; any count lands here.
    DeficitSituation,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Balanced => "balanced",
            Verdict::Surplus => "surplus",
            Verdict::Shortage => "shortage",
            Verdict::DeficitSituation => "deficit_situation",
        }
    }
}

/// Outcome of comparing counted cash against expected cash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub difference: i64,
    pub verdict: Verdict,
}

/// Aggregated view of a session used for the closure screen. Recomputed on
/// demand from the ledger; nothing here is mutated directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureSummary {
    pub session_id: i64,
    pub session_number: String,
    pub register_id: i64,
    pub opened_by: String,
    pub opened_at: String,
    pub opening_amount: i64,
    pub sales: SalesTotals,
    pub total_incomes: i64,
    pub cash_incomes: i64,
    pub total_expenses: i64,
    pub cash_expenses: i64,
    pub total_purchases: i64,
    pub transaction_count: i64,
    pub expected_cash: i64,
}

/// Result of a completed close.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureResult {
    pub summary: ClosureSummary,
    pub counted_cash: i64,
    pub difference: i64,
    pub verdict: Verdict,
    pub closed_at: String,
    pub duration_minutes: i64,
}

// ---------------------------------------------------------------------------
// Pure reconciliation
// ---------------------------------------------------------------------------

/// Expected physical cash at close, minor units. May legitimately be
/// negative; a negative value is a deficit, not an error.
pub fn compute_expected_cash(
    opening_amount: i64,
    sales_cash: i64,
    total_incomes: i64,
    total_expenses_affecting_cash: i64,
    total_purchases: i64,
) -> i64 {
    opening_amount + sales_cash + total_incomes - total_expenses_affecting_cash - total_purchases
}

/// Classify counted against expected cash.
pub fn reconcile(expected_cash: i64, counted_cash: i64) -> Reconciliation {
    let difference = counted_cash - expected_cash;
    let verdict = if difference == 0 {
        Verdict::Balanced
    } else if expected_cash < 0 {
        Verdict::DeficitSituation
    } else if difference > 0 {
        Verdict::Surplus
    } else {
        Verdict::Shortage
    };
    Reconciliation {
        difference,
        verdict,
    }
}

/// Aggregate a session's ledger and sales totals into a closure summary.
pub fn build_closure_summary(
    session: &CashSession,
    sales: SalesTotals,
    transactions: &[Transaction],
) -> ClosureSummary {
    let mut total_incomes = 0i64;
    let mut cash_incomes = 0i64;
    let mut total_expenses = 0i64;
    let mut cash_expenses = 0i64;
    let mut total_purchases = 0i64;

    for t in transactions {
        match &t.kind {
            TransactionKind::Expense {
                affects_physical_cash,
            } => {
                total_expenses += t.amount;
                if *affects_physical_cash {
                    cash_expenses += t.amount;
                }
            }
            TransactionKind::Purchase { .. } => total_purchases += t.amount,
            TransactionKind::Income { payment_method } => {
                total_incomes += t.amount;
                if payment_method.is_cash() {
                    cash_incomes += t.amount;
                }
            }
        }
    }

    let expected_cash = compute_expected_cash(
        session.opening_amount,
        sales.cash,
        cash_incomes,
        cash_expenses,
        total_purchases,
    );

    ClosureSummary {
        session_id: session.id,
        session_number: session.session_number.clone(),
        register_id: session.register_id,
        opened_by: session.opened_by.clone(),
        opened_at: session.opened_at.clone(),
        opening_amount: session.opening_amount,
        sales,
        total_incomes,
        cash_incomes,
        total_expenses,
        cash_expenses,
        total_purchases,
        transaction_count: transactions.len() as i64,
        expected_cash,
    }
}

// ---------------------------------------------------------------------------
// Storage-backed operations
// ---------------------------------------------------------------------------

/// Closure summary preview for any existing session. No writes.
pub fn get_closure_summary(
    db: &DbState,
    sales: &dyn SalesProvider,
    session_id: i64,
) -> EngineResult<ClosureSummary> {
    let session = {
        let conn = db::lock_conn(db)?;
        sessions::get_session_on(&conn, session_id)?
    };

    // The provider may read through this same DbState, so no guard may be
    // held across the call
    let totals = sales.sales_totals(&session)?;

    let conn = db::lock_conn(db)?;
    let transactions = ledger::list_transactions_on(&conn, session_id)?;
    Ok(build_closure_summary(&session, totals, &transactions))
}

/// Close a session against a physically counted amount.
///
/// `NotFound` here means the session record vanished out-of-band; the caller
/// decides whether to run the recovery flow. A second close attempt returns
/// `State` and leaves the first closure untouched.
pub fn close_session(
    db: &DbState,
    sales: &dyn SalesProvider,
    session_id: i64,
    counted_cash: i64,
    closed_by: &str,
    notes: Option<&str>,
) -> EngineResult<ClosureResult> {
    if counted_cash <= 0 {
        return Err(EngineError::Validation(
            "counted amount must be positive".into(),
        ));
    }
    let closed_by = closed_by.trim();
    if closed_by.is_empty() {
        return Err(EngineError::Validation("closing user is required".into()));
    }

    let session = {
        let conn = db::lock_conn(db)?;
        let session = sessions::get_session_on(&conn, session_id)?;
        if session.status != SessionStatus::Open {
            return Err(EngineError::State(format!(
                "session {} is already closed",
                session.session_number
            )));
        }
        session
    };

    // The provider may read through this same DbState, so no guard may be
    // held across the call
    let totals = sales.sales_totals(&session)?;

    let conn = db::lock_conn(db)?;
    let now = Utc::now().to_rfc3339();

    // Status re-check and all writes under one transaction. Only a genuinely
    // absent row may surface as NotFound, the recovery trigger; storage
    // failures keep their own error.
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> EngineResult<ClosureResult> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM cash_sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            Some("open") => {}
            Some(_) => {
                return Err(EngineError::State(format!(
                    "session {} is already closed",
                    session.session_number
                )))
            }
            None => {
                return Err(EngineError::NotFound(format!(
                    "session {session_id} does not exist"
                )))
            }
        }

        let transactions = ledger::list_transactions_on(&conn, session_id)?;
        let summary = build_closure_summary(&session, totals, &transactions);
        let reconciliation = reconcile(summary.expected_cash, counted_cash);
        let duration_minutes = minutes_between(&session.opened_at, &now);

        let note_block = closure_note_block(&summary, counted_cash, reconciliation, closed_by);
        let combined_notes = combine_notes(session.notes.as_deref(), notes, &note_block);

        conn.execute(
            "UPDATE cash_sessions SET
                status = 'closed', closed_at = ?1, closing_amount = ?2,
                expected_amount = ?3, difference = ?4, notes = ?5
             WHERE id = ?6",
            params![
                now,
                counted_cash,
                summary.expected_cash,
                reconciliation.difference,
                combined_notes,
                session_id,
            ],
        )?;

        let summary_json = serde_json::to_string(&summary)?;
        conn.execute(
            "INSERT INTO cash_closures (
                session_id, counted_amount, expected_amount, difference,
                verdict, notes, summary_json, closed_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session_id,
                counted_cash,
                summary.expected_cash,
                reconciliation.difference,
                reconciliation.verdict.as_str(),
                notes,
                summary_json,
                closed_by,
                now,
            ],
        )?;

        Ok(ClosureResult {
            summary,
            counted_cash,
            difference: reconciliation.difference,
            verdict: reconciliation.verdict,
            closed_at: now.clone(),
            duration_minutes,
        })
    })();

    match result {
        Ok(closure) => {
            conn.execute_batch("COMMIT")?;
            info!(
                session = %closure.summary.session_number,
                expected = closure.summary.expected_cash,
                counted = closure.counted_cash,
                difference = closure.difference,
                verdict = closure.verdict.as_str(),
                "Session closed"
            );
            Ok(closure)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn minutes_between(opened_at: &str, closed_at: &str) -> i64 {
    let opened = DateTime::parse_from_rfc3339(opened_at);
    let closed = DateTime::parse_from_rfc3339(closed_at);
    match (opened, closed) {
        (Ok(o), Ok(c)) => (c - o).num_minutes().max(0),
        _ => 0,
    }
}

fn closure_note_block(
    summary: &ClosureSummary,
    counted_cash: i64,
    reconciliation: Reconciliation,
    closed_by: &str,
) -> String {
    format!(
        "--- Closure {} ---\n\
         Expected cash: {}\n\
         Counted cash: {}\n\
         Difference: {}\n\
         Verdict: {}\n\
         Closed by: {}",
        summary.session_number,
        format_minor(summary.expected_cash),
        format_minor(counted_cash),
        format_minor(reconciliation.difference),
        reconciliation.verdict.as_str(),
        closed_by,
    )
}

fn combine_notes(
    session_notes: Option<&str>,
    operator_notes: Option<&str>,
    note_block: &str,
) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(n) = session_notes {
        if !n.trim().is_empty() {
            parts.push(n);
        }
    }
    if let Some(n) = operator_notes {
        if !n.trim().is_empty() {
            parts.push(n);
        }
    }
    parts.push(note_block);
    parts.join("\n")
}

// ===========================================================================
// Tests
// ===========================================================================
