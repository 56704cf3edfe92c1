//! Cash session lifecycle and balance reconciliation engine.
//!
//! Library backend for register drawer management: opening a cashier
//! session against a register, recording expense/purchase/income movements,
//! folding them into running balances, and reconciling the drawer at close
//! against physically counted cash. Storage is local SQLite; every
//! operation is blocking request/response and takes its acting user and
//! register explicitly.
//!
//! Typical flow: [`sessions::open_session`] -> [`ledger::add_transaction`]*
//! -> [`closure::get_closure_summary`] -> [`closure::close_session`]. A
//! `NotFound` from the close means the session vanished out-of-band;
//! [`recovery::recover_deleted_session`] opens the compensating session.

pub mod auth;
pub mod balance;
pub mod closure;
pub mod db;
pub mod error;
pub mod ledger;
pub mod recovery;
pub mod registers;
pub mod sales;
pub mod sessions;

pub use auth::Role;
pub use closure::{ClosureResult, ClosureSummary, Reconciliation, Verdict};
pub use db::DbState;
pub use error::{EngineError, EngineResult};
pub use ledger::{NewTransaction, PaymentMethod, Transaction, TransactionKind};
pub use recovery::RecoveryArgs;
pub use registers::CashRegister;
pub use sales::{FixedSales, SalesProvider, SalesTotals};
pub use sessions::{CashSession, SessionStatus};
