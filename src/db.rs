//! Local SQLite database layer for the cash session engine.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers, and the shared connection state every engine operation borrows.
//! Callers run on blocking request handlers; the single `Mutex<Connection>`
//! serializes in-process access while `BEGIN IMMEDIATE` transactions guard
//! the check-then-write sequences against other connections.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/petty-cash.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> EngineResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| EngineError::Validation(format!("failed to create data dir: {e}")))?;

    let db_path = data_dir.join("petty-cash.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open an in-memory database with migrations applied, for callers that
/// want a throwaway store (demos, offline previews).
pub fn init_in_memory() -> EngineResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Lock the shared connection, mapping a poisoned mutex to `EngineError::Lock`.
pub(crate) fn lock_conn(state: &DbState) -> EngineResult<MutexGuard<'_, Connection>> {
    state
        .conn
        .lock()
        .map_err(|_| EngineError::Lock("database connection".into()))
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> EngineResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> EngineResult<()> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: registers, sessions, and the local settings store.
///
/// All monetary columns are INTEGER minor units. Timestamps are RFC3339 TEXT.
fn migrate_v1(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- cash_registers (physical drawers/tills)
        CREATE TABLE IF NOT EXISTS cash_registers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            location TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        -- cash_sessions (one cashier shift per row)
        CREATE TABLE IF NOT EXISTS cash_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_number TEXT NOT NULL UNIQUE,
            register_id INTEGER NOT NULL,
            opened_by TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open' CHECK(status IN ('open','closed')),
            opening_amount INTEGER NOT NULL,
            opened_at TEXT NOT NULL,
            closed_at TEXT,
            closing_amount INTEGER,
            expected_amount INTEGER,
            difference INTEGER,
            FOREIGN KEY(register_id) REFERENCES cash_registers(id)
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_sessions_register ON cash_sessions(register_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_status ON cash_sessions(status);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        e
    })?;

    info!("Applied migration v1 (registers, sessions, settings)");
    Ok(())
}

/// Migration v2: the transaction ledger.
///
/// One table for all three variants; `kind` selects which of the nullable
/// variant columns apply. Deleting a session cascades its ledger rows, which
/// is what makes externally force-deleted sessions unrecoverable and the
/// recovery flow necessary.
fn migrate_v2(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cash_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('expense','purchase','income')),
            amount INTEGER NOT NULL,
            description TEXT NOT NULL,
            category TEXT,
            cost_center TEXT,
            affects_physical_cash INTEGER,
            quantity INTEGER,
            unit_price INTEGER,
            supplier TEXT,
            payment_method TEXT,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES cash_sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_session
            ON cash_transactions(session_id, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_transactions_kind
            ON cash_transactions(kind);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        e
    })?;

    info!("Applied migration v2 (cash_transactions ledger)");
    Ok(())
}

/// Migration v3: closure records, session notes, and the open-slot guard.
///
/// Adds:
/// - `cash_closures` persisting each reconciliation with its full summary JSON
/// - `notes` on `cash_sessions` (opening/closure note block)
/// - partial unique index enforcing at most one open session per register
fn migrate_v3(conn: &Connection) -> EngineResult<()> {
    if !column_exists(conn, "cash_sessions", "notes")? {
        conn.execute_batch("ALTER TABLE cash_sessions ADD COLUMN notes TEXT;")
            .map_err(|e| {
                error!("Migration v3 add notes failed: {e}");
                e
            })?;
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cash_closures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL UNIQUE,
            counted_amount INTEGER NOT NULL,
            expected_amount INTEGER NOT NULL,
            difference INTEGER NOT NULL,
            verdict TEXT NOT NULL CHECK(verdict IN ('balanced','surplus','shortage','deficit_situation')),
            notes TEXT,
            summary_json TEXT NOT NULL,
            closed_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES cash_sessions(id)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_register_open
            ON cash_sessions(register_id) WHERE status = 'open';

        -- Record migration
        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        e
    })?;

    info!("Applied migration v3 (cash_closures + open-session guard)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> EngineResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
