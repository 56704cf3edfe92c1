//! Cash register records.
//!
//! A register is the physical drawer a session runs on. Registers are
//! created once and toggled active/inactive; sessions always reference one.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{self, DbState};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashRegister {
    pub id: i64,
    pub name: String,
    pub location: Option<String>,
    pub is_active: bool,
    pub created_at: String,
}

/// Create a register. Name must be non-empty.
pub fn create_register(
    db: &DbState,
    name: &str,
    location: Option<&str>,
) -> EngineResult<CashRegister> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation("register name is required".into()));
    }

    let conn = db::lock_conn(db)?;
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO cash_registers (name, location, is_active, created_at)
         VALUES (?1, ?2, 1, ?3)",
        params![name, location, now],
    )?;
    let id = conn.last_insert_rowid();

    info!(register_id = id, name, "Register created");

    Ok(CashRegister {
        id,
        name: name.to_string(),
        location: location.map(String::from),
        is_active: true,
        created_at: now,
    })
}

/// Fetch a register by id.
pub fn get_register(db: &DbState, register_id: i64) -> EngineResult<CashRegister> {
    let conn = db::lock_conn(db)?;
    get_register_on(&conn, register_id)
}

/// List registers, optionally only active ones.
pub fn list_registers(db: &DbState, active_only: bool) -> EngineResult<Vec<CashRegister>> {
    let conn = db::lock_conn(db)?;
    let sql = if active_only {
        "SELECT id, name, location, is_active, created_at FROM cash_registers
         WHERE is_active = 1 ORDER BY id"
    } else {
        "SELECT id, name, location, is_active, created_at FROM cash_registers ORDER BY id"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], row_to_register)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Activate or deactivate a register. Inactive registers refuse new sessions.
pub fn set_register_active(db: &DbState, register_id: i64, active: bool) -> EngineResult<()> {
    let conn = db::lock_conn(db)?;
    let changed = conn.execute(
        "UPDATE cash_registers SET is_active = ?1 WHERE id = ?2",
        params![active as i64, register_id],
    )?;
    if changed == 0 {
        return Err(EngineError::NotFound(format!(
            "register {register_id} does not exist"
        )));
    }
    info!(register_id, active, "Register active flag updated");
    Ok(())
}

/// Fetch a register on an already-held connection.
pub(crate) fn get_register_on(conn: &Connection, register_id: i64) -> EngineResult<CashRegister> {
    conn.query_row(
        "SELECT id, name, location, is_active, created_at FROM cash_registers WHERE id = ?1",
        params![register_id],
        row_to_register,
    )
    .optional()?
    .ok_or_else(|| EngineError::NotFound(format!("register {register_id} does not exist")))
}

fn row_to_register(row: &rusqlite::Row) -> rusqlite::Result<CashRegister> {
    Ok(CashRegister {
        id: row.get(0)?,
        name: row.get(1)?,
        location: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
    })
}
