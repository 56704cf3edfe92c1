//! Recovery from an externally deleted session.
//!
//! When a close attempt reports `NotFound`, the session row was removed
//! out-of-band while the drawer was mid-closure (a privileged force-delete
//! being the known cause). The compensating action is to open a brand-new
//! session seeded with the counted physical amount so no cash goes
//! unaccounted. It is best-effort: the original ledger is gone and is not
//! resurrected. The engine never triggers this on its own; the caller
//! decides after seeing the error.

use tracing::warn;

use crate::balance::format_minor;
use crate::db::{self, DbState};
use crate::error::{EngineError, EngineResult};
use crate::sessions::{self, CashSession};

const SETTINGS_CATEGORY: &str = "recovery";
const KEY_DEFAULT_USER: &str = "default_user";
const KEY_DEFAULT_REGISTER: &str = "default_register";

/// Inputs for a recovery open. Register and acting user may be omitted when
/// the deployment configured recovery defaults.
#[derive(Debug, Clone, Default)]
pub struct RecoveryArgs {
    pub register_id: Option<i64>,
    pub acting_user: Option<String>,
    pub counted_amount: i64,
    pub note: Option<String>,
}

/// Configure the fallback identity and register used when a recovery call
/// does not name them. Stored in settings, never hard-coded.
pub fn set_recovery_defaults(
    db: &DbState,
    default_user: Option<&str>,
    default_register: Option<i64>,
) -> EngineResult<()> {
    let conn = db::lock_conn(db)?;
    if let Some(user) = default_user {
        db::set_setting(&conn, SETTINGS_CATEGORY, KEY_DEFAULT_USER, user)?;
    }
    if let Some(register) = default_register {
        db::set_setting(
            &conn,
            SETTINGS_CATEGORY,
            KEY_DEFAULT_REGISTER,
            &register.to_string(),
        )?;
    }
    Ok(())
}

/// Open a replacement session after an out-of-band deletion.
///
/// The counted amount from the failed closure becomes the new opening
/// amount, and the session notes record the provenance. The normal open
/// rules still apply, so a register that meanwhile got a fresh open session
/// yields `Conflict`.
pub fn recover_deleted_session(db: &DbState, args: RecoveryArgs) -> EngineResult<CashSession> {
    if args.counted_amount <= 0 {
        return Err(EngineError::Validation(
            "counted amount must be positive".into(),
        ));
    }

    let (register_id, acting_user) = {
        let conn = db::lock_conn(db)?;
        let register_id = match args.register_id {
            Some(id) => id,
            None => db::get_setting(&conn, SETTINGS_CATEGORY, KEY_DEFAULT_REGISTER)
                .and_then(|v| v.parse::<i64>().ok())
                .ok_or_else(|| {
                    EngineError::Validation(
                        "no register given and no recovery default_register configured".into(),
                    )
                })?,
        };
        let acting_user = match args.acting_user {
            Some(user) if !user.trim().is_empty() => user,
            _ => db::get_setting(&conn, SETTINGS_CATEGORY, KEY_DEFAULT_USER).ok_or_else(|| {
                EngineError::Validation(
                    "no acting user given and no recovery default_user configured".into(),
                )
            })?,
        };
        (register_id, acting_user)
    };

    warn!(
        register_id,
        counted_amount = args.counted_amount,
        "Recovering from an externally deleted session"
    );

    let provenance = format!(
        "Recovered after an externally deleted session; opening amount {} carried over from the counted cash of the failed closure.",
        format_minor(args.counted_amount)
    );
    let note = match args.note.as_deref() {
        Some(n) if !n.trim().is_empty() => format!("{provenance}\n{n}"),
        _ => provenance,
    };

    sessions::open_session(
        db,
        register_id,
        &acting_user,
        args.counted_amount,
        Some(&note),
    )
}

// ===========================================================================
// Tests
// ===========================================================================
