//! Seam to the external point-of-sale system.
//!
//! The engine never owns sales data; the closure reconciler asks a
//! `SalesProvider` for the per-session tender totals when expected cash is
//! computed. Only the cash tender enters the physical expectation, the rest
//! is reported on the summary.

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::sessions::CashSession;

/// Per-session sales aggregate broken out by tender. Minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesTotals {
    pub cash: i64,
    pub card: i64,
    pub transfer: i64,
    pub other: i64,
}

impl SalesTotals {
    pub fn total(&self) -> i64 {
        self.cash + self.card + self.transfer + self.other
    }
}

/// Supplies sales totals for a session. Implemented by the caller over
/// whatever owns point-of-sale data.
pub trait SalesProvider {
    fn sales_totals(&self, session: &CashSession) -> EngineResult<SalesTotals>;
}

/// Fixed totals, for tests and registers with no connected sales source.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedSales(pub SalesTotals);

impl SalesProvider for FixedSales {
    fn sales_totals(&self, _session: &CashSession) -> EngineResult<SalesTotals> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_sums_all_tenders() {
        let totals = SalesTotals {
            cash: 30_000,
            card: 12_500,
            transfer: 7_500,
            other: 0,
        };
        assert_eq!(totals.total(), 50_000);
    }
}
