//! Savings accounting derived from ledger totals.

use serde::{Deserialize, Serialize};

/// Storage saved by deduplication.
///
/// Always derived from a single snapshot of the ledger totals; never kept as
/// a running counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Savings {
    pub bytes_saved: u64,
    pub total_unique_bytes: u64,
    pub total_logical_bytes: u64,
    /// Percentage of logical bytes not stored, rounded to two decimals.
    pub percent_saved: f64,
}

impl Savings {
    /// Compute savings from logical and unique byte totals.
    pub fn from_totals(total_logical_bytes: u64, total_unique_bytes: u64) -> Self {
        let bytes_saved = total_logical_bytes.saturating_sub(total_unique_bytes);
        let percent_saved = if total_logical_bytes > 0 {
            let raw = bytes_saved as f64 / total_logical_bytes as f64 * 100.0;
            (raw * 100.0).round() / 100.0
        } else {
            0.0
        };
        Self {
            bytes_saved,
            total_unique_bytes,
            total_logical_bytes,
            percent_saved,
        }
    }
}
