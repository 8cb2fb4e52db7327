//! The eight sub-migrations, in the order the runner calls them.

pub mod allocation_agreement;
pub mod chain;
pub mod fuel_supply;
pub mod notional_transfer;
pub mod orphan_exclusion;
pub mod other_uses;
pub mod report_history;
pub mod summary_seed;
pub mod summary_update;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::MigrationError;
use crate::stats::ComponentStats;

/// Value written to every `create_user` / `update_user` column.
pub const MIGRATION_USER: &str = "ETL";

/// Count a per-record failure and keep going.
pub(crate) fn record_failure(stats: &mut ComponentStats, what: &str, id: i32, error: &MigrationError) {
    stats.errors += 1;
    tracing::error!(id, error = %error, "Failed to migrate {what}");
}

/// Exact decimals only become floats at the final bind.
pub(crate) fn to_float(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
