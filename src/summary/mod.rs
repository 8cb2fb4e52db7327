//! Compliance report summary: the wide per-report totals row, the TFRS line
//! mapping that fills it, and the balance calculations behind lines 12-17.

pub mod balance;
pub mod lines;
pub mod period;
pub mod record;

pub use balance::{available_balance, dynamic_aggregates, DynamicAggregates, LedgerSnapshot};
pub use lines::SnapshotLines;
pub use period::{period_end, SummaryContext};
pub use record::SummaryRecord;
