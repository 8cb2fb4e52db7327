//! Per-component counters and the run summary.

use serde::Serialize;

/// Counters each migrator fills in while it runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComponentStats {
    /// Source rows (or reports, or chains) the component looked at
    pub found: u64,
    /// Items fully handled
    pub processed: u64,
    /// Items passed over on purpose: missing mapping, already migrated
    pub skipped: u64,
    /// Row-level failures that were logged and survived
    pub errors: u64,
    /// Destination rows written (inserted or updated)
    pub rows_written: u64,
    /// Snapshots that could not be parsed
    pub parse_errors: u64,
    /// Documented defaults that were applied to unmapped values
    pub warnings: u64,
}

impl ComponentStats {
    pub fn summary_line(&self) -> String {
        format!(
            "found={} processed={} skipped={} errors={} rows_written={}",
            self.found, self.processed, self.skipped, self.errors, self.rows_written
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ComponentStatus {
    Succeeded,
    Failed { error: String },
    NotRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub component: &'static str,
    #[serde(flatten)]
    pub status: ComponentStatus,
    pub stats: ComponentStats,
    pub duration_ms: u64,
}

impl ComponentReport {
    pub fn failed(&self) -> bool {
        matches!(self.status, ComponentStatus::Failed { .. })
    }
}

/// What the runner hands back after the last component
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub dry_run: bool,
    pub components: Vec<ComponentReport>,
    pub total_duration_ms: u64,
}

impl RunSummary {
    pub fn any_failed(&self) -> bool {
        self.components.iter().any(ComponentReport::failed)
    }

    pub fn totals(&self) -> ComponentStats {
        self.components
            .iter()
            .fold(ComponentStats::default(), |mut acc, report| {
                let s = &report.stats;
                acc.found += s.found;
                acc.processed += s.processed;
                acc.skipped += s.skipped;
                acc.errors += s.errors;
                acc.rows_written += s.rows_written;
                acc.parse_errors += s.parse_errors;
                acc.warnings += s.warnings;
                acc
            })
    }
}
