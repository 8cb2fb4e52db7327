//! Report status history
//!
//! TFRS tracks four review axes per history row (fuel supplier, analyst,
//! manager, director). LCFS keeps one linear status, so each row collapses to
//! the furthest stage it reached. The destination table is rebuilt from
//! scratch on every run.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lcfs_types::ComplianceReportStatus;
use sqlx::{FromRow, PgPool};

use super::{record_failure, MIGRATION_USER};
use crate::db;
use crate::error::Result;
use crate::legacy_map::LegacyIdMap;
use crate::runner::{MigrationContext, Migrator};
use crate::stats::ComponentStats;

pub const NAME: &str = "report-history";

/// The four review axes of one TFRS workflow state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowState {
    pub fuel_supplier: Option<String>,
    pub analyst: Option<String>,
    pub manager: Option<String>,
    pub director: Option<String>,
}

fn is(axis: &Option<String>, status: &str) -> bool {
    axis.as_deref()
        .map(|value| value.trim().eq_ignore_ascii_case(status))
        .unwrap_or(false)
}

impl WorkflowState {
    fn axes(&self) -> [&Option<String>; 4] {
        [&self.fuel_supplier, &self.analyst, &self.manager, &self.director]
    }

    /// Destination status for this state, `None` when the row is not a
    /// destination history event.
    pub fn destination_status(&self) -> Option<ComplianceReportStatus> {
        if is(&self.fuel_supplier, "Draft")
            || self.axes().iter().any(|axis| is(axis, "Requested Supplemental"))
        {
            return None;
        }
        if is(&self.director, "Rejected") {
            return Some(ComplianceReportStatus::Rejected);
        }

        let stage = [
            (is(&self.fuel_supplier, "Submitted"), 1),
            (is(&self.analyst, "Recommended"), 2),
            (is(&self.manager, "Recommended"), 3),
            (is(&self.director, "Accepted"), 4),
        ]
        .into_iter()
        .filter(|(reached, _)| *reached)
        .map(|(_, stage)| stage)
        .max()?;

        Some(match stage {
            1 => ComplianceReportStatus::Submitted,
            2 => ComplianceReportStatus::RecommendedByAnalyst,
            3 => ComplianceReportStatus::RecommendedByManager,
            _ => ComplianceReportStatus::Assessed,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct HistoryRow {
    id: i32,
    compliance_report_id: i32,
    create_timestamp: Option<DateTime<Utc>>,
    fuel_supplier_status: Option<String>,
    analyst_status: Option<String>,
    manager_status: Option<String>,
    director_status: Option<String>,
}

impl HistoryRow {
    fn state(&self) -> WorkflowState {
        WorkflowState {
            fuel_supplier: self.fuel_supplier_status.clone(),
            analyst: self.analyst_status.clone(),
            manager: self.manager_status.clone(),
            director: self.director_status.clone(),
        }
    }
}

/// Drops repeats of the previous event of the same report.
#[derive(Debug, Default)]
pub struct HistoryCollapser {
    last: Option<(i32, ComplianceReportStatus)>,
}

impl HistoryCollapser {
    /// Whether `(report, status)` is a new event.
    pub fn accept(&mut self, compliance_report_id: i32, status: ComplianceReportStatus) -> bool {
        let event = (compliance_report_id, status);
        if self.last == Some(event) {
            return false;
        }
        self.last = Some(event);
        true
    }
}

pub(crate) async fn load_status_ids(destination: &PgPool) -> Result<HashMap<ComplianceReportStatus, i32>> {
    let rows: Vec<(i32, ComplianceReportStatus)> = sqlx::query_as(
        "SELECT compliance_report_status_id, status FROM compliance_report_status",
    )
    .fetch_all(destination)
    .await?;
    Ok(rows.into_iter().map(|(id, status)| (status, id)).collect())
}

#[derive(Debug, Default)]
pub struct ReportHistoryMigrator;

impl ReportHistoryMigrator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Migrator for ReportHistoryMigrator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn required_source_tables(&self) -> &'static [&'static str] {
        &["compliance_report_history", "compliance_report_workflow_state"]
    }

    async fn run(&mut self, ctx: &MigrationContext) -> Result<ComponentStats> {
        let mut stats = ComponentStats::default();
        let legacy = LegacyIdMap::load(ctx.destination()).await?;
        let status_ids = load_status_ids(ctx.destination()).await?;

        let mut tx = ctx.destination().begin().await?;
        sqlx::query("TRUNCATE TABLE compliance_report_history RESTART IDENTITY")
            .execute(&mut *tx)
            .await?;
        tracing::info!("Cleared destination report history");

        let mut rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT h.id, h.compliance_report_id, h.create_timestamp,
                   ws.fuel_supplier_status_id::text AS fuel_supplier_status,
                   ws.analyst_status_id::text AS analyst_status,
                   ws.manager_status_id::text AS manager_status,
                   ws.director_status_id::text AS director_status
            FROM compliance_report_history h
            JOIN compliance_report_workflow_state ws ON ws.id = h.status_id
            ORDER BY h.compliance_report_id, h.create_timestamp, h.id
            "#,
        )
        .fetch(ctx.source());

        let mut collapser = HistoryCollapser::default();
        while let Some(row) = rows.try_next().await? {
            stats.found += 1;
            let Some(report_id) = legacy.report_id(row.compliance_report_id) else {
                stats.skipped += 1;
                continue;
            };
            let Some(status) = row.state().destination_status() else {
                stats.skipped += 1;
                continue;
            };
            if !collapser.accept(report_id, status) {
                stats.skipped += 1;
                continue;
            }
            let Some(status_id) = status_ids.get(&status).copied() else {
                stats.warnings += 1;
                tracing::warn!(status = %status, "Status missing from destination");
                continue;
            };

            let query = sqlx::query(
                r#"
                INSERT INTO compliance_report_history (
                    compliance_report_id, status_id, create_date, update_date,
                    create_user, update_user
                ) VALUES ($1, $2, COALESCE($3, NOW()), COALESCE($3, NOW()), $4, $4)
                "#,
            )
            .bind(report_id)
            .bind(status_id)
            .bind(row.create_timestamp)
            .bind(MIGRATION_USER);

            match db::execute_in_savepoint(&mut tx, query).await {
                Ok(written) => {
                    stats.rows_written += written;
                    stats.processed += 1;
                }
                Err(e) => record_failure(&mut stats, "history row", row.id, &e),
            }
        }
        drop(rows);

        db::finish(tx, ctx.dry_run()).await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(fs: &str, analyst: &str, manager: &str, director: &str) -> WorkflowState {
        let axis = |s: &str| (!s.is_empty()).then(|| s.to_string());
        WorkflowState {
            fuel_supplier: axis(fs),
            analyst: axis(analyst),
            manager: axis(manager),
            director: axis(director),
        }
    }

    #[test]
    fn takes_the_furthest_stage() {
        use ComplianceReportStatus::*;
        let cases = [
            (state("Submitted", "Unreviewed", "Unreviewed", "Unreviewed"), Some(Submitted)),
            (state("Submitted", "Recommended", "Unreviewed", "Unreviewed"), Some(RecommendedByAnalyst)),
            (state("Submitted", "Recommended", "Recommended", "Unreviewed"), Some(RecommendedByManager)),
            (state("Submitted", "Recommended", "Recommended", "Accepted"), Some(Assessed)),
            // manager recommendation without analyst still counts as stage 3
            (state("Submitted", "Not Recommended", "Recommended", ""), Some(RecommendedByManager)),
        ];
        for (state, expected) in cases {
            assert_eq!(state.destination_status(), expected, "{state:?}");
        }
    }

    #[test]
    fn drafts_and_supplemental_requests_are_dropped() {
        assert_eq!(state("Draft", "", "", "").destination_status(), None);
        assert_eq!(
            state("Submitted", "Requested Supplemental", "", "").destination_status(),
            None
        );
        assert_eq!(
            state("Submitted", "Recommended", "Requested Supplemental", "").destination_status(),
            None
        );
        assert_eq!(state("Deleted", "", "", "").destination_status(), None);
    }

    #[test]
    fn director_rejection_maps_to_rejected() {
        assert_eq!(
            state("Submitted", "Recommended", "Recommended", "Rejected").destination_status(),
            Some(ComplianceReportStatus::Rejected)
        );
    }

    #[test]
    fn consecutive_duplicates_collapse_per_report() {
        use ComplianceReportStatus::*;
        let mut collapser = HistoryCollapser::default();
        assert!(collapser.accept(1, Submitted));
        assert!(!collapser.accept(1, Submitted));
        assert!(collapser.accept(1, Assessed));
        assert!(collapser.accept(2, Assessed));
        assert!(collapser.accept(1, Assessed));
    }
}
