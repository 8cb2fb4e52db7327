//! Seeds one locked summary row per migrated report.
//!
//! Every numeric column starts at zero except the carry-forward fields copied
//! from the TFRS summary. Reports that already have a summary are left alone,
//! so a second run inserts nothing.

use std::collections::HashSet;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{Connection, FromRow};

use super::record_failure;
use crate::db;
use crate::error::Result;
use crate::legacy_map::LegacyIdMap;
use crate::runner::{MigrationContext, Migrator};
use crate::stats::ComponentStats;
use crate::summary::SummaryRecord;

pub const NAME: &str = "summary-seed";

#[derive(Debug, Clone, Default, PartialEq, FromRow)]
pub struct SourceSummary {
    pub compliance_report_id: i32,
    pub gasoline_class_retained: Option<Decimal>,
    pub gasoline_class_deferred: Option<Decimal>,
    pub diesel_class_retained: Option<Decimal>,
    pub diesel_class_deferred: Option<Decimal>,
    pub gasoline_class_previously_retained: Option<Decimal>,
    pub diesel_class_previously_retained: Option<Decimal>,
    pub credits_offset: Option<i32>,
}

impl SourceSummary {
    /// Zeroed summary carrying the TFRS carry-forward fields.
    pub fn seed_record(&self) -> Result<SummaryRecord> {
        let mut record = SummaryRecord::zeroed();
        let carried = [
            ("line_6_renewable_fuel_retained_gasoline", self.gasoline_class_retained),
            ("line_6_renewable_fuel_retained_diesel", self.diesel_class_retained),
            ("line_7_previously_retained_gasoline", self.gasoline_class_previously_retained),
            ("line_7_previously_retained_diesel", self.diesel_class_previously_retained),
            ("line_8_obligation_deferred_gasoline", self.gasoline_class_deferred),
            ("line_8_obligation_deferred_diesel", self.diesel_class_deferred),
            (
                "line_22_compliance_units_issued",
                self.credits_offset.map(Decimal::from),
            ),
        ];
        for (column, value) in carried {
            if let Some(value) = value {
                record.set(column, value)?;
            }
        }
        Ok(record)
    }
}

async fn existing_summaries(ctx: &MigrationContext) -> Result<HashSet<i32>> {
    let ids: Vec<i32> = sqlx::query_scalar(
        "SELECT compliance_report_id FROM compliance_report_summary WHERE compliance_report_id IS NOT NULL",
    )
    .fetch_all(ctx.destination())
    .await?;
    Ok(ids.into_iter().collect())
}

#[derive(Debug, Default)]
pub struct SummarySeedMigrator;

impl SummarySeedMigrator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Migrator for SummarySeedMigrator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn required_source_tables(&self) -> &'static [&'static str] {
        &["compliance_report", "compliance_report_summary"]
    }

    async fn run(&mut self, ctx: &MigrationContext) -> Result<ComponentStats> {
        let mut stats = ComponentStats::default();
        let legacy = LegacyIdMap::load(ctx.destination()).await?;
        let mut seeded = existing_summaries(ctx).await?;

        let summaries = sqlx::query_as::<_, SourceSummary>(
            r#"
            SELECT cr.id AS compliance_report_id,
                   s.gasoline_class_retained::numeric AS gasoline_class_retained,
                   s.gasoline_class_deferred::numeric AS gasoline_class_deferred,
                   s.diesel_class_retained::numeric AS diesel_class_retained,
                   s.diesel_class_deferred::numeric AS diesel_class_deferred,
                   s.gasoline_class_previously_retained::numeric AS gasoline_class_previously_retained,
                   s.diesel_class_previously_retained::numeric AS diesel_class_previously_retained,
                   s.credits_offset
            FROM compliance_report cr
            JOIN compliance_report_summary s ON s.id = cr.summary_id
            WHERE cr.summary_id IS NOT NULL
            ORDER BY cr.id
            "#,
        )
        .fetch_all(ctx.source())
        .await?;

        let mut tx = ctx.destination().begin().await?;
        for summary in &summaries {
            stats.found += 1;
            let Some(report_id) = legacy.report_id(summary.compliance_report_id) else {
                tracing::debug!(legacy_id = summary.compliance_report_id, "No destination report");
                stats.skipped += 1;
                continue;
            };
            if seeded.contains(&report_id) {
                stats.skipped += 1;
                continue;
            }

            let record = match summary.seed_record() {
                Ok(record) => record,
                Err(e) => {
                    record_failure(&mut stats, "summary", summary.compliance_report_id, &e);
                    continue;
                }
            };

            let mut savepoint = tx.begin().await?;
            match record.insert(&mut savepoint, report_id).await {
                Ok(()) => {
                    savepoint.commit().await?;
                    seeded.insert(report_id);
                    stats.rows_written += 1;
                    stats.processed += 1;
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    record_failure(&mut stats, "summary", summary.compliance_report_id, &e);
                }
            }
        }

        db::finish(tx, ctx.dry_run()).await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_forward_retained_deferred_and_offset() {
        let summary = SourceSummary {
            compliance_report_id: 100,
            gasoline_class_retained: Some(Decimal::new(1500, 0)),
            diesel_class_deferred: Some(Decimal::new(250, 1)),
            diesel_class_previously_retained: Some(Decimal::new(75, 0)),
            credits_offset: Some(320),
            ..Default::default()
        };
        let record = summary.seed_record().unwrap();

        assert_eq!(
            record.get("line_6_renewable_fuel_retained_gasoline"),
            Some(Decimal::new(1500, 0))
        );
        assert_eq!(
            record.get("line_8_obligation_deferred_diesel"),
            Some(Decimal::new(25, 0))
        );
        assert_eq!(
            record.get("line_7_previously_retained_diesel"),
            Some(Decimal::new(75, 0))
        );
        assert_eq!(
            record.get("line_22_compliance_units_issued"),
            Some(Decimal::new(320, 0))
        );
    }

    #[test]
    fn everything_else_starts_at_zero() {
        let record = SourceSummary::default().seed_record().unwrap();
        assert_eq!(record.len(), SummaryRecord::zeroed().len());
        assert!(record.iter().all(|(_, value)| value.is_zero()));
    }
}
