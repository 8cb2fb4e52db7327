//! Re-populates summary rows from the TFRS report snapshots
//!
//! Snapshot lines are remapped onto the LCFS columns, lines 12-14 are
//! recomputed from the live transfer and initiative agreement tables, and
//! Line 17 is the organization's available balance at the end of the period.
//! Updates are committed in batches.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::{Connection, FromRow, PgPool, Postgres, Transaction};

use super::record_failure;
use crate::error::{MigrationError, Result};
use crate::legacy_map::LegacyIdMap;
use crate::runner::{MigrationContext, Migrator};
use crate::stats::ComponentStats;
use crate::summary::{available_balance, dynamic_aggregates, SnapshotLines, SummaryContext, SummaryRecord};

pub const NAME: &str = "summary-update";

#[derive(Debug, Clone, FromRow)]
struct SnapshotRow {
    compliance_report_id: i32,
    snapshot: String,
}

/// Parse a raw snapshot; malformed JSON is a parse error for that report.
pub fn parse_snapshot(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw)?)
}

/// Summary columns that come from the snapshot alone.
pub fn snapshot_record(lines: &SnapshotLines) -> Result<SummaryRecord> {
    let mut record = SummaryRecord::default();
    lines.apply_to(&mut record)?;
    Ok(record)
}

/// Calculation contexts, cached per organization and period.
struct Contexts<'a> {
    destination: &'a PgPool,
    cache: HashMap<(i32, i32), SummaryContext>,
}

impl<'a> Contexts<'a> {
    fn new(destination: &'a PgPool) -> Self {
        Self {
            destination,
            cache: HashMap::new(),
        }
    }

    async fn get(&mut self, organization_id: i32, compliance_period_id: i32) -> Result<SummaryContext> {
        if let Some(ctx) = self.cache.get(&(organization_id, compliance_period_id)) {
            return Ok(ctx.clone());
        }
        let ctx = SummaryContext::load(self.destination, organization_id, compliance_period_id).await?;
        self.cache
            .insert((organization_id, compliance_period_id), ctx.clone());
        Ok(ctx)
    }
}

async fn dynamic_lines(destination: &PgPool, ctx: &SummaryContext, record: &mut SummaryRecord) -> Result<()> {
    let aggregates = dynamic_aggregates(destination, ctx).await?;
    record.set(
        "line_12_low_carbon_fuel_required",
        Decimal::from(aggregates.transferred_out),
    )?;
    record.set(
        "line_13_low_carbon_fuel_supplied",
        Decimal::from(aggregates.received),
    )?;
    record.set(
        "line_14_low_carbon_fuel_surplus",
        Decimal::from(aggregates.issued),
    )?;

    let balance = available_balance(destination, ctx).await?;
    record.set("line_17_non_banked_units_used", Decimal::from(balance))?;
    Ok(())
}

async fn commit_batch(
    tx: Transaction<'static, Postgres>,
    destination: &PgPool,
    dry_run: bool,
) -> Result<Transaction<'static, Postgres>> {
    if dry_run {
        return Ok(tx);
    }
    tx.commit().await?;
    Ok(destination.begin().await?)
}

#[derive(Debug, Default)]
pub struct SummaryUpdateMigrator;

impl SummaryUpdateMigrator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Migrator for SummaryUpdateMigrator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn required_source_tables(&self) -> &'static [&'static str] {
        &["compliance_report", "compliance_report_snapshot"]
    }

    async fn run(&mut self, ctx: &MigrationContext) -> Result<ComponentStats> {
        let mut stats = ComponentStats::default();
        let destination = ctx.destination();
        let legacy = LegacyIdMap::load(destination).await?;
        let batch = ctx.options.summary_commit_batch.max(1);

        let snapshots = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT crs.compliance_report_id, crs.snapshot::text AS snapshot
            FROM compliance_report_snapshot crs
            JOIN compliance_report cr ON cr.id = crs.compliance_report_id
            WHERE crs.snapshot IS NOT NULL
            ORDER BY crs.compliance_report_id
            "#,
        )
        .fetch_all(ctx.source())
        .await?;

        let mut contexts = Contexts::new(destination);
        let mut tx = destination.begin().await?;
        let mut pending = 0usize;

        for row in &snapshots {
            stats.found += 1;
            let Some(report) = legacy.get(row.compliance_report_id) else {
                stats.skipped += 1;
                continue;
            };
            let report_id = report.compliance_report_id;

            let snapshot = match parse_snapshot(&row.snapshot) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    stats.parse_errors += 1;
                    tracing::warn!(legacy_id = row.compliance_report_id, error = %e, "Malformed snapshot");
                    continue;
                }
            };
            let Some(lines) = SnapshotLines::from_snapshot(&snapshot) else {
                tracing::debug!(legacy_id = row.compliance_report_id, "Snapshot has no summary lines");
                stats.skipped += 1;
                continue;
            };
            stats.parse_errors += lines.invalid.len() as u64;

            let summary_ctx = match contexts
                .get(report.organization_id, report.compliance_period_id)
                .await
            {
                Ok(summary_ctx) => summary_ctx,
                Err(e @ MigrationError::InvalidData(_)) => {
                    record_failure(&mut stats, "summary", row.compliance_report_id, &e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut record = snapshot_record(&lines)?;
            dynamic_lines(destination, &summary_ctx, &mut record).await?;

            let mut savepoint = tx.begin().await?;
            let updated = record
                .update(&mut savepoint, report_id, snapshot.get("summary"))
                .await;
            match updated {
                Ok(0) => {
                    savepoint.rollback().await?;
                    tracing::warn!(report_id, "No summary row to update");
                    stats.skipped += 1;
                }
                Ok(rows) => {
                    savepoint.commit().await?;
                    stats.rows_written += rows;
                    stats.processed += 1;
                    pending += 1;
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    record_failure(&mut stats, "summary", row.compliance_report_id, &e);
                }
            }

            if pending >= batch {
                tx = commit_batch(tx, destination, ctx.dry_run()).await?;
                pending = 0;
            }
        }

        crate::db::finish(tx, ctx.dry_run()).await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_snapshot_is_a_parse_error() {
        assert!(matches!(
            parse_snapshot("{\"summary\": "),
            Err(MigrationError::Snapshot(_))
        ));
        assert!(parse_snapshot("{\"summary\": {\"lines\": {}}}").is_ok());
    }

    #[test]
    fn snapshot_record_touches_only_mapped_columns() {
        let snapshot = json!({
            "summary": { "lines": { "6": "120", "17": "80", "26": "15" } }
        });
        let lines = SnapshotLines::from_snapshot(&snapshot).unwrap();
        let record = snapshot_record(&lines).unwrap();

        assert_eq!(
            record.get("line_6_renewable_fuel_retained_gasoline"),
            Some(Decimal::new(120, 0))
        );
        assert_eq!(
            record.get("line_6_renewable_fuel_retained_diesel"),
            Some(Decimal::new(80, 0))
        );
        assert_eq!(record.get("line_15_banked_units_used"), Some(Decimal::new(15, 0)));
        // dynamic lines are filled from the database, not the snapshot
        assert_eq!(record.get("line_17_non_banked_units_used"), None);
        assert_eq!(record.get("line_12_low_carbon_fuel_required"), None);
        assert_eq!(
            record.get("line_6_renewable_fuel_retained_jet_fuel"),
            None
        );
    }
}
