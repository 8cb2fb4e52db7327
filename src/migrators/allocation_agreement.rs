//! Allocation agreements, rebuilt from TFRS exclusion agreement records
//!
//! Destination chains are walked by report group uuid. Each report reads the
//! exclusion agreement it carries itself; a report without one has no
//! allocation records. There is no fallback to another report of
//! the same organization and period.

use std::collections::HashMap;

use async_trait::async_trait;
use lcfs_types::FuelCategory;
use rust_decimal::Decimal;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{FromRow, PgPool, Postgres};

use super::chain;
use super::{record_failure, to_float, MIGRATION_USER};
use crate::db;
use crate::error::Result;
use crate::legacy_map::LegacyIdMap;
use crate::reference;
use crate::runner::{MigrationContext, Migrator};
use crate::stats::ComponentStats;
use crate::versioning::{normalize, PlannedChange, RecordValues, VersionedChain};

pub const NAME: &str = "allocation-agreements";
pub(crate) const TABLE: &str = "allocation_agreement";

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ExclusionRecord {
    pub id: i32,
    pub responsibility: String,
    pub fuel_type: String,
    pub fuel_type_id: i32,
    pub transaction_partner: String,
    pub postal_address: Option<String>,
    pub quantity: Decimal,
    pub quantity_not_sold: Option<Decimal>,
    pub unit_of_measure: Option<String>,
}

/// Partner, responsibility and fuel type; quantity stays out of the key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AllocationKey {
    pub transaction_partner: String,
    pub responsibility: String,
    pub fuel_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationValues {
    pub transaction_partner: String,
    pub postal_address: Option<String>,
    pub transaction_type: &'static str,
    pub fuel_type_id: i32,
    pub fuel_category: Option<FuelCategory>,
    pub quantity: Decimal,
    pub quantity_not_sold: Option<Decimal>,
    pub units: &'static str,
}

impl RecordValues for AllocationValues {
    fn changed_from(&self, previous: &Self) -> bool {
        self.quantity != previous.quantity
            || self.quantity_not_sold != previous.quantity_not_sold
            || self.postal_address != previous.postal_address
            || self.units != previous.units
    }
}

pub type AllocationChange = PlannedChange<AllocationKey, AllocationValues>;

fn to_keyed(record: ExclusionRecord, stats: &mut ComponentStats) -> (AllocationKey, AllocationValues) {
    let transaction_type = reference::allocation_transaction_type(&record.responsibility);
    if transaction_type.defaulted {
        stats.warnings += 1;
        tracing::warn!(
            record_id = record.id,
            responsibility = %record.responsibility,
            "Unmapped responsibility, using {}",
            transaction_type.value
        );
    }
    let fuel_type = reference::lcfs_fuel_type_id(record.fuel_type_id);
    if fuel_type.defaulted {
        stats.warnings += 1;
        tracing::warn!(record_id = record.id, fuel_type = %record.fuel_type, "Unmapped fuel type");
    }
    let fuel_category = reference::fuel_category_from_fuel_name(&record.fuel_type);
    if fuel_category.is_none() {
        stats.warnings += 1;
        tracing::warn!(
            record_id = record.id,
            fuel_type = %record.fuel_type,
            "No fuel category derivable from fuel type name"
        );
    }
    let units = reference::lcfs_units(record.unit_of_measure.as_deref().unwrap_or_default());

    let key = AllocationKey {
        transaction_partner: normalize(&record.transaction_partner),
        responsibility: normalize(&record.responsibility),
        fuel_type: normalize(&record.fuel_type),
    };
    let values = AllocationValues {
        transaction_partner: record.transaction_partner,
        postal_address: record.postal_address,
        transaction_type: transaction_type.value,
        fuel_type_id: fuel_type.value,
        fuel_category,
        quantity: record.quantity,
        quantity_not_sold: record.quantity_not_sold,
        units: units.value,
    };
    (key, values)
}

/// Diff one report's exclusion agreement records against the chain.
pub fn plan_report(
    versions: &mut VersionedChain<AllocationKey, AllocationValues>,
    records: Option<Vec<ExclusionRecord>>,
    stats: &mut ComponentStats,
) -> Vec<AllocationChange> {
    let current = records.map(|rows| {
        rows.into_iter()
            .map(|record| to_keyed(record, stats))
            .collect::<Vec<_>>()
    });
    versions.apply(current)
}

pub async fn load_agreement_records(
    source: &PgPool,
    exclusion_agreement_id: i32,
) -> Result<Vec<ExclusionRecord>> {
    let rows = sqlx::query_as::<_, ExclusionRecord>(
        r#"
        SELECT r.id, tt.the_type AS responsibility, aft.name AS fuel_type,
               r.fuel_type_id, r.transaction_partner, r.postal_address,
               r.quantity::numeric AS quantity,
               r.quantity_not_sold::numeric AS quantity_not_sold,
               uom.name AS unit_of_measure
        FROM compliance_report_exclusion_agreement_record r
        JOIN transaction_type tt ON tt.id = r.transaction_type_id
        JOIN approved_fuel_type aft ON aft.id = r.fuel_type_id
        LEFT JOIN unit_of_measure uom ON uom.id = aft.unit_of_measure_id
        WHERE r.exclusion_agreement_id = $1
        ORDER BY r.id
        "#,
    )
    .bind(exclusion_agreement_id)
    .fetch_all(source)
    .await?;
    Ok(rows)
}

/// Writes allocation rows; shared with orphan recovery.
#[derive(Debug, Clone, Default)]
pub struct AllocationWriter {
    transaction_types: HashMap<String, i32>,
}

impl AllocationWriter {
    pub async fn load(destination: &PgPool) -> Result<Self> {
        let rows: Vec<(i32, String)> = sqlx::query_as(
            "SELECT allocation_transaction_type_id, type FROM allocation_transaction_type",
        )
        .fetch_all(destination)
        .await?;
        let transaction_types = rows.into_iter().map(|(id, name)| (name, id)).collect();
        Ok(Self { transaction_types })
    }

    pub fn insert_query(
        &self,
        compliance_report_id: i32,
        change: &AllocationChange,
    ) -> Query<'static, Postgres, PgArguments> {
        let transaction_type_id = self
            .transaction_types
            .get(change.values.transaction_type)
            .copied();
        sqlx::query(
            r#"
            INSERT INTO allocation_agreement (
                compliance_report_id, transaction_partner, postal_address,
                allocation_transaction_type_id, fuel_type_id, fuel_category_id,
                quantity, quantity_not_sold, units,
                group_uuid, version, action_type, create_user, update_user
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::quantityunitsenum,
                      $10, $11, $12, $13, $13)
            "#,
        )
        .bind(compliance_report_id)
        .bind(change.values.transaction_partner.clone())
        .bind(change.values.postal_address.clone())
        .bind(transaction_type_id)
        .bind(change.values.fuel_type_id)
        .bind(change.values.fuel_category.map(|c| c.id()))
        .bind(to_float(change.values.quantity))
        .bind(change.values.quantity_not_sold.map(to_float))
        .bind(change.values.units)
        .bind(change.group_uuid.to_string())
        .bind(change.version)
        .bind(change.action)
        .bind(MIGRATION_USER)
    }
}

#[derive(Debug, Default)]
pub struct AllocationAgreementMigrator;

impl AllocationAgreementMigrator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Migrator for AllocationAgreementMigrator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn required_source_tables(&self) -> &'static [&'static str] {
        &[
            "compliance_report",
            "compliance_report_exclusion_agreement",
            "compliance_report_exclusion_agreement_record",
            "transaction_type",
            "approved_fuel_type",
        ]
    }

    async fn run(&mut self, ctx: &MigrationContext) -> Result<ComponentStats> {
        let mut stats = ComponentStats::default();
        let legacy = LegacyIdMap::load(ctx.destination()).await?;
        let agreements: HashMap<i32, Option<i32>> = chain::load_source_reports(ctx.source())
            .await?
            .into_iter()
            .map(|r| (r.id, r.exclusion_agreement_id))
            .collect();

        let writer = AllocationWriter::load(ctx.destination()).await?;
        let existing = chain::reports_with_rows(ctx.destination(), TABLE).await?;
        let mut tx = ctx.destination().begin().await?;

        for reports in legacy.chains() {
            stats.found += 1;
            if reports
                .iter()
                .any(|r| existing.contains(&r.compliance_report_id))
            {
                stats.skipped += 1;
                continue;
            }

            let mut versions = VersionedChain::new();
            for report in &reports {
                let Some(agreement_id) = agreements.get(&report.legacy_id) else {
                    tracing::warn!(legacy_id = report.legacy_id, "Source report not found");
                    stats.skipped += 1;
                    continue;
                };
                let records = match agreement_id {
                    Some(id) => Some(load_agreement_records(ctx.source(), *id).await?),
                    None => None,
                };

                let report_id = report.compliance_report_id;
                for change in plan_report(&mut versions, records, &mut stats) {
                    let query = writer.insert_query(report_id, &change);
                    match db::execute_in_savepoint(&mut tx, query).await {
                        Ok(rows) => stats.rows_written += rows,
                        Err(e) => record_failure(&mut stats, "allocation agreement", report_id, &e),
                    }
                }
            }
            stats.processed += 1;
        }

        db::finish(tx, ctx.dry_run()).await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcfs_types::ActionType;

    fn record(id: i32, partner: &str, quantity: i64) -> ExclusionRecord {
        ExclusionRecord {
            id,
            responsibility: "Purchased".into(),
            fuel_type: "Petroleum-based diesel".into(),
            fuel_type_id: 13,
            transaction_partner: partner.into(),
            postal_address: Some("PO Box 1, Prince George BC".into()),
            quantity: Decimal::new(quantity, 0),
            quantity_not_sold: None,
            unit_of_measure: Some("L".into()),
        }
    }

    #[test]
    fn missing_agreement_in_supplemental_deletes_nothing() {
        let mut versions = VersionedChain::new();
        let mut stats = ComponentStats::default();
        let original: Vec<ExclusionRecord> = (1..=5)
            .map(|i| record(i, &format!("Partner {i}"), 1000 * i as i64))
            .collect();

        let created = plan_report(&mut versions, Some(original), &mut stats);
        assert_eq!(created.len(), 5);
        assert!(created.iter().all(|c| c.action == ActionType::Create));

        let supplemental = plan_report(&mut versions, None, &mut stats);
        assert!(supplemental.is_empty());
        assert_eq!(versions.live_count(), 5);
    }

    #[test]
    fn maps_type_fuel_and_category() {
        let mut versions = VersionedChain::new();
        let mut stats = ComponentStats::default();
        let changes = plan_report(&mut versions, Some(vec![record(1, "Acme", 10)]), &mut stats);
        let values = &changes[0].values;
        assert_eq!(values.transaction_type, "Allocated from");
        assert_eq!(values.fuel_type_id, 16);
        assert_eq!(values.fuel_category, Some(FuelCategory::Diesel));
        assert_eq!(values.units, "Litres");
        assert_eq!(stats.warnings, 0);
    }

    #[test]
    fn rows_sharing_a_group_share_a_content_key() {
        let mut versions = VersionedChain::new();
        let mut stats = ComponentStats::default();
        let first = plan_report(&mut versions, Some(vec![record(1, "Acme", 10)]), &mut stats);
        let second = plan_report(&mut versions, Some(vec![record(8, "ACME", 20)]), &mut stats);

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].group_uuid, first[0].group_uuid);
        assert_eq!(second[0].identity, first[0].identity);
        assert_eq!(second[0].action, ActionType::Update);
    }

    #[test]
    fn unknown_fuel_name_leaves_category_empty() {
        let mut versions = VersionedChain::new();
        let mut stats = ComponentStats::default();
        let mut propane = record(1, "Acme", 10);
        propane.fuel_type = "Propane".into();
        propane.fuel_type_id = 8;
        let changes = plan_report(&mut versions, Some(vec![propane]), &mut stats);
        assert_eq!(changes[0].values.fuel_category, None);
        assert_eq!(stats.warnings, 1);
    }
}
