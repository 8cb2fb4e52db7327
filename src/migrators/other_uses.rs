//! Schedule C: fuel supplied for uses outside the renewable requirement.
//!
//! Walked chain by chain like Schedule A. Fuel type and expected use are
//! recoded through the static TFRS -> LCFS tables; the carbon intensity is the
//! destination fuel type's default and the provision is always "default CI".

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

pub const NAME: &str = "other-uses";
const TABLE: &str = "other_uses";

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ScheduleCRecord {
    pub id: i32,
    pub fuel_type_id: i32,
    pub fuel_class_id: i32,
    pub expected_use_id: i32,
    pub rationale: Option<String>,
    pub quantity: Decimal,
    pub unit_of_measure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OtherUseKey {
    pub fuel_type_id: i32,
    pub fuel_class_id: i32,
    pub expected_use_id: i32,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OtherUseValues {
    pub quantity: Decimal,
    pub units: &'static str,
    pub fuel_type_id: i32,
    pub fuel_category: FuelCategory,
    pub expected_use_id: i32,
    pub rationale: Option<String>,
}

impl RecordValues for OtherUseValues {
    fn changed_from(&self, previous: &Self) -> bool {
        self.quantity != previous.quantity || self.units != previous.units
    }
}

pub type OtherUseChange = PlannedChange<OtherUseKey, OtherUseValues>;

fn to_keyed(record: ScheduleCRecord, stats: &mut ComponentStats) -> (OtherUseKey, OtherUseValues) {
    let mut warn = |field: &str, code: &str| {
        stats.warnings += 1;
        tracing::warn!(record_id = record.id, field, code, "Unmapped code, using default");
    };

    let fuel_type = reference::lcfs_fuel_type_id(record.fuel_type_id);
    if fuel_type.defaulted {
        warn("fuel_type_id", &record.fuel_type_id.to_string());
    }
    let category = reference::fuel_category_for_class(record.fuel_class_id);
    if category.defaulted {
        warn("fuel_class_id", &record.fuel_class_id.to_string());
    }
    let expected_use = reference::lcfs_expected_use_id(record.expected_use_id);
    if expected_use.defaulted {
        warn("expected_use_id", &record.expected_use_id.to_string());
    }
    let units = reference::lcfs_units(record.unit_of_measure.as_deref().unwrap_or_default());
    if units.defaulted {
        warn("unit_of_measure", record.unit_of_measure.as_deref().unwrap_or("none"));
    }

    let key = OtherUseKey {
        fuel_type_id: record.fuel_type_id,
        fuel_class_id: record.fuel_class_id,
        expected_use_id: record.expected_use_id,
        rationale: normalize(record.rationale.as_deref().unwrap_or_default()),
    };
    let values = OtherUseValues {
        quantity: record.quantity,
        units: units.value,
        fuel_type_id: fuel_type.value,
        fuel_category: category.value,
        expected_use_id: expected_use.value,
        rationale: record.rationale,
    };
    (key, values)
}

pub fn plan_report(
    versions: &mut VersionedChain<OtherUseKey, OtherUseValues>,
    records: Option<Vec<ScheduleCRecord>>,
    stats: &mut ComponentStats,
) -> Vec<OtherUseChange> {
    let current = records.map(|rows| {
        rows.into_iter()
            .map(|record| to_keyed(record, stats))
            .collect::<Vec<_>>()
    });
    versions.apply(current)
}

async fn load_records(source: &PgPool, schedule_id: i32) -> Result<Vec<ScheduleCRecord>> {
    let rows = sqlx::query_as::<_, ScheduleCRecord>(
        r#"
        SELECT r.id, r.fuel_type_id, r.fuel_class_id, r.expected_use_id, r.rationale,
               r.quantity::numeric AS quantity, uom.name AS unit_of_measure
        FROM compliance_report_schedule_c_record r
        JOIN approved_fuel_type aft ON aft.id = r.fuel_type_id
        LEFT JOIN unit_of_measure uom ON uom.id = aft.unit_of_measure_id
        WHERE r.schedule_id = $1
        ORDER BY r.id
        "#,
    )
    .bind(schedule_id)
    .fetch_all(source)
    .await?;
    Ok(rows)
}

/// Destination lookups done once per run.
#[derive(Debug, Clone, Default)]
struct Destination {
    default_ci: HashMap<i32, Decimal>,
    provision_id: Option<i32>,
}

impl Destination {
    async fn load(destination: &PgPool) -> Result<Self> {
        let rows: Vec<(i32, Option<Decimal>)> = sqlx::query_as(
            "SELECT fuel_type_id, default_carbon_intensity::numeric FROM fuel_type",
        )
        .fetch_all(destination)
        .await?;
        let default_ci = rows
            .into_iter()
            .filter_map(|(id, ci)| ci.map(|ci| (id, ci)))
            .collect();

        let provision_id: Option<i32> = sqlx::query_scalar(
            "SELECT provision_of_the_act_id FROM provision_of_the_act WHERE name = $1",
        )
        .bind(reference::PROVISION_DEFAULT_CI)
        .fetch_optional(destination)
        .await?;
        if provision_id.is_none() {
            tracing::warn!(
                provision = reference::PROVISION_DEFAULT_CI,
                "Provision not found in destination; other uses rows get none"
            );
        }

        Ok(Self {
            default_ci,
            provision_id,
        })
    }
}

fn insert_query(
    compliance_report_id: i32,
    change: &OtherUseChange,
    destination: &Destination,
) -> Query<'static, Postgres, PgArguments> {
    let ci_of_fuel = destination
        .default_ci
        .get(&change.values.fuel_type_id)
        .copied()
        .map(to_float);
    sqlx::query(
        r#"
        INSERT INTO other_uses (
            compliance_report_id, fuel_type_id, fuel_category_id, provision_of_the_act_id,
            ci_of_fuel, quantity_supplied, units, expected_use_id, rationale,
            group_uuid, version, action_type, create_user, update_user
        ) VALUES ($1, $2, $3, $4, $5, $6, $7::quantityunitsenum, $8, $9, $10, $11, $12, $13, $13)
        "#,
    )
    .bind(compliance_report_id)
    .bind(change.values.fuel_type_id)
    .bind(change.values.fuel_category.id())
    .bind(destination.provision_id)
    .bind(ci_of_fuel)
    .bind(to_float(change.values.quantity))
    .bind(change.values.units)
    .bind(change.values.expected_use_id)
    .bind(change.values.rationale.clone())
    .bind(change.group_uuid.to_string())
    .bind(change.version)
    .bind(change.action)
    .bind(MIGRATION_USER)
}

#[derive(Debug, Default)]
pub struct OtherUsesMigrator;

impl OtherUsesMigrator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Migrator for OtherUsesMigrator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn required_source_tables(&self) -> &'static [&'static str] {
        &[
            "compliance_report",
            "compliance_report_schedule_c_record",
            "approved_fuel_type",
            "unit_of_measure",
        ]
    }

    async fn run(&mut self, ctx: &MigrationContext) -> Result<ComponentStats> {
        let mut stats = ComponentStats::default();
        let legacy = LegacyIdMap::load(ctx.destination()).await?;
        let reports = chain::load_source_reports(ctx.source()).await?;
        let walk = chain::build_chains(&reports, &legacy);
        stats.skipped += walk.unmapped;

        let destination = Destination::load(ctx.destination()).await?;
        let existing = chain::reports_with_rows(ctx.destination(), TABLE).await?;
        let mut tx = ctx.destination().begin().await?;

        for source_chain in &walk.chains {
            stats.found += 1;
            if chain::already_migrated(source_chain, &existing) {
                stats.skipped += 1;
                continue;
            }

            let mut versions = VersionedChain::new();
            for member in &source_chain.members {
                let records = match member.source.schedule_c_id {
                    Some(schedule_id) => Some(load_records(ctx.source(), schedule_id).await?),
                    None => None,
                };
                let report_id = member.destination.compliance_report_id;
                for change in plan_report(&mut versions, records, &mut stats) {
                    let query = insert_query(report_id, &change, &destination);
                    match db::execute_in_savepoint(&mut tx, query).await {
                        Ok(rows) => stats.rows_written += rows,
                        Err(e) => record_failure(&mut stats, "other use", report_id, &e),
                    }
                }
            }
            stats.processed += 1;
        }

        db::finish(tx, ctx.dry_run()).await?;
        Ok(stats)
    }
}
