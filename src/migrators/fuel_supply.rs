//! Schedule B: fuel supply
//!
//! Records come from the report snapshot, with an optional SQL path for
//! reports that have none. Each record is recoded into LCFS terms and its
//! carbon intensity parameters are looked up in the destination reference
//! tables for the report's compliance period, falling back to what the
//! snapshot recorded when a lookup comes back empty.
//!
//! A logical record is identified by fuel type, category, provision, fuel code,
//! end use and "other" fuel name. Quantity, CI and energy changes version the
//! same record.

use std::collections::HashMap;

use async_trait::async_trait;
use lcfs_types::FuelCategory;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{FromRow, PgPool, Postgres};

use super::chain::{self, ChainMember};
use super::{record_failure, to_float, MIGRATION_USER};
use crate::db;
use crate::error::{MigrationError, Result};
use crate::legacy_map::LegacyIdMap;
use crate::reference;
use crate::runner::{MigrationContext, Migrator};
use crate::stats::ComponentStats;
use crate::summary::lines::parse_line_value;
use crate::versioning::{PlannedChange, RecordValues, VersionedChain};

pub const NAME: &str = "fuel-supply";
const TABLE: &str = "fuel_supply";
pub const SQL_FALLBACK_TABLE: &str = "compliance_report_schedule_b_record";

fn decimal_field<'de, D>(deserializer: D) -> std::result::Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    parse_line_value(&value).map_err(serde::de::Error::custom)
}

/// Snapshots store the fuel code either as its id or as the serialized row.
fn fuel_code_field<'de, D>(deserializer: D) -> std::result::Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let id = match &value {
        Value::Null => None,
        Value::Number(n) => n.as_i64(),
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Object(o) => o.get("id").and_then(Value::as_i64),
        _ => None,
    };
    match (id, &value) {
        (Some(id), _) => i32::try_from(id)
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("fuel code id out of range: {id}"))),
        (None, Value::Null) => Ok(None),
        (None, Value::String(s)) if s.trim().is_empty() => Ok(None),
        (None, other) => Err(serde::de::Error::custom(format!("unexpected fuel code {other}"))),
    }
}

/// One Schedule B record as stored in a TFRS snapshot.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SnapshotFuelRecord {
    pub fuel_type: String,
    pub fuel_class: String,
    pub provision_of_the_act: String,
    #[serde(deserialize_with = "fuel_code_field")]
    pub fuel_code: Option<i32>,
    pub fuel_type_other: Option<String>,
    pub units: String,
    #[serde(deserialize_with = "decimal_field")]
    pub quantity: Option<Decimal>,
    #[serde(deserialize_with = "decimal_field")]
    pub ci_of_fuel: Option<Decimal>,
    #[serde(deserialize_with = "decimal_field", alias = "limit")]
    pub ci_limit: Option<Decimal>,
    #[serde(deserialize_with = "decimal_field")]
    pub energy_density: Option<Decimal>,
    #[serde(deserialize_with = "decimal_field")]
    pub eer: Option<Decimal>,
    #[serde(deserialize_with = "decimal_field")]
    pub energy_content: Option<Decimal>,
    #[serde(deserialize_with = "decimal_field")]
    pub credits: Option<Decimal>,
    #[serde(deserialize_with = "decimal_field")]
    pub debits: Option<Decimal>,
}

/// `schedule_b.records` of a snapshot; `None` when the snapshot has no Schedule B.
pub fn snapshot_records(snapshot: &Value) -> Result<Option<Vec<SnapshotFuelRecord>>> {
    let Some(records) = snapshot.get("schedule_b").and_then(|b| b.get("records")) else {
        return Ok(None);
    };
    if records.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(records.clone())?))
}

/// A source fuel code split into its destination lookup parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuelCodeParts {
    pub prefix: String,
    pub suffix: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedFuelCode {
    pub fuel_code_id: i32,
    pub carbon_intensity: Option<Decimal>,
}

/// Everything the destination reference tables said about one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FuelLookups {
    pub provision_id: Option<i32>,
    pub fuel_code: Option<ResolvedFuelCode>,
    pub target_ci: Option<Decimal>,
    pub category_default_ci: Option<Decimal>,
    pub fuel_type_default_ci: Option<Decimal>,
    pub energy_density: Option<Decimal>,
    pub eer: Option<Decimal>,
    pub uci: Option<Decimal>,
}

/// Identity of a fuel supply record across versions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FuelSupplyKey {
    pub fuel_type_id: i32,
    pub fuel_category_id: i32,
    pub provision: &'static str,
    pub fuel_code: Option<FuelCodeParts>,
    pub end_use_id: Option<i32>,
    pub fuel_type_other: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuelSupplyValues {
    pub quantity: Decimal,
    pub units: &'static str,
    pub compliance_units: Decimal,
    pub target_ci: Option<Decimal>,
    pub ci_of_fuel: Option<Decimal>,
    pub energy_density: Option<Decimal>,
    pub eer: Decimal,
    pub uci: Option<Decimal>,
    pub energy_content: Decimal,
    pub provision_id: Option<i32>,
    pub fuel_code_id: Option<i32>,
}

impl RecordValues for FuelSupplyValues {
    fn changed_from(&self, previous: &Self) -> bool {
        self.quantity != previous.quantity
            || self.units != previous.units
            || self.ci_of_fuel != previous.ci_of_fuel
            || self.compliance_units != previous.compliance_units
            || self.target_ci != previous.target_ci
            || self.energy_density != previous.energy_density
            || self.eer != previous.eer
            || self.energy_content != previous.energy_content
    }
}

pub type FuelSupplyChange = PlannedChange<FuelSupplyKey, FuelSupplyValues>;

/// A record recoded into LCFS terms, before any destination lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct RecodedRecord {
    pub fuel_type_id: i32,
    pub fuel_category: FuelCategory,
    pub provision: &'static str,
    pub units: &'static str,
    pub defaults_used: Vec<&'static str>,
}

pub fn recode(record: &SnapshotFuelRecord) -> RecodedRecord {
    let mut defaults_used = Vec::new();

    let fuel_type = reference::lcfs_fuel_type_for_name(&record.fuel_type);
    if fuel_type.defaulted {
        defaults_used.push("fuel_type");
    }
    let fuel_category = match FuelCategory::from_name(&record.fuel_class) {
        Some(category) => category,
        None => {
            defaults_used.push("fuel_category");
            FuelCategory::Gasoline
        }
    };
    let provision = reference::lcfs_provision(&record.provision_of_the_act);
    if provision.defaulted {
        defaults_used.push("provision_of_the_act");
    }
    let units = reference::lcfs_units(&record.units);
    if units.defaulted {
        defaults_used.push("units");
    }

    RecodedRecord {
        fuel_type_id: fuel_type.value,
        fuel_category,
        provision: provision.value,
        units: units.value,
        defaults_used,
    }
}

const MEGAJOULES_PER_UNIT: i64 = 1_000_000;

/// Derived values for one record plus the names of the parameters that had to
/// come from the snapshot instead of the destination tables.
pub fn derive_values(
    record: &SnapshotFuelRecord,
    recoded: &RecodedRecord,
    lookups: &FuelLookups,
) -> Result<(FuelSupplyValues, Vec<&'static str>)> {
    let quantity = record
        .quantity
        .ok_or_else(|| MigrationError::InvalidData("fuel supply record without quantity".into()))?;
    let mut fallbacks = Vec::new();

    let ci_of_fuel = lookups
        .fuel_code
        .and_then(|code| code.carbon_intensity)
        .or(lookups.category_default_ci)
        .or(lookups.fuel_type_default_ci)
        .or_else(|| {
            fallbacks.push("ci_of_fuel");
            record.ci_of_fuel
        });
    let target_ci = lookups.target_ci.or_else(|| {
        fallbacks.push("target_ci");
        record.ci_limit
    });
    let energy_density = lookups.energy_density.or_else(|| {
        fallbacks.push("energy_density");
        record.energy_density
    });
    let eer = lookups
        .eer
        .or_else(|| {
            fallbacks.push("eer");
            record.eer
        })
        .unwrap_or(Decimal::ONE);

    let energy_content = match energy_density {
        Some(density) => quantity * density,
        None => record.energy_content.unwrap_or(Decimal::ZERO),
    };

    let compliance_units = match (target_ci, ci_of_fuel) {
        (Some(tci), Some(rci)) => {
            let uci = lookups.uci.unwrap_or(Decimal::ZERO);
            (tci * eer - (rci + uci)) * energy_content / Decimal::from(MEGAJOULES_PER_UNIT)
        }
        _ => {
            fallbacks.push("compliance_units");
            record.credits.unwrap_or(Decimal::ZERO) - record.debits.unwrap_or(Decimal::ZERO)
        }
    }
    .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);

    let values = FuelSupplyValues {
        quantity,
        units: recoded.units,
        compliance_units,
        target_ci,
        ci_of_fuel,
        energy_density,
        eer,
        uci: lookups.uci,
        energy_content,
        provision_id: lookups.provision_id,
        fuel_code_id: lookups.fuel_code.map(|code| code.fuel_code_id),
    };
    Ok((values, fallbacks))
}

pub fn content_key(
    record: &SnapshotFuelRecord,
    recoded: &RecodedRecord,
    fuel_code: Option<FuelCodeParts>,
) -> FuelSupplyKey {
    FuelSupplyKey {
        fuel_type_id: recoded.fuel_type_id,
        fuel_category_id: recoded.fuel_category.id(),
        provision: recoded.provision,
        fuel_code,
        end_use_id: None,
        fuel_type_other: record
            .fuel_type_other
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
}

/// A report record together with the outcome of its destination lookups.
#[derive(Debug)]
pub struct PreparedRecord {
    pub record: SnapshotFuelRecord,
    pub recoded: RecodedRecord,
    pub lookups: Result<(FuelLookups, Option<FuelCodeParts>)>,
}

/// Records present in a report that produced no values.
#[derive(Debug, Default)]
struct SkippedRecords {
    keys: Vec<FuelSupplyKey>,
    /// Set when a record failed before its key was known
    unkeyed: bool,
}

impl SkippedRecords {
    fn covers(&self, key: &FuelSupplyKey) -> bool {
        self.unkeyed || self.keys.contains(key)
    }
}

/// Diff one report's records against the chain.
///
/// Unreadable records are skipped but keep their previous version: they are
/// never planned as DELETE.
pub fn plan_report(
    versions: &mut VersionedChain<FuelSupplyKey, FuelSupplyValues>,
    records: Option<Vec<PreparedRecord>>,
    legacy_id: i32,
    stats: &mut ComponentStats,
) -> Vec<FuelSupplyChange> {
    let Some(records) = records else {
        return Vec::new();
    };

    let mut keyed = Vec::with_capacity(records.len());
    let mut skipped = SkippedRecords::default();
    for prepared in records {
        let PreparedRecord {
            record,
            recoded,
            lookups,
        } = prepared;
        for field in &recoded.defaults_used {
            stats.warnings += 1;
            tracing::warn!(legacy_id, field, "Unmapped value, using default");
        }
        let (lookups, code_parts) = match lookups {
            Ok(found) => found,
            Err(e) => {
                skipped.unkeyed = true;
                record_failure(stats, "fuel supply lookup", legacy_id, &e);
                continue;
            }
        };
        if record.fuel_code.is_some() && lookups.fuel_code.is_none() {
            stats.warnings += 1;
            tracing::warn!(
                legacy_id,
                fuel_code = ?record.fuel_code,
                "Fuel code not resolvable in destination"
            );
        }

        let key = content_key(&record, &recoded, code_parts);
        match derive_values(&record, &recoded, &lookups) {
            Ok((values, fallbacks)) => {
                for parameter in fallbacks {
                    stats.warnings += 1;
                    tracing::warn!(legacy_id, parameter, "Destination lookup empty, using snapshot value");
                }
                keyed.push((key, values));
            }
            Err(e) => {
                stats.parse_errors += 1;
                tracing::warn!(legacy_id, error = %e, "Skipping record");
                skipped.keys.push(key);
            }
        }
    }

    versions.apply_retaining(Some(keyed), |key| skipped.covers(key))
}

/// Destination reference lookups, memoized for the run.
struct ReferenceTables<'a> {
    source: &'a PgPool,
    destination: &'a PgPool,
    provisions: HashMap<String, i32>,
    fuel_type_ci: HashMap<i32, Decimal>,
    category_ci: HashMap<i32, Decimal>,
    source_codes: HashMap<i32, Option<FuelCodeParts>>,
    destination_codes: HashMap<FuelCodeParts, Option<ResolvedFuelCode>>,
    target_ci: HashMap<(i32, i32), Option<Decimal>>,
    energy_density: HashMap<(i32, i32), Option<Decimal>>,
    eer: HashMap<(i32, i32, i32), Option<Decimal>>,
    uci: HashMap<(i32, i32), Option<Decimal>>,
}

impl<'a> ReferenceTables<'a> {
    async fn load(source: &'a PgPool, destination: &'a PgPool) -> Result<Self> {
        let provisions: Vec<(i32, String)> =
            sqlx::query_as("SELECT provision_of_the_act_id, name FROM provision_of_the_act")
                .fetch_all(destination)
                .await?;
        let fuel_types: Vec<(i32, Option<Decimal>)> = sqlx::query_as(
            "SELECT fuel_type_id, default_carbon_intensity::numeric FROM fuel_type",
        )
        .fetch_all(destination)
        .await?;
        let categories: Vec<(i32, Option<Decimal>)> = sqlx::query_as(
            "SELECT fuel_category_id, default_carbon_intensity::numeric FROM fuel_category",
        )
        .fetch_all(destination)
        .await?;

        let known = |rows: Vec<(i32, Option<Decimal>)>| -> HashMap<i32, Decimal> {
            rows.into_iter()
                .filter_map(|(id, ci)| ci.map(|ci| (id, ci)))
                .collect()
        };

        Ok(Self {
            source,
            destination,
            provisions: provisions.into_iter().map(|(id, name)| (name, id)).collect(),
            fuel_type_ci: known(fuel_types),
            category_ci: known(categories),
            source_codes: HashMap::new(),
            destination_codes: HashMap::new(),
            target_ci: HashMap::new(),
            energy_density: HashMap::new(),
            eer: HashMap::new(),
            uci: HashMap::new(),
        })
    }

    /// Source fuel code id to its prefix and `major.minor` suffix. Deleted
    /// codes (status 3) resolve to nothing.
    async fn source_code(&mut self, fuel_code_id: i32) -> Result<Option<FuelCodeParts>> {
        if let Some(parts) = self.source_codes.get(&fuel_code_id) {
            return Ok(parts.clone());
        }
        let row: Option<(String, i32, i32)> = sqlx::query_as(
            r#"
            SELECT fuel_code, fuel_code_version, fuel_code_version_minor
            FROM fuel_code
            WHERE id = $1 AND status_id != 3
            "#,
        )
        .bind(fuel_code_id)
        .fetch_optional(self.source)
        .await?;
        let parts = row.map(|(prefix, major, minor)| FuelCodeParts {
            prefix: prefix.trim().to_string(),
            suffix: format!("{major}.{minor}"),
        });
        self.source_codes.insert(fuel_code_id, parts.clone());
        Ok(parts)
    }

    async fn destination_code(&mut self, parts: &FuelCodeParts) -> Result<Option<ResolvedFuelCode>> {
        if let Some(resolved) = self.destination_codes.get(parts) {
            return Ok(*resolved);
        }
        let row: Option<(i32, Option<Decimal>)> = sqlx::query_as(
            r#"
            SELECT fc.fuel_code_id, fc.carbon_intensity::numeric
            FROM fuel_code fc
            JOIN fuel_code_prefix p ON p.fuel_code_prefix_id = fc.prefix_id
            WHERE p.prefix = $1 AND fc.fuel_suffix = $2
            ORDER BY fc.fuel_code_id DESC
            LIMIT 1
            "#,
        )
        .bind(&parts.prefix)
        .bind(&parts.suffix)
        .fetch_optional(self.destination)
        .await?;
        let resolved = row.map(|(fuel_code_id, carbon_intensity)| ResolvedFuelCode {
            fuel_code_id,
            carbon_intensity,
        });
        self.destination_codes.insert(parts.clone(), resolved);
        Ok(resolved)
    }

    async fn target_ci(&mut self, category_id: i32, period_id: i32) -> Result<Option<Decimal>> {
        if let Some(value) = self.target_ci.get(&(category_id, period_id)) {
            return Ok(*value);
        }
        let value: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT target_carbon_intensity::numeric
            FROM target_carbon_intensity
            WHERE fuel_category_id = $1 AND compliance_period_id = $2
            LIMIT 1
            "#,
        )
        .bind(category_id)
        .bind(period_id)
        .fetch_optional(self.destination)
        .await?
        .flatten();
        self.target_ci.insert((category_id, period_id), value);
        Ok(value)
    }

    /// Latest density defined at or before the period.
    async fn energy_density(&mut self, fuel_type_id: i32, period_id: i32) -> Result<Option<Decimal>> {
        if let Some(value) = self.energy_density.get(&(fuel_type_id, period_id)) {
            return Ok(*value);
        }
        let value: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT ed.density::numeric
            FROM energy_density ed
            JOIN compliance_period cp ON cp.compliance_period_id = ed.compliance_period_id
            WHERE ed.fuel_type_id = $1
              AND cp.display_order <= (
                  SELECT display_order FROM compliance_period WHERE compliance_period_id = $2
              )
            ORDER BY cp.display_order DESC
            LIMIT 1
            "#,
        )
        .bind(fuel_type_id)
        .bind(period_id)
        .fetch_optional(self.destination)
        .await?
        .flatten();
        self.energy_density.insert((fuel_type_id, period_id), value);
        Ok(value)
    }

    async fn eer(&mut self, fuel_type_id: i32, category_id: i32, period_id: i32) -> Result<Option<Decimal>> {
        let key = (fuel_type_id, category_id, period_id);
        if let Some(value) = self.eer.get(&key) {
            return Ok(*value);
        }
        let value: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT ratio::numeric
            FROM energy_effectiveness_ratio
            WHERE fuel_type_id = $1
              AND fuel_category_id = $2
              AND compliance_period_id = $3
              AND end_use_type_id IS NULL
            LIMIT 1
            "#,
        )
        .bind(fuel_type_id)
        .bind(category_id)
        .bind(period_id)
        .fetch_optional(self.destination)
        .await?
        .flatten();
        self.eer.insert(key, value);
        Ok(value)
    }

    async fn uci(&mut self, fuel_type_id: i32, period_id: i32) -> Result<Option<Decimal>> {
        if let Some(value) = self.uci.get(&(fuel_type_id, period_id)) {
            return Ok(*value);
        }
        let value: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT intensity::numeric
            FROM additional_carbon_intensity
            WHERE fuel_type_id = $1
              AND end_use_type_id IS NULL
              AND compliance_period_id = $2
            LIMIT 1
            "#,
        )
        .bind(fuel_type_id)
        .bind(period_id)
        .fetch_optional(self.destination)
        .await?
        .flatten();
        self.uci.insert((fuel_type_id, period_id), value);
        Ok(value)
    }

    async fn lookups(
        &mut self,
        record: &SnapshotFuelRecord,
        recoded: &RecodedRecord,
        period_id: i32,
    ) -> Result<(FuelLookups, Option<FuelCodeParts>)> {
        let parts = match record.fuel_code {
            Some(id) => self.source_code(id).await?,
            None => None,
        };
        let fuel_code = match &parts {
            Some(parts) => self.destination_code(parts).await?,
            None => None,
        };
        let category_id = recoded.fuel_category.id();

        let lookups = FuelLookups {
            provision_id: self.provisions.get(recoded.provision).copied(),
            fuel_code,
            target_ci: self.target_ci(category_id, period_id).await?,
            category_default_ci: self.category_ci.get(&category_id).copied(),
            fuel_type_default_ci: self.fuel_type_ci.get(&recoded.fuel_type_id).copied(),
            energy_density: self.energy_density(recoded.fuel_type_id, period_id).await?,
            eer: self.eer(recoded.fuel_type_id, category_id, period_id).await?,
            uci: self.uci(recoded.fuel_type_id, period_id).await?,
        };
        Ok((lookups, parts))
    }
}

#[derive(Debug, Clone, FromRow)]
struct SqlFuelRow {
    fuel_type: String,
    fuel_class: String,
    provision_of_the_act: Option<String>,
    fuel_code_id: Option<i32>,
    quantity: Option<Decimal>,
    units: Option<String>,
}

impl From<SqlFuelRow> for SnapshotFuelRecord {
    fn from(row: SqlFuelRow) -> Self {
        Self {
            fuel_type: row.fuel_type,
            fuel_class: row.fuel_class,
            provision_of_the_act: row.provision_of_the_act.unwrap_or_default(),
            fuel_code: row.fuel_code_id,
            units: row.units.unwrap_or_default(),
            quantity: row.quantity,
            ..Default::default()
        }
    }
}

async fn load_sql_records(source: &PgPool, schedule_id: i32) -> Result<Vec<SnapshotFuelRecord>> {
    let rows = sqlx::query_as::<_, SqlFuelRow>(
        r#"
        SELECT aft.name AS fuel_type, fc.fuel_class, pa.provision AS provision_of_the_act,
               r.fuel_code_id, r.quantity::numeric AS quantity, uom.name AS units
        FROM compliance_report_schedule_b_record r
        JOIN approved_fuel_type aft ON aft.id = r.fuel_type_id
        JOIN fuel_class fc ON fc.id = r.fuel_class_id
        LEFT JOIN provision_act pa ON pa.id = r.provision_of_the_act_id
        LEFT JOIN unit_of_measure uom ON uom.id = aft.unit_of_measure_id
        WHERE r.schedule_id = $1
        ORDER BY r.id
        "#,
    )
    .bind(schedule_id)
    .fetch_all(source)
    .await?;
    Ok(rows.into_iter().map(SnapshotFuelRecord::from).collect())
}

fn insert_query(
    compliance_report_id: i32,
    key: &FuelSupplyKey,
    change: &FuelSupplyChange,
) -> Query<'static, Postgres, PgArguments> {
    let values = &change.values;
    sqlx::query(
        r#"
        INSERT INTO fuel_supply (
            compliance_report_id, fuel_category_id, fuel_type_id, provision_of_the_act_id,
            fuel_code_id, end_use_id, fuel_type_other, quantity, units, compliance_units,
            target_ci, ci_of_fuel, energy_density, eer, uci, energy,
            group_uuid, version, action_type, create_user, update_user
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::quantityunitsenum, $10,
                  $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $20)
        "#,
    )
    .bind(compliance_report_id)
    .bind(key.fuel_category_id)
    .bind(key.fuel_type_id)
    .bind(values.provision_id)
    .bind(values.fuel_code_id)
    .bind(key.end_use_id)
    .bind(key.fuel_type_other.clone())
    .bind(to_float(values.quantity))
    .bind(values.units)
    .bind(to_float(values.compliance_units))
    .bind(values.target_ci.map(to_float))
    .bind(values.ci_of_fuel.map(to_float))
    .bind(values.energy_density.map(to_float))
    .bind(to_float(values.eer))
    .bind(values.uci.map(to_float))
    .bind(to_float(values.energy_content))
    .bind(change.group_uuid.to_string())
    .bind(change.version)
    .bind(change.action)
    .bind(MIGRATION_USER)
}

/// Where a report's Schedule B records come from.
enum RecordSource {
    Snapshot(Vec<SnapshotFuelRecord>),
    Sql(Vec<SnapshotFuelRecord>),
    Missing,
}

#[derive(Debug, Default)]
pub struct FuelSupplyMigrator {
    /// Live logical records per source chain root
    logical_records: HashMap<i32, VersionedChain<FuelSupplyKey, FuelSupplyValues>>,
    sql_fallback: bool,
}

impl FuelSupplyMigrator {
    pub fn new() -> Self {
        Self::default()
    }

    async fn report_records(
        &self,
        source: &PgPool,
        member: &ChainMember,
        stats: &mut ComponentStats,
    ) -> Result<Option<RecordSource>> {
        let raw: Option<Option<String>> = sqlx::query_scalar(
            "SELECT snapshot::text FROM compliance_report_snapshot WHERE compliance_report_id = $1",
        )
        .bind(member.source.id)
        .fetch_optional(source)
        .await?;

        if let Some(raw) = raw.flatten() {
            let parsed = serde_json::from_str::<Value>(&raw)
                .map_err(MigrationError::from)
                .and_then(|snapshot| snapshot_records(&snapshot));
            return match parsed {
                Ok(Some(records)) => Ok(Some(RecordSource::Snapshot(records))),
                Ok(None) => Ok(Some(RecordSource::Missing)),
                Err(e) => {
                    stats.parse_errors += 1;
                    tracing::warn!(legacy_id = member.source.id, error = %e, "Unreadable Schedule B snapshot");
                    Ok(None)
                }
            };
        }

        match (self.sql_fallback, member.source.schedule_b_id) {
            (true, Some(schedule_id)) => match load_sql_records(source, schedule_id).await {
                Ok(records) => Ok(Some(RecordSource::Sql(records))),
                Err(e) => {
                    record_failure(stats, "Schedule B SQL records", member.source.id, &e);
                    Ok(None)
                }
            },
            _ => {
                tracing::warn!(legacy_id = member.source.id, "Report has no snapshot; Schedule B not migrated");
                Ok(Some(RecordSource::Missing))
            }
        }
    }
}

#[async_trait]
impl Migrator for FuelSupplyMigrator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn required_source_tables(&self) -> &'static [&'static str] {
        &["compliance_report", "compliance_report_snapshot", "fuel_code"]
    }

    async fn run(&mut self, ctx: &MigrationContext) -> Result<ComponentStats> {
        let mut stats = ComponentStats::default();
        self.logical_records.clear();
        self.sql_fallback = ctx.options.fuel_supply_sql_fallback;
        if self.sql_fallback && !db::table_exists(ctx.source(), SQL_FALLBACK_TABLE).await? {
            tracing::warn!(
                table = SQL_FALLBACK_TABLE,
                "Schedule B SQL fallback requested but the table is missing; disabled"
            );
            self.sql_fallback = false;
        }

        let legacy = LegacyIdMap::load(ctx.destination()).await?;
        let reports = chain::load_source_reports(ctx.source()).await?;
        let walk = chain::build_chains(&reports, &legacy);
        stats.skipped += walk.unmapped;

        let existing = chain::reports_with_rows(ctx.destination(), TABLE).await?;
        let mut reference = ReferenceTables::load(ctx.source(), ctx.destination()).await?;

        for source_chain in &walk.chains {
            stats.found += 1;
            if chain::already_migrated(source_chain, &existing) {
                stats.skipped += 1;
                continue;
            }

            for member in &source_chain.members {
                let records = match self.report_records(ctx.source(), member, &mut stats).await? {
                    Some(RecordSource::Snapshot(records)) => Some(records),
                    Some(RecordSource::Sql(records)) => {
                        tracing::info!(
                            legacy_id = member.source.id,
                            records = records.len(),
                            "Schedule B read through SQL fallback"
                        );
                        Some(records)
                    }
                    Some(RecordSource::Missing) | None => None,
                };
                let period_id = member.destination.compliance_period_id;

                let prepared = match records {
                    Some(records) => {
                        let mut prepared = Vec::with_capacity(records.len());
                        for record in records {
                            let recoded = recode(&record);
                            let lookups = reference.lookups(&record, &recoded, period_id).await;
                            prepared.push(PreparedRecord {
                                record,
                                recoded,
                                lookups,
                            });
                        }
                        Some(prepared)
                    }
                    None => None,
                };

                let versions = self.logical_records.entry(source_chain.root_id).or_default();
                let changes = plan_report(versions, prepared, member.source.id, &mut stats);
                if changes.is_empty() {
                    continue;
                }

                let report_id = member.destination.compliance_report_id;
                let mut tx = ctx.destination().begin().await?;
                for change in &changes {
                    let query = insert_query(report_id, &change.identity.key, change);
                    match db::execute_in_savepoint(&mut tx, query).await {
                        Ok(rows) => stats.rows_written += rows,
                        Err(e) => record_failure(&mut stats, "fuel supply", report_id, &e),
                    }
                }
                db::finish(tx, ctx.dry_run()).await?;
            }
            stats.processed += 1;
        }

        Ok(stats)
    }
}
