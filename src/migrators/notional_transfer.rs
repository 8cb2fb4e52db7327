//! Schedule A: notional transfers of renewable fuel obligation
//!
//! Each source chain is walked in traversal order and every report's Schedule A
//! records are diffed against the chain's live state. A record is the same
//! logical transfer while its partner, address, fuel class and direction stay
//! the same; a quantity change is a new version of it.

use async_trait::async_trait;
use lcfs_types::{ActionType, FuelCategory, ReceivedOrTransferred};
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

pub const NAME: &str = "notional-transfers";
const TABLE: &str = "notional_transfer";

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ScheduleARecord {
    pub id: i32,
    pub trading_partner: String,
    pub postal_address: Option<String>,
    pub quantity: Decimal,
    pub fuel_class_id: i32,
    pub transfer_type_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NotionalKey {
    pub trading_partner: String,
    pub postal_address: String,
    pub fuel_class_id: i32,
    pub transfer_type_id: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotionalValues {
    pub legal_name: String,
    pub address_for_service: String,
    pub quantity: Decimal,
    pub fuel_category: FuelCategory,
    pub direction: ReceivedOrTransferred,
}

impl RecordValues for NotionalValues {
    fn changed_from(&self, previous: &Self) -> bool {
        self.quantity != previous.quantity
    }
}

pub type NotionalChange = PlannedChange<NotionalKey, NotionalValues>;

fn to_keyed(record: ScheduleARecord, stats: &mut ComponentStats) -> (NotionalKey, NotionalValues) {
    let category = reference::fuel_category_for_class(record.fuel_class_id);
    if category.defaulted {
        stats.warnings += 1;
        tracing::warn!(
            record_id = record.id,
            fuel_class_id = record.fuel_class_id,
            "Unmapped fuel class, using {}",
            category.value
        );
    }
    let direction = reference::transfer_direction(record.transfer_type_id);
    if direction.defaulted {
        stats.warnings += 1;
        tracing::warn!(
            record_id = record.id,
            transfer_type_id = record.transfer_type_id,
            "Unmapped transfer type, using {}",
            direction.value
        );
    }

    let address = record.postal_address.unwrap_or_default();
    let key = NotionalKey {
        trading_partner: normalize(&record.trading_partner),
        postal_address: normalize(&address),
        fuel_class_id: record.fuel_class_id,
        transfer_type_id: record.transfer_type_id,
    };
    let values = NotionalValues {
        legal_name: record.trading_partner,
        address_for_service: address,
        quantity: record.quantity,
        fuel_category: category.value,
        direction: direction.value,
    };
    (key, values)
}

/// Diff one report's Schedule A (or its absence) against the chain.
pub fn plan_report(
    versions: &mut VersionedChain<NotionalKey, NotionalValues>,
    records: Option<Vec<ScheduleARecord>>,
    stats: &mut ComponentStats,
) -> Vec<NotionalChange> {
    let current = records.map(|rows| {
        rows.into_iter()
            .map(|record| to_keyed(record, stats))
            .collect::<Vec<_>>()
    });
    versions.apply(current)
}

async fn load_records(source: &PgPool, schedule_id: i32) -> Result<Vec<ScheduleARecord>> {
    let rows = sqlx::query_as::<_, ScheduleARecord>(
        r#"
        SELECT id, trading_partner, postal_address, quantity::numeric AS quantity,
               fuel_class_id, transfer_type_id
        FROM compliance_report_schedule_a_record
        WHERE schedule_id = $1
        ORDER BY id
        "#,
    )
    .bind(schedule_id)
    .fetch_all(source)
    .await?;
    Ok(rows)
}

fn insert_query(
    compliance_report_id: i32,
    change: &NotionalChange,
) -> Query<'static, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO notional_transfer (
            compliance_report_id, legal_name, address_for_service, fuel_category_id,
            received_or_transferred, quantity, group_uuid, version, action_type,
            create_user, update_user
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
        "#,
    )
    .bind(compliance_report_id)
    .bind(change.values.legal_name.clone())
    .bind(change.values.address_for_service.clone())
    .bind(change.values.fuel_category.id())
    .bind(change.values.direction)
    .bind(to_float(change.values.quantity))
    .bind(change.group_uuid.to_string())
    .bind(change.version)
    .bind(change.action)
    .bind(MIGRATION_USER)
}

#[derive(Debug, Default)]
pub struct NotionalTransferMigrator;

impl NotionalTransferMigrator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Migrator for NotionalTransferMigrator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn required_source_tables(&self) -> &'static [&'static str] {
        &["compliance_report", "compliance_report_schedule_a_record"]
    }

    async fn run(&mut self, ctx: &MigrationContext) -> Result<ComponentStats> {
        let mut stats = ComponentStats::default();
        let legacy = LegacyIdMap::load(ctx.destination()).await?;
        let reports = chain::load_source_reports(ctx.source()).await?;
        let walk = chain::build_chains(&reports, &legacy);
        stats.skipped += walk.unmapped;

        let existing = chain::reports_with_rows(ctx.destination(), TABLE).await?;
        let mut tx = ctx.destination().begin().await?;

        for source_chain in &walk.chains {
            stats.found += 1;
            if chain::already_migrated(source_chain, &existing) {
                tracing::debug!(root_id = source_chain.root_id, "Chain already migrated");
                stats.skipped += 1;
                continue;
            }

            let mut versions = VersionedChain::new();
            for member in &source_chain.members {
                let records = match member.source.schedule_a_id {
                    Some(schedule_id) => Some(load_records(ctx.source(), schedule_id).await?),
                    None => None,
                };
                let report_id = member.destination.compliance_report_id;
                for change in plan_report(&mut versions, records, &mut stats) {
                    match db::execute_in_savepoint(&mut tx, insert_query(report_id, &change)).await {
                        Ok(rows) => stats.rows_written += rows,
                        Err(e) => record_failure(&mut stats, "notional transfer", report_id, &e),
                    }
                    if change.action == ActionType::Delete {
                        tracing::debug!(report_id, group_uuid = %change.group_uuid, "Record removed");
                    }
                }
            }
            stats.processed += 1;
        }

        db::finish(tx, ctx.dry_run()).await?;
        Ok(stats)
    }
}
