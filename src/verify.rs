//! Post-run consistency checks over the destination schedule tables
//!
//! Reads every versioned row back and checks that each `group_uuid` has dense
//! versions starting at 0, opens with CREATE and never re-CREATEs, and that no
//! two destination reports claim the same TFRS id.

use std::collections::BTreeMap;

use lcfs_types::ActionType;
use serde::Serialize;
use sqlx::{FromRow, PgPool};

use crate::error::Result;

/// Destination tables carrying `group_uuid` / `version` / `action_type`.
pub const VERSIONED_TABLES: [&str; 4] = [
    "allocation_agreement",
    "notional_transfer",
    "other_uses",
    "fuel_supply",
];

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct VersionedRow {
    pub group_uuid: String,
    pub version: i32,
    pub action_type: ActionType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Versions of a group are not exactly `0..n`.
    VersionGap {
        table: String,
        group_uuid: String,
        versions: Vec<i32>,
    },
    /// The first version of a group is not a CREATE.
    MissingCreate { table: String, group_uuid: String },
    /// A CREATE after the first version.
    LateCreate {
        table: String,
        group_uuid: String,
        version: i32,
    },
    /// Several destination reports carry the same legacy id.
    DuplicateLegacyId {
        legacy_id: i32,
        compliance_report_ids: Vec<i32>,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub rows_checked: u64,
    pub groups_checked: u64,
    pub reports_checked: u64,
    pub violations: Vec<Violation>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Version density and action order for the rows of one table.
pub fn check_versions(table: &str, rows: &[VersionedRow], report: &mut VerifyReport) {
    let mut groups: BTreeMap<&str, Vec<&VersionedRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.group_uuid.as_str()).or_default().push(row);
    }
    report.rows_checked += rows.len() as u64;
    report.groups_checked += groups.len() as u64;

    for (group_uuid, mut group) in groups {
        group.sort_by_key(|row| row.version);

        let versions: Vec<i32> = group.iter().map(|row| row.version).collect();
        let dense = versions.iter().enumerate().all(|(i, v)| *v == i as i32);
        if !dense {
            report.violations.push(Violation::VersionGap {
                table: table.to_string(),
                group_uuid: group_uuid.to_string(),
                versions,
            });
        }

        if group.first().map(|row| row.action_type) != Some(ActionType::Create) {
            report.violations.push(Violation::MissingCreate {
                table: table.to_string(),
                group_uuid: group_uuid.to_string(),
            });
        }
        for row in group.iter().skip(1) {
            if row.action_type == ActionType::Create {
                report.violations.push(Violation::LateCreate {
                    table: table.to_string(),
                    group_uuid: group_uuid.to_string(),
                    version: row.version,
                });
            }
        }
    }
}

/// Every legacy id maps to at most one destination report.
pub fn check_legacy_ids(reports: &[(i32, i32)], report: &mut VerifyReport) {
    let mut by_legacy: BTreeMap<i32, Vec<i32>> = BTreeMap::new();
    for (compliance_report_id, legacy_id) in reports {
        by_legacy
            .entry(*legacy_id)
            .or_default()
            .push(*compliance_report_id);
    }
    report.reports_checked += reports.len() as u64;

    for (legacy_id, mut ids) in by_legacy {
        if ids.len() > 1 {
            ids.sort_unstable();
            report.violations.push(Violation::DuplicateLegacyId {
                legacy_id,
                compliance_report_ids: ids,
            });
        }
    }
}

async fn load_versioned_rows(destination: &PgPool, table: &str) -> Result<Vec<VersionedRow>> {
    let sql = format!(
        "SELECT group_uuid::text AS group_uuid, version, action_type FROM {table} \
         WHERE group_uuid IS NOT NULL"
    );
    Ok(sqlx::query_as::<_, VersionedRow>(&sql)
        .fetch_all(destination)
        .await?)
}

/// Run every check against the destination database.
pub async fn verify_destination(destination: &PgPool) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();

    for table in VERSIONED_TABLES {
        let rows = load_versioned_rows(destination, table).await?;
        tracing::debug!(table, rows = rows.len(), "Checking versions");
        check_versions(table, &rows, &mut report);
    }

    let reports: Vec<(i32, i32)> = sqlx::query_as(
        "SELECT compliance_report_id, legacy_id FROM compliance_report WHERE legacy_id IS NOT NULL",
    )
    .fetch_all(destination)
    .await?;
    check_legacy_ids(&reports, &mut report);

    if report.is_clean() {
        tracing::info!(
            groups = report.groups_checked,
            reports = report.reports_checked,
            "Destination verified"
        );
    } else {
        tracing::warn!(violations = report.violations.len(), "Destination has violations");
    }
    Ok(report)
}
