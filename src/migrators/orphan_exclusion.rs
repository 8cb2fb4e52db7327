//! Orphan exclusion reports
//!
//! Some TFRS organizations only ever filed an exclusion report for a period,
//! with no main compliance report beside it. Those reports never reached the
//! destination, so this component creates a minimal destination report for
//! each one (plus a zeroed summary and an organization snapshot) and attaches
//! its allocation agreements. Orphans of one source chain share a group uuid.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use lcfs_types::{ComplianceReportStatus, ReportingFrequency};
use sqlx::{Connection, FromRow, PgConnection, PgPool};
use uuid::Uuid;

use super::allocation_agreement::{self, AllocationChange, AllocationWriter, ExclusionRecord};
use super::report_history::load_status_ids;
use super::{record_failure, MIGRATION_USER};
use crate::db;
use crate::error::{MigrationError, Result};
use crate::legacy_map::LegacyIdMap;
use crate::reference;
use crate::runner::{MigrationContext, Migrator};
use crate::stats::ComponentStats;
use crate::summary::SummaryRecord;
use crate::versioning::VersionedChain;

pub const NAME: &str = "orphan-exclusions";

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct OrphanReport {
    pub id: i32,
    pub root_report_id: Option<i32>,
    pub traversal: i32,
    pub organization_id: i32,
    pub organization_name: String,
    pub period_description: String,
    pub exclusion_agreement_id: i32,
    pub director_status: Option<String>,
}

impl OrphanReport {
    fn root_id(&self) -> i32 {
        self.root_report_id.unwrap_or(self.id)
    }
}

/// Orphans grouped by source chain, each chain in traversal order.
pub fn group_by_chain(orphans: Vec<OrphanReport>) -> Vec<Vec<OrphanReport>> {
    let mut chains: BTreeMap<i32, Vec<OrphanReport>> = BTreeMap::new();
    for orphan in orphans {
        chains.entry(orphan.root_id()).or_default().push(orphan);
    }
    chains
        .into_values()
        .map(|mut chain| {
            chain.sort_by_key(|r| (r.traversal, r.id));
            chain
        })
        .collect()
}

/// One destination report to create.
#[derive(Debug, Clone)]
pub struct PlannedReport {
    pub source: OrphanReport,
    pub version: i32,
    pub status: ComplianceReportStatus,
    pub allocations: Vec<AllocationChange>,
}

impl PlannedReport {
    pub fn nickname(&self) -> String {
        if self.version == 0 {
            "Original Report".to_string()
        } else {
            format!("Supplemental report {}", self.version)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainPlan {
    pub group_uuid: Uuid,
    pub reports: Vec<PlannedReport>,
}

/// Versions, statuses and allocation rows for one orphan chain.
pub fn plan_chain(
    members: Vec<(OrphanReport, Vec<ExclusionRecord>)>,
    stats: &mut ComponentStats,
) -> ChainPlan {
    let mut versions = VersionedChain::new();
    let reports = members
        .into_iter()
        .enumerate()
        .map(|(version, (source, records))| {
            let allocations = allocation_agreement::plan_report(&mut versions, Some(records), stats);
            PlannedReport {
                status: reference::status_from_director(source.director_status.as_deref()),
                version: version as i32,
                source,
                allocations,
            }
        })
        .collect();
    ChainPlan {
        group_uuid: Uuid::new_v4(),
        reports,
    }
}

/// Address lines joined the way the organization snapshot stores them.
pub fn format_address(parts: &[Option<String>]) -> String {
    parts
        .iter()
        .flatten()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, FromRow)]
struct DestinationOrganization {
    organization_id: i32,
    name: String,
    operating_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
struct SourceAddress {
    address_line_1: Option<String>,
    address_line_2: Option<String>,
    address_line_3: Option<String>,
    city: Option<String>,
    state: Option<String>,
    postal_code: Option<String>,
    country: Option<String>,
}

impl SourceAddress {
    fn formatted(self) -> String {
        format_address(&[
            self.address_line_1,
            self.address_line_2,
            self.address_line_3,
            self.city,
            self.state,
            self.postal_code,
            self.country,
        ])
    }
}

async fn load_orphans(source: &PgPool) -> Result<Vec<OrphanReport>> {
    let rows = sqlx::query_as::<_, OrphanReport>(
        r#"
        SELECT cr.id, cr.root_report_id, COALESCE(cr.traversal, 0) AS traversal,
               cr.organization_id, o.name AS organization_name,
               cp.description AS period_description,
               cr.exclusion_agreement_id,
               ws.director_status_id::text AS director_status
        FROM compliance_report cr
        JOIN organization o ON o.id = cr.organization_id
        JOIN compliance_period cp ON cp.id = cr.compliance_period_id
        LEFT JOIN compliance_report_workflow_state ws ON ws.id = cr.status_id
        WHERE cr.exclusion_agreement_id IS NOT NULL
          AND NOT EXISTS (
              SELECT 1
              FROM compliance_report main
              WHERE main.organization_id = cr.organization_id
                AND main.compliance_period_id = cr.compliance_period_id
                AND main.exclusion_agreement_id IS NULL
          )
        ORDER BY COALESCE(cr.root_report_id, cr.id), cr.traversal, cr.id
        "#,
    )
    .fetch_all(source)
    .await?;
    Ok(rows)
}

async fn source_address(source: &PgPool, organization_id: i32) -> Result<Option<String>> {
    let address = sqlx::query_as::<_, SourceAddress>(
        r#"
        SELECT address_line_1, address_line_2, address_line_3, city, state,
               postal_code, country
        FROM organization_address
        WHERE organization_id = $1 AND expiration_date IS NULL
        ORDER BY effective_date DESC NULLS LAST, id DESC
        LIMIT 1
        "#,
    )
    .bind(organization_id)
    .fetch_optional(source)
    .await?;
    Ok(address.map(SourceAddress::formatted))
}

/// Destination ids an orphan chain resolves to.
struct Target {
    organization: DestinationOrganization,
    compliance_period_id: i32,
    address: Option<String>,
}

struct Resolver<'a> {
    source: &'a PgPool,
    destination: &'a PgPool,
    organizations: HashMap<String, Option<DestinationOrganization>>,
    periods: HashMap<String, Option<i32>>,
}

impl<'a> Resolver<'a> {
    fn new(source: &'a PgPool, destination: &'a PgPool) -> Self {
        Self {
            source,
            destination,
            organizations: HashMap::new(),
            periods: HashMap::new(),
        }
    }

    async fn organization(&mut self, name: &str) -> Result<Option<DestinationOrganization>> {
        let key = name.trim().to_lowercase();
        if let Some(found) = self.organizations.get(&key) {
            return Ok(found.clone());
        }
        let found = sqlx::query_as::<_, DestinationOrganization>(
            r#"
            SELECT organization_id, name, operating_name, email, phone
            FROM organization
            WHERE lower(trim(name)) = $1
            ORDER BY organization_id
            LIMIT 1
            "#,
        )
        .bind(&key)
        .fetch_optional(self.destination)
        .await?;
        self.organizations.insert(key, found.clone());
        Ok(found)
    }

    async fn period(&mut self, description: &str) -> Result<Option<i32>> {
        if let Some(found) = self.periods.get(description) {
            return Ok(*found);
        }
        let found: Option<i32> = sqlx::query_scalar(
            "SELECT compliance_period_id FROM compliance_period WHERE description = $1",
        )
        .bind(description.trim())
        .fetch_optional(self.destination)
        .await?;
        self.periods.insert(description.to_string(), found);
        Ok(found)
    }

    async fn target(&mut self, orphan: &OrphanReport) -> Result<Option<Target>> {
        let Some(organization) = self.organization(&orphan.organization_name).await? else {
            tracing::warn!(
                legacy_id = orphan.id,
                organization = %orphan.organization_name,
                "Organization not found in destination"
            );
            return Ok(None);
        };
        let Some(compliance_period_id) = self.period(&orphan.period_description).await? else {
            tracing::warn!(
                legacy_id = orphan.id,
                period = %orphan.period_description,
                "Compliance period not found in destination"
            );
            return Ok(None);
        };
        let address = source_address(self.source, orphan.organization_id).await?;
        Ok(Some(Target {
            organization,
            compliance_period_id,
            address,
        }))
    }
}

/// Create every report of one chain on `conn`. Returns rows written.
async fn write_chain(
    conn: &mut PgConnection,
    plan: &ChainPlan,
    target: &Target,
    status_ids: &HashMap<ComplianceReportStatus, i32>,
    writer: &AllocationWriter,
) -> Result<u64> {
    let mut written = 0;
    for report in &plan.reports {
        let status_id = status_ids.get(&report.status).copied().ok_or_else(|| {
            MigrationError::InvalidData(format!("status {} missing from destination", report.status))
        })?;

        let report_id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO compliance_report (
                compliance_period_id, organization_id, current_status_id,
                reporting_frequency, compliance_report_group_uuid, version,
                legacy_id, nickname, create_user, update_user
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            RETURNING compliance_report_id
            "#,
        )
        .bind(target.compliance_period_id)
        .bind(target.organization.organization_id)
        .bind(status_id)
        .bind(ReportingFrequency::Annual)
        .bind(plan.group_uuid.to_string())
        .bind(report.version)
        .bind(report.source.id)
        .bind(report.nickname())
        .bind(MIGRATION_USER)
        .fetch_one(&mut *conn)
        .await?;

        SummaryRecord::zeroed().insert(&mut *conn, report_id).await?;

        let address = target.address.clone().unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO compliance_report_organization_snapshot (
                compliance_report_id, name, operating_name, email, phone,
                service_address, head_office_address, records_address,
                is_edited, create_user, update_user
            ) VALUES ($1, $2, $3, $4, $5, $6, $6, $6, FALSE, $7, $7)
            "#,
        )
        .bind(report_id)
        .bind(&target.organization.name)
        .bind(
            target
                .organization
                .operating_name
                .clone()
                .unwrap_or_else(|| target.organization.name.clone()),
        )
        .bind(target.organization.email.clone().unwrap_or_default())
        .bind(target.organization.phone.clone().unwrap_or_default())
        .bind(address)
        .bind(MIGRATION_USER)
        .execute(&mut *conn)
        .await?;
        written += 3;

        for change in &report.allocations {
            let done = writer.insert_query(report_id, change).execute(&mut *conn).await?;
            written += done.rows_affected();
        }
        tracing::info!(
            legacy_id = report.source.id,
            report_id,
            version = report.version,
            status = %report.status,
            allocations = report.allocations.len(),
            "Created report for orphan exclusion agreement"
        );
    }
    Ok(written)
}

#[derive(Debug, Default)]
pub struct OrphanExclusionMigrator;

impl OrphanExclusionMigrator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Migrator for OrphanExclusionMigrator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn required_source_tables(&self) -> &'static [&'static str] {
        &[
            "compliance_report",
            "compliance_report_exclusion_agreement_record",
            "compliance_report_workflow_state",
            "organization",
            "organization_address",
            "compliance_period",
        ]
    }

    async fn run(&mut self, ctx: &MigrationContext) -> Result<ComponentStats> {
        let mut stats = ComponentStats::default();
        let legacy = LegacyIdMap::load(ctx.destination()).await?;
        let status_ids = load_status_ids(ctx.destination()).await?;
        let writer = AllocationWriter::load(ctx.destination()).await?;
        let mut resolver = Resolver::new(ctx.source(), ctx.destination());

        let orphans = load_orphans(ctx.source()).await?;
        stats.found = orphans.len() as u64;
        tracing::info!(orphans = orphans.len(), "Found orphan exclusion reports");

        let mut tx = ctx.destination().begin().await?;
        for members in group_by_chain(orphans) {
            if members.iter().any(|m| legacy.contains(m.id)) {
                tracing::debug!(legacy_id = members[0].id, "Orphan chain already migrated");
                stats.skipped += members.len() as u64;
                continue;
            }
            let Some(target) = resolver.target(&members[0]).await? else {
                stats.skipped += members.len() as u64;
                continue;
            };

            let mut with_records = Vec::with_capacity(members.len());
            for member in members {
                let records =
                    allocation_agreement::load_agreement_records(ctx.source(), member.exclusion_agreement_id)
                        .await?;
                with_records.push((member, records));
            }
            let plan = plan_chain(with_records, &mut stats);
            let first_id = plan.reports.first().map(|r| r.source.id).unwrap_or_default();

            let mut savepoint = tx.begin().await?;
            match write_chain(&mut savepoint, &plan, &target, &status_ids, &writer).await {
                Ok(rows) => {
                    savepoint.commit().await?;
                    stats.rows_written += rows;
                    stats.processed += plan.reports.len() as u64;
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    record_failure(&mut stats, "orphan exclusion chain", first_id, &e);
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
    use lcfs_types::ActionType;
    use rust_decimal::Decimal;

    fn orphan(id: i32, root: Option<i32>, traversal: i32, director: Option<&str>) -> OrphanReport {
        OrphanReport {
            id,
            root_report_id: root,
            traversal,
            organization_id: 3,
            organization_name: "Acme".into(),
            period_description: "2022".into(),
            exclusion_agreement_id: id * 10,
            director_status: director.map(str::to_string),
        }
    }

    fn allocation(id: i32, quantity: i64) -> ExclusionRecord {
        ExclusionRecord {
            id,
            responsibility: "Sold".into(),
            fuel_type: "Petroleum-based gasoline".into(),
            fuel_type_id: 14,
            transaction_partner: "Northern Co-op".into(),
            postal_address: None,
            quantity: Decimal::new(quantity, 0),
            quantity_not_sold: None,
            unit_of_measure: Some("L".into()),
        }
    }

    #[test]
    fn standalone_orphan_becomes_assessed_version_zero() {
        let mut stats = ComponentStats::default();
        let plan = plan_chain(
            vec![(orphan(500, None, 1, Some("Accepted")), vec![allocation(1, 2500)])],
            &mut stats,
        );

        assert_eq!(plan.reports.len(), 1);
        let report = &plan.reports[0];
        assert_eq!(report.source.id, 500);
        assert_eq!(report.version, 0);
        assert_eq!(report.status, ComplianceReportStatus::Assessed);
        assert_eq!(report.nickname(), "Original Report");
        assert_eq!(report.allocations.len(), 1);
        assert_eq!(report.allocations[0].action, ActionType::Create);
        assert_eq!(report.allocations[0].values.transaction_type, "Allocated to");
    }

    #[test]
    fn chain_members_share_group_with_dense_versions() {
        let grouped = group_by_chain(vec![
            orphan(502, Some(500), 3, None),
            orphan(500, None, 1, Some("Accepted")),
            orphan(501, Some(500), 2, Some("Rejected")),
            orphan(700, None, 1, None),
        ]);
        assert_eq!(grouped.len(), 2);

        let members = grouped[0]
            .iter()
            .cloned()
            .map(|o| {
                let records = vec![allocation(o.id, 100)];
                (o, records)
            })
            .collect();
        let mut stats = ComponentStats::default();
        let plan = plan_chain(members, &mut stats);

        let versions: Vec<(i32, i32)> = plan.reports.iter().map(|r| (r.source.id, r.version)).collect();
        assert_eq!(versions, vec![(500, 0), (501, 1), (502, 2)]);
        assert_eq!(plan.reports[1].status, ComplianceReportStatus::Rejected);
        assert_eq!(plan.reports[2].status, ComplianceReportStatus::Draft);
        assert_eq!(plan.reports[2].nickname(), "Supplemental report 2");
        // identical allocation in every version: created once, never repeated
        assert_eq!(plan.reports[0].allocations.len(), 1);
        assert!(plan.reports[1].allocations.is_empty());
    }

    #[test]
    fn address_parts_join_without_blanks() {
        let parts = [
            Some("123 Main St".to_string()),
            None,
            Some("  ".to_string()),
            Some("Victoria".to_string()),
            Some("BC".to_string()),
        ];
        assert_eq!(format_address(&parts), "123 Main St, Victoria, BC");
    }
}
