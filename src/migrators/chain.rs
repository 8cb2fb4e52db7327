//! Source report chains
//!
//! A TFRS chain is the tree of supplementals rooted at `root_report_id`,
//! linearized by `traversal`. The schedule migrators walk each chain once, in
//! traversal order, visiting only the members that reached the destination.

use std::collections::{BTreeMap, HashSet};

use sqlx::{FromRow, PgPool};

use crate::error::Result;
use crate::legacy_map::{DestinationReport, LegacyIdMap};

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SourceReport {
    pub id: i32,
    pub root_report_id: Option<i32>,
    pub traversal: i32,
    pub organization_id: i32,
    pub compliance_period_id: i32,
    pub schedule_a_id: Option<i32>,
    pub schedule_b_id: Option<i32>,
    pub schedule_c_id: Option<i32>,
    pub exclusion_agreement_id: Option<i32>,
    pub summary_id: Option<i32>,
}

impl SourceReport {
    /// Reports without a root are their own root.
    pub fn root_id(&self) -> i32 {
        self.root_report_id.unwrap_or(self.id)
    }
}

pub async fn load_source_reports(source: &PgPool) -> Result<Vec<SourceReport>> {
    let reports = sqlx::query_as::<_, SourceReport>(
        r#"
        SELECT id, root_report_id, COALESCE(traversal, 0) AS traversal,
               organization_id, compliance_period_id,
               schedule_a_id, schedule_b_id, schedule_c_id,
               exclusion_agreement_id, summary_id
        FROM compliance_report
        ORDER BY COALESCE(root_report_id, id), traversal, id
        "#,
    )
    .fetch_all(source)
    .await?;
    Ok(reports)
}

/// One chain member that has a destination counterpart.
#[derive(Debug, Clone)]
pub struct ChainMember {
    pub source: SourceReport,
    pub destination: DestinationReport,
}

#[derive(Debug, Clone)]
pub struct SourceChain {
    pub root_id: i32,
    /// Mapped members in traversal order
    pub members: Vec<ChainMember>,
}

impl SourceChain {
    pub fn destination_report_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.members
            .iter()
            .map(|m| m.destination.compliance_report_id)
    }
}

/// Result of matching source chains against the legacy id map.
#[derive(Debug, Clone, Default)]
pub struct ChainWalk {
    pub chains: Vec<SourceChain>,
    /// Source reports with no destination counterpart
    pub unmapped: u64,
}

/// Group `reports` into chains and keep the mapped members.
///
/// Chains are visited from each mapped report in legacy id order; a root that
/// was already walked is not walked again.
pub fn build_chains(reports: &[SourceReport], legacy: &LegacyIdMap) -> ChainWalk {
    let mut by_root: BTreeMap<i32, Vec<&SourceReport>> = BTreeMap::new();
    let mut root_of = BTreeMap::new();
    for report in reports {
        by_root.entry(report.root_id()).or_default().push(report);
        root_of.insert(report.id, report.root_id());
    }
    for members in by_root.values_mut() {
        members.sort_by_key(|r| (r.traversal, r.id));
    }

    let mut walk = ChainWalk::default();
    let mut processed_roots = HashSet::new();

    for legacy_id in legacy.legacy_ids() {
        let Some(root_id) = root_of.get(&legacy_id).copied() else {
            tracing::debug!(legacy_id, "Destination report has no source report");
            continue;
        };
        if !processed_roots.insert(root_id) {
            continue;
        }

        let mut members = Vec::new();
        for report in by_root.get(&root_id).into_iter().flatten() {
            match legacy.get(report.id) {
                Some(destination) => members.push(ChainMember {
                    source: (*report).clone(),
                    destination: destination.clone(),
                }),
                None => walk.unmapped += 1,
            }
        }
        walk.chains.push(SourceChain { root_id, members });
    }

    for (root_id, members) in &by_root {
        if !processed_roots.contains(root_id) {
            walk.unmapped += members.len() as u64;
        }
    }

    walk
}

/// Destination reports that already carry rows in `table`.
///
/// `table` must be one of the fixed schedule table names.
pub async fn reports_with_rows(destination: &PgPool, table: &'static str) -> Result<HashSet<i32>> {
    let ids: Vec<i32> = sqlx::query_scalar(&format!(
        "SELECT DISTINCT compliance_report_id FROM {table}"
    ))
    .fetch_all(destination)
    .await?;
    Ok(ids.into_iter().collect())
}

/// Whether any member of `chain` was migrated into `table` by an earlier run.
pub fn already_migrated(chain: &SourceChain, existing: &HashSet<i32>) -> bool {
    chain
        .destination_report_ids()
        .any(|id| existing.contains(&id))
}
