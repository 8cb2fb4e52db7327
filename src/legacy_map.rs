//! Legacy (TFRS) report id to destination (LCFS) report mapping
//!
//! Built with one bulk read of destination reports that carry a `legacy_id`.
//! Every component loads it once and keeps it for the length of its run.

use std::collections::{BTreeMap, HashMap};

use sqlx::{FromRow, PgPool};

use crate::error::Result;

/// A destination report that was migrated from TFRS
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DestinationReport {
    pub compliance_report_id: i32,
    pub legacy_id: i32,
    pub compliance_report_group_uuid: Option<String>,
    pub version: i32,
    pub organization_id: i32,
    pub compliance_period_id: i32,
}

#[derive(Debug, Clone, Default)]
pub struct LegacyIdMap {
    by_legacy: HashMap<i32, DestinationReport>,
}

impl LegacyIdMap {
    pub async fn load(destination: &PgPool) -> Result<Self> {
        let rows = sqlx::query_as::<_, DestinationReport>(
            r#"
            SELECT compliance_report_id, legacy_id, compliance_report_group_uuid,
                   version, organization_id, compliance_period_id
            FROM compliance_report
            WHERE legacy_id IS NOT NULL
            "#,
        )
        .fetch_all(destination)
        .await?;

        let map = Self::from_reports(rows);
        tracing::info!(mapped = map.len(), "Loaded legacy report id map");
        Ok(map)
    }

    pub fn from_reports(reports: impl IntoIterator<Item = DestinationReport>) -> Self {
        let mut by_legacy = HashMap::new();
        for report in reports {
            if let Some(previous) = by_legacy.insert(report.legacy_id, report) {
                tracing::warn!(
                    legacy_id = previous.legacy_id,
                    report_id = previous.compliance_report_id,
                    "Duplicate legacy_id in destination; keeping the later report"
                );
            }
        }
        Self { by_legacy }
    }

    pub fn report_id(&self, legacy_id: i32) -> Option<i32> {
        self.by_legacy
            .get(&legacy_id)
            .map(|r| r.compliance_report_id)
    }

    pub fn get(&self, legacy_id: i32) -> Option<&DestinationReport> {
        self.by_legacy.get(&legacy_id)
    }

    pub fn contains(&self, legacy_id: i32) -> bool {
        self.by_legacy.contains_key(&legacy_id)
    }

    pub fn len(&self) -> usize {
        self.by_legacy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_legacy.is_empty()
    }

    /// Destination report chains keyed by group uuid, each ordered by version.
    /// A report without a group uuid is a chain of its own.
    pub fn chains(&self) -> Vec<Vec<DestinationReport>> {
        let mut groups: BTreeMap<String, Vec<DestinationReport>> = BTreeMap::new();
        for report in self.by_legacy.values() {
            let key = report
                .compliance_report_group_uuid
                .clone()
                .unwrap_or_else(|| format!("report-{}", report.compliance_report_id));
            groups.entry(key).or_default().push(report.clone());
        }
        let mut chains: Vec<Vec<DestinationReport>> = groups
            .into_values()
            .map(|mut chain| {
                chain.sort_by_key(|r| (r.version, r.legacy_id));
                chain
            })
            .collect();
        chains.sort_by_key(|chain| chain.first().map(|r| r.legacy_id));
        chains
    }

    /// Legacy ids in ascending order, the order flat scans consume them.
    pub fn legacy_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.by_legacy.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: i32, legacy_id: i32) -> DestinationReport {
        DestinationReport {
            compliance_report_id: id,
            legacy_id,
            compliance_report_group_uuid: None,
            version: 0,
            organization_id: 1,
            compliance_period_id: 15,
        }
    }

    #[test]
    fn maps_legacy_ids_and_misses_cleanly() {
        let map = LegacyIdMap::from_reports(vec![report(10, 100), report(11, 101)]);
        assert_eq!(map.report_id(100), Some(10));
        assert_eq!(map.report_id(101), Some(11));
        assert_eq!(map.report_id(999), None);
        assert_eq!(map.legacy_ids(), vec![100, 101]);
    }

    #[test]
    fn groups_chains_by_uuid_in_version_order() {
        let mut original = report(10, 100);
        original.compliance_report_group_uuid = Some("g1".into());
        let mut supplemental = report(11, 101);
        supplemental.compliance_report_group_uuid = Some("g1".into());
        supplemental.version = 1;
        let standalone = report(12, 50);

        let map = LegacyIdMap::from_reports(vec![supplemental, standalone, original]);
        let chains = map.chains();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0][0].legacy_id, 50);
        let ids: Vec<i32> = chains[1].iter().map(|r| r.compliance_report_id).collect();
        assert_eq!(ids, vec![10, 11]);
    }
}
