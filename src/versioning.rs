//! Record-level version chains for schedule records
//!
//! TFRS issued fresh surrogate keys on every supplemental report, so a logical
//! record is recognised by its content key instead. A [`VersionedChain`] holds the
//! live state of every logical record in one report chain and turns each report's
//! record set into the CREATE / UPDATE / DELETE rows the destination expects.
//!
//! Rules:
//! - unknown identity: CREATE, version 0, fresh group uuid
//! - known identity with changed tracked values: UPDATE, version + 1
//! - known identity coming back after a DELETE: UPDATE, version + 1
//! - known identity, unchanged: nothing
//! - live identity absent from a non-empty report: DELETE, version + 1
//! - absent or empty report: nothing at all

use std::collections::{BTreeMap, BTreeSet};

use lcfs_types::ActionType;
use uuid::Uuid;

/// Values carried by a logical record between versions.
pub trait RecordValues: Clone {
    /// Whether `self` must be written as a new version on top of `previous`.
    fn changed_from(&self, previous: &Self) -> bool;
}

/// Content key plus the ordinal among identical keys in the same report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordIdentity<K> {
    pub key: K,
    pub occurrence: u32,
}

#[derive(Debug, Clone)]
struct LogicalRecord<V> {
    group_uuid: Uuid,
    version: i32,
    values: V,
    deleted: bool,
}

/// One row to insert into a versioned schedule table.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange<K, V> {
    pub identity: RecordIdentity<K>,
    pub group_uuid: Uuid,
    pub version: i32,
    pub action: ActionType,
    pub values: V,
}

#[derive(Debug, Clone)]
pub struct VersionedChain<K, V> {
    records: BTreeMap<RecordIdentity<K>, LogicalRecord<V>>,
}

impl<K, V> Default for VersionedChain<K, V> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }
}

impl<K, V> VersionedChain<K, V>
where
    K: Ord + Clone,
    V: RecordValues,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one report's records. `None` means the report has no record set.
    pub fn apply(&mut self, current: Option<Vec<(K, V)>>) -> Vec<PlannedChange<K, V>> {
        self.plan(current, |_| false, Uuid::new_v4)
    }

    /// Like [`apply`](Self::apply), but never plans a DELETE for an identity
    /// whose key satisfies `retained`. Records that are in the report but
    /// could not be read keep their previous version this way.
    pub fn apply_retaining<R>(&mut self, current: Option<Vec<(K, V)>>, retained: R) -> Vec<PlannedChange<K, V>>
    where
        R: Fn(&K) -> bool,
    {
        self.plan(current, retained, Uuid::new_v4)
    }

    fn plan<R, F>(&mut self, current: Option<Vec<(K, V)>>, retained: R, mut mint: F) -> Vec<PlannedChange<K, V>>
    where
        R: Fn(&K) -> bool,
        F: FnMut() -> Uuid,
    {
        let current = match current {
            Some(records) if !records.is_empty() => assign_occurrences(records),
            _ => return Vec::new(),
        };

        let mut changes = Vec::new();
        let mut seen = BTreeSet::new();

        for (identity, values) in current {
            seen.insert(identity.clone());
            match self.records.get_mut(&identity) {
                Some(record) if record.deleted || values.changed_from(&record.values) => {
                    record.version += 1;
                    record.values = values.clone();
                    record.deleted = false;
                    changes.push(PlannedChange {
                        identity,
                        group_uuid: record.group_uuid,
                        version: record.version,
                        action: ActionType::Update,
                        values,
                    });
                }
                Some(_) => {}
                None => {
                    let group_uuid = mint();
                    self.records.insert(
                        identity.clone(),
                        LogicalRecord {
                            group_uuid,
                            version: 0,
                            values: values.clone(),
                            deleted: false,
                        },
                    );
                    changes.push(PlannedChange {
                        identity,
                        group_uuid,
                        version: 0,
                        action: ActionType::Create,
                        values,
                    });
                }
            }
        }

        for (identity, record) in self.records.iter_mut() {
            if record.deleted || seen.contains(identity) || retained(&identity.key) {
                continue;
            }
            record.version += 1;
            record.deleted = true;
            changes.push(PlannedChange {
                identity: identity.clone(),
                group_uuid: record.group_uuid,
                version: record.version,
                action: ActionType::Delete,
                values: record.values.clone(),
            });
        }

        changes
    }

    /// Logical records that are not currently deleted.
    pub fn live_count(&self) -> usize {
        self.records.values().filter(|r| !r.deleted).count()
    }
}

/// Number identical keys in arrival order so each gets its own identity.
pub fn assign_occurrences<K, V>(records: Vec<(K, V)>) -> Vec<(RecordIdentity<K>, V)>
where
    K: Ord + Clone,
{
    let mut counts: BTreeMap<K, u32> = BTreeMap::new();
    records
        .into_iter()
        .map(|(key, values)| {
            let slot = counts.entry(key.clone()).or_insert(0);
            let occurrence = *slot;
            *slot += 1;
            (RecordIdentity { key, occurrence }, values)
        })
        .collect()
}

/// Lowercased, trimmed text for content keys.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Qty(i64);

    impl RecordValues for Qty {
        fn changed_from(&self, previous: &Self) -> bool {
            self != previous
        }
    }

    fn rows(records: &[(&str, i64)]) -> Option<Vec<(String, Qty)>> {
        Some(
            records
                .iter()
                .map(|(k, q)| (k.to_string(), Qty(*q)))
                .collect(),
        )
    }

    #[test]
    fn first_report_creates_everything() {
        let mut chain = VersionedChain::new();
        let changes = chain.apply(rows(&[("a", 1), ("b", 2)]));
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .all(|c| c.action == ActionType::Create && c.version == 0));
        assert_ne!(changes[0].group_uuid, changes[1].group_uuid);
    }

    #[test]
    fn changed_value_updates_same_group() {
        let mut chain = VersionedChain::new();
        let first = chain.apply(rows(&[("a", 500)]));
        let second = chain.apply(rows(&[("a", 600)]));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].group_uuid, first[0].group_uuid);
        assert_eq!(second[0].version, 1);
        assert_eq!(second[0].action, ActionType::Update);
        assert_eq!(second[0].values, Qty(600));
    }

    #[test]
    fn unchanged_record_writes_nothing() {
        let mut chain = VersionedChain::new();
        chain.apply(rows(&[("a", 5)]));
        assert!(chain.apply(rows(&[("a", 5)])).is_empty());
    }

    #[test]
    fn disappearing_record_is_deleted_once() {
        let mut chain = VersionedChain::new();
        let first = chain.apply(rows(&[("a", 1), ("b", 2)]));
        let second = chain.apply(rows(&[("a", 1)]));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].action, ActionType::Delete);
        assert_eq!(second[0].group_uuid, first[1].group_uuid);
        assert_eq!(second[0].version, 1);
        assert!(chain.apply(rows(&[("a", 1)])).is_empty());
        assert_eq!(chain.live_count(), 1);
    }

    #[test]
    fn empty_or_missing_report_changes_nothing() {
        let mut chain = VersionedChain::new();
        chain.apply(rows(&[("a", 1), ("b", 2)]));
        assert!(chain.apply(None).is_empty());
        assert!(chain.apply(Some(Vec::new())).is_empty());
        assert_eq!(chain.live_count(), 2);
    }

    #[test]
    fn revived_record_continues_as_update() {
        let mut chain = VersionedChain::new();
        chain.apply(rows(&[("a", 1), ("b", 2)]));
        chain.apply(rows(&[("a", 1)]));
        let revived = chain.apply(rows(&[("a", 1), ("b", 2)]));
        assert_eq!(revived.len(), 1);
        assert_eq!(revived[0].action, ActionType::Update);
        assert_eq!(revived[0].version, 2);
    }

    #[test]
    fn duplicate_keys_get_separate_identities() {
        let mut chain = VersionedChain::new();
        let changes = chain.apply(rows(&[("a", 1), ("a", 2)]));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].identity.occurrence, 0);
        assert_eq!(changes[1].identity.occurrence, 1);
        assert_ne!(changes[0].group_uuid, changes[1].group_uuid);
    }

    #[test]
    fn retained_keys_are_not_deleted() {
        let mut chain = VersionedChain::new();
        chain.apply(rows(&[("a", 1), ("b", 2), ("c", 3)]));
        let changes = chain.apply_retaining(rows(&[("c", 3)]), |key: &String| key == "a");

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].identity.key, "b");
        assert_eq!(changes[0].action, ActionType::Delete);
        assert_eq!(chain.live_count(), 2);
    }

    #[test]
    fn normalize_lowercases_and_trims() {
        assert_eq!(normalize("  Acme Fuels Ltd. "), "acme fuels ltd.");
    }
}
