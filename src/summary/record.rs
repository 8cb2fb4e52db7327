//! The destination summary row as a column -> exact decimal map.

use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{PgConnection, Postgres, QueryBuilder};

use crate::error::{MigrationError, Result};

const FUEL_SUFFIXES: [&str; 3] = ["gasoline", "diesel", "jet_fuel"];

const RENEWABLE_LINES: [&str; 11] = [
    "line_1_fossil_derived_base_fuel",
    "line_2_eligible_renewable_fuel_supplied",
    "line_3_total_tracked_fuel_supplied",
    "line_4_eligible_renewable_fuel_required",
    "line_5_net_notionally_transferred",
    "line_6_renewable_fuel_retained",
    "line_7_previously_retained",
    "line_8_obligation_deferred",
    "line_9_obligation_added",
    "line_10_net_renewable_fuel_supplied",
    "line_11_non_compliance_penalty",
];

/// Low-carbon fuel target section.
pub const LOW_CARBON_COLUMNS: [&str; 11] = [
    "line_12_low_carbon_fuel_required",
    "line_13_low_carbon_fuel_supplied",
    "line_14_low_carbon_fuel_surplus",
    "line_15_banked_units_used",
    "line_16_banked_units_remaining",
    "line_17_non_banked_units_used",
    "line_18_units_to_be_banked",
    "line_19_units_to_be_exported",
    "line_20_surplus_deficit_units",
    "line_21_surplus_deficit_ratio",
    "line_22_compliance_units_issued",
];

/// Non-compliance penalty section.
pub const PENALTY_COLUMNS: [&str; 6] = [
    "line_11_fossil_derived_base_fuel_gasoline",
    "line_11_fossil_derived_base_fuel_diesel",
    "line_11_fossil_derived_base_fuel_jet_fuel",
    "line_11_fossil_derived_base_fuel_total",
    "line_21_non_compliance_penalty_payable",
    "total_non_compliance_penalty_payable",
];

/// Every numeric column of `compliance_report_summary`, in table order.
pub fn summary_columns() -> Vec<String> {
    let mut columns = Vec::with_capacity(RENEWABLE_LINES.len() * 3 + 17);
    for line in RENEWABLE_LINES {
        for suffix in FUEL_SUFFIXES {
            columns.push(format!("{line}_{suffix}"));
        }
    }
    columns.extend(LOW_CARBON_COLUMNS.iter().map(|c| c.to_string()));
    columns.extend(PENALTY_COLUMNS.iter().map(|c| c.to_string()));
    columns
}

pub fn is_summary_column(column: &str) -> bool {
    summary_columns().iter().any(|c| c == column)
}

/// Column values destined for one summary row.
///
/// A sparse record only touches the columns that were set; a zeroed record
/// carries every column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryRecord {
    values: BTreeMap<String, Decimal>,
}

impl SummaryRecord {
    pub fn zeroed() -> Self {
        Self {
            values: summary_columns()
                .into_iter()
                .map(|c| (c, Decimal::ZERO))
                .collect(),
        }
    }

    pub fn set(&mut self, column: &str, value: Decimal) -> Result<()> {
        if !is_summary_column(column) {
            return Err(MigrationError::InvalidData(format!(
                "unknown summary column '{column}'"
            )));
        }
        self.values.insert(column.to_string(), value);
        Ok(())
    }

    pub fn get(&self, column: &str) -> Option<Decimal> {
        self.values.get(column).copied()
    }

    pub fn get_or_zero(&self, column: &str) -> Decimal {
        self.get(column).unwrap_or(Decimal::ZERO)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Insert a new locked summary row for `compliance_report_id`.
    pub async fn insert(&self, conn: &mut PgConnection, compliance_report_id: i32) -> Result<()> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO compliance_report_summary (compliance_report_id, is_locked");
        for column in self.values.keys() {
            builder.push(", ").push(column);
        }
        builder.push(") VALUES (");
        builder.push_bind(compliance_report_id);
        builder.push(", TRUE");
        for value in self.values.values() {
            builder.push(", ");
            builder.push_bind(as_float(*value));
        }
        builder.push(")");

        builder.build().execute(conn).await?;
        Ok(())
    }

    /// Overwrite the set columns (and the snapshot) of an existing summary row.
    /// Returns the number of rows touched.
    pub async fn update(
        &self,
        conn: &mut PgConnection,
        compliance_report_id: i32,
        historical_snapshot: Option<&serde_json::Value>,
    ) -> Result<u64> {
        if self.values.is_empty() && historical_snapshot.is_none() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE compliance_report_summary SET ");
        let mut separated = builder.separated(", ");
        for (column, value) in &self.values {
            separated.push(format!("{column} = "));
            separated.push_bind_unseparated(as_float(*value));
        }
        if let Some(snapshot) = historical_snapshot {
            separated.push("historical_snapshot = ");
            separated.push_bind_unseparated(sqlx::types::Json(snapshot.clone()));
        }
        builder.push(" WHERE compliance_report_id = ");
        builder.push_bind(compliance_report_id);

        let done = builder.build().execute(conn).await?;
        Ok(done.rows_affected())
    }
}

/// Decimal arithmetic stays exact until this final conversion for the bind.
fn as_float(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_set_covers_three_sections() {
        let columns = summary_columns();
        assert_eq!(columns.len(), 50);
        assert!(columns.contains(&"line_7_previously_retained_diesel".to_string()));
        assert!(columns.contains(&"line_11_non_compliance_penalty_jet_fuel".to_string()));
        assert!(columns.contains(&"line_17_non_banked_units_used".to_string()));
        assert!(columns.contains(&"total_non_compliance_penalty_payable".to_string()));
    }

    #[test]
    fn zeroed_record_has_every_column_at_zero() {
        let record = SummaryRecord::zeroed();
        assert_eq!(record.len(), summary_columns().len());
        assert!(record.iter().all(|(_, v)| v.is_zero()));
    }

    #[test]
    fn unknown_columns_are_rejected() {
        let mut record = SummaryRecord::default();
        assert!(record.set("line_99_made_up", Decimal::ONE).is_err());
        record
            .set("line_22_compliance_units_issued", Decimal::new(1500, 0))
            .unwrap();
        assert_eq!(
            record.get("line_22_compliance_units_issued"),
            Some(Decimal::new(1500, 0))
        );
        assert_eq!(record.len(), 1);
    }
}
