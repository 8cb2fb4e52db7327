//! TFRS snapshot line numbers to LCFS summary columns
//!
//! The TFRS form numbers Part 2 gasoline lines 1-11, diesel lines 12-22 and
//! Part 3 lines 23-28. LCFS keeps one numbering per fuel column instead.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;

use super::record::SummaryRecord;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Litres or compliance units, copied as-is
    Quantity,
    /// Dollars, quantized to cents
    Penalty,
}

pub struct LineMapping {
    pub tfrs_line: &'static str,
    pub kind: LineKind,
    pub columns: &'static [&'static str],
}

const fn quantity(tfrs_line: &'static str, columns: &'static [&'static str]) -> LineMapping {
    LineMapping {
        tfrs_line,
        kind: LineKind::Quantity,
        columns,
    }
}

const fn penalty(tfrs_line: &'static str, columns: &'static [&'static str]) -> LineMapping {
    LineMapping {
        tfrs_line,
        kind: LineKind::Penalty,
        columns,
    }
}

pub const LINE_MAPPINGS: &[LineMapping] = &[
    quantity("1", &["line_1_fossil_derived_base_fuel_gasoline"]),
    quantity("2", &["line_2_eligible_renewable_fuel_supplied_gasoline"]),
    quantity("3", &["line_3_total_tracked_fuel_supplied_gasoline"]),
    quantity("4", &["line_4_eligible_renewable_fuel_required_gasoline"]),
    quantity("5", &["line_5_net_notionally_transferred_gasoline"]),
    quantity("6", &["line_6_renewable_fuel_retained_gasoline"]),
    quantity("7", &["line_7_previously_retained_gasoline"]),
    quantity("8", &["line_8_obligation_deferred_gasoline"]),
    quantity("9", &["line_9_obligation_added_gasoline"]),
    quantity("10", &["line_10_net_renewable_fuel_supplied_gasoline"]),
    penalty(
        "11",
        &[
            "line_11_non_compliance_penalty_gasoline",
            "line_11_fossil_derived_base_fuel_gasoline",
        ],
    ),
    quantity("12", &["line_1_fossil_derived_base_fuel_diesel"]),
    quantity("13", &["line_2_eligible_renewable_fuel_supplied_diesel"]),
    quantity("14", &["line_3_total_tracked_fuel_supplied_diesel"]),
    quantity("15", &["line_4_eligible_renewable_fuel_required_diesel"]),
    quantity("16", &["line_5_net_notionally_transferred_diesel"]),
    quantity("17", &["line_6_renewable_fuel_retained_diesel"]),
    quantity("18", &["line_7_previously_retained_diesel"]),
    quantity("19", &["line_8_obligation_deferred_diesel"]),
    quantity("20", &["line_9_obligation_added_diesel"]),
    quantity("21", &["line_10_net_renewable_fuel_supplied_diesel"]),
    penalty(
        "22",
        &[
            "line_11_non_compliance_penalty_diesel",
            "line_11_fossil_derived_base_fuel_diesel",
        ],
    ),
    quantity("23", &["line_18_units_to_be_banked"]),
    quantity("24", &["line_19_units_to_be_exported"]),
    quantity("25", &["line_20_surplus_deficit_units"]),
    quantity("26", &["line_15_banked_units_used"]),
    quantity("27", &["line_16_banked_units_remaining"]),
    penalty("28", &["line_21_non_compliance_penalty_payable"]),
];

/// Legacy penalty rates, dollars per litre of shortfall / per outstanding debit.
pub fn gasoline_penalty_rate() -> Decimal {
    Decimal::new(30, 2)
}

pub fn diesel_penalty_rate() -> Decimal {
    Decimal::new(45, 2)
}

pub fn part3_penalty_rate() -> Decimal {
    Decimal::new(200, 0)
}

/// Half-up to the cent.
pub fn quantize_penalty(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Parse a snapshot line value: JSON number, numeric string (commas allowed) or null.
pub fn parse_line_value(value: &Value) -> std::result::Result<Option<Decimal>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .map(Some)
                .map_err(|e| format!("{text}: {e}"))
        }
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| *c != ',' && *c != '$').collect();
            let cleaned = cleaned.trim();
            if cleaned.is_empty() {
                return Ok(None);
            }
            Decimal::from_str(cleaned)
                .map(Some)
                .map_err(|e| format!("{s}: {e}"))
        }
        other => Err(format!("unexpected line value {other}")),
    }
}

fn is_mapped_line(line: &str) -> bool {
    LINE_MAPPINGS.iter().any(|m| m.tfrs_line == line)
}

/// Snapshot lines after parsing, keyed by TFRS line number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotLines {
    pub values: BTreeMap<String, Decimal>,
    /// Lines present but not numeric
    pub invalid: Vec<String>,
}

impl SnapshotLines {
    /// Read `summary.lines` out of a report snapshot. `None` if the snapshot
    /// carries no summary lines at all.
    pub fn from_snapshot(snapshot: &Value) -> Option<Self> {
        let lines = snapshot.get("summary")?.get("lines")?.as_object()?;
        let mut parsed = Self::default();
        for (line, raw) in lines {
            match parse_line_value(raw) {
                Ok(Some(value)) => {
                    parsed.values.insert(line.clone(), value);
                }
                Ok(None) => {}
                Err(_) if !is_mapped_line(line) => {
                    tracing::debug!(line = %line, "Ignoring unmapped summary line");
                }
                Err(e) => {
                    tracing::warn!(line = %line, error = %e, "Non-numeric summary line");
                    parsed.invalid.push(line.clone());
                }
            }
        }
        Some(parsed)
    }

    pub fn get(&self, line: &str) -> Option<Decimal> {
        self.values.get(line).copied()
    }

    fn get_or_zero(&self, line: &str) -> Decimal {
        self.get(line).unwrap_or(Decimal::ZERO)
    }

    /// Penalty from the snapshot, or recomputed from the shortfall when the
    /// snapshot leaves the line out.
    fn penalty_for(&self, line: &str) -> Decimal {
        if let Some(value) = self.get(line) {
            return quantize_penalty(value);
        }
        let computed = match line {
            "11" => shortfall(self.get_or_zero("4"), self.get_or_zero("10")) * gasoline_penalty_rate(),
            "22" => shortfall(self.get_or_zero("15"), self.get_or_zero("21")) * diesel_penalty_rate(),
            "28" => self.get_or_zero("27").max(Decimal::ZERO) * part3_penalty_rate(),
            _ => Decimal::ZERO,
        };
        quantize_penalty(computed)
    }

    /// Fill every mapped column into `record`, plus the penalty totals.
    pub fn apply_to(&self, record: &mut SummaryRecord) -> Result<()> {
        for mapping in LINE_MAPPINGS {
            let value = match mapping.kind {
                LineKind::Quantity => match self.get(mapping.tfrs_line) {
                    Some(v) => v,
                    None => continue,
                },
                LineKind::Penalty => self.penalty_for(mapping.tfrs_line),
            };
            for column in mapping.columns {
                record.set(column, value)?;
            }
        }

        let gasoline = self.penalty_for("11");
        let diesel = self.penalty_for("22");
        let part3 = self.penalty_for("28");
        record.set("line_11_fossil_derived_base_fuel_total", gasoline + diesel)?;
        record.set(
            "total_non_compliance_penalty_payable",
            quantize_penalty(gasoline + diesel + part3),
        )?;
        Ok(())
    }
}

fn shortfall(required: Decimal, supplied: Decimal) -> Decimal {
    (required - supplied).max(Decimal::ZERO)
}
