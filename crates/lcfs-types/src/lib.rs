//! Destination (LCFS) enums shared across the migration engine.
//!
//! Every string-typed enum the destination schema declares is modelled here as a
//! closed Rust enum so callers match exhaustively. With the `database` feature the
//! enums bind directly to their Postgres enum types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Row-level change marker carried by every versioned schedule record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "database", derive(sqlx::Type))]
#[cfg_attr(
    feature = "database",
    sqlx(type_name = "actiontypeenum", rename_all = "UPPERCASE")
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "CREATE",
            ActionType::Update => "UPDATE",
            ActionType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a notional transfer (Schedule A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "database", derive(sqlx::Type))]
#[cfg_attr(feature = "database", sqlx(type_name = "receivedortransferredenum"))]
pub enum ReceivedOrTransferred {
    #[cfg_attr(feature = "database", sqlx(rename = "Received"))]
    Received,
    #[cfg_attr(feature = "database", sqlx(rename = "Transferred"))]
    Transferred,
}

impl ReceivedOrTransferred {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceivedOrTransferred::Received => "Received",
            ReceivedOrTransferred::Transferred => "Transferred",
        }
    }
}

impl fmt::Display for ReceivedOrTransferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "database", derive(sqlx::Type))]
#[cfg_attr(
    feature = "database",
    sqlx(type_name = "reportingfrequency", rename_all = "UPPERCASE")
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportingFrequency {
    #[default]
    Annual,
    Quarterly,
}

/// Compliance report workflow status as stored in `compliance_report_status.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "database", derive(sqlx::Type))]
#[cfg_attr(feature = "database", sqlx(type_name = "compliancereportstatusenum"))]
pub enum ComplianceReportStatus {
    #[cfg_attr(feature = "database", sqlx(rename = "Draft"))]
    Draft,
    #[cfg_attr(feature = "database", sqlx(rename = "Submitted"))]
    Submitted,
    #[cfg_attr(feature = "database", sqlx(rename = "Recommended_by_analyst"))]
    RecommendedByAnalyst,
    #[cfg_attr(feature = "database", sqlx(rename = "Recommended_by_manager"))]
    RecommendedByManager,
    #[cfg_attr(feature = "database", sqlx(rename = "Assessed"))]
    Assessed,
    #[cfg_attr(feature = "database", sqlx(rename = "Rejected"))]
    Rejected,
}

impl ComplianceReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceReportStatus::Draft => "Draft",
            ComplianceReportStatus::Submitted => "Submitted",
            ComplianceReportStatus::RecommendedByAnalyst => "Recommended_by_analyst",
            ComplianceReportStatus::RecommendedByManager => "Recommended_by_manager",
            ComplianceReportStatus::Assessed => "Assessed",
            ComplianceReportStatus::Rejected => "Rejected",
        }
    }
}

impl fmt::Display for ComplianceReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fuel category with the fixed LCFS `fuel_category_id` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FuelCategory {
    Gasoline,
    Diesel,
    JetFuel,
}

impl FuelCategory {
    pub fn id(&self) -> i32 {
        match self {
            FuelCategory::Gasoline => 1,
            FuelCategory::Diesel => 2,
            FuelCategory::JetFuel => 3,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(FuelCategory::Gasoline),
            2 => Some(FuelCategory::Diesel),
            3 => Some(FuelCategory::JetFuel),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FuelCategory::Gasoline => "Gasoline",
            FuelCategory::Diesel => "Diesel",
            FuelCategory::JetFuel => "Jet fuel",
        }
    }

    /// Case-insensitive lookup by category or fuel-class name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gasoline" => Some(FuelCategory::Gasoline),
            "diesel" => Some(FuelCategory::Diesel),
            "jet fuel" | "jet_fuel" | "jetfuel" => Some(FuelCategory::JetFuel),
            _ => None,
        }
    }
}

impl fmt::Display for FuelCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_serializes_uppercase() {
        let json = serde_json::to_string(&ActionType::Delete).unwrap();
        assert_eq!(json, "\"DELETE\"");
    }

    #[test]
    fn fuel_category_ids_round_trip() {
        for category in [
            FuelCategory::Gasoline,
            FuelCategory::Diesel,
            FuelCategory::JetFuel,
        ] {
            assert_eq!(FuelCategory::from_id(category.id()), Some(category));
            assert_eq!(FuelCategory::from_name(category.name()), Some(category));
        }
        assert_eq!(FuelCategory::from_id(9), None);
    }

    #[test]
    fn report_status_names_match_destination_enum() {
        assert_eq!(
            ComplianceReportStatus::RecommendedByManager.as_str(),
            "Recommended_by_manager"
        );
        assert_eq!(ComplianceReportStatus::Assessed.to_string(), "Assessed");
    }
}
