//! Static TFRS to LCFS code tables
//!
//! These tables are fixed by the two schemas and are not inferred at runtime.
//! Every lookup reports whether the documented default had to be used so the
//! caller can log a warning and count it.

use lcfs_types::{ComplianceReportStatus, FuelCategory, ReceivedOrTransferred};

/// A mapped value and whether it came from the fallback default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapped<T> {
    pub value: T,
    pub defaulted: bool,
}

impl<T> Mapped<T> {
    fn found(value: T) -> Self {
        Self {
            value,
            defaulted: false,
        }
    }

    fn fallback(value: T) -> Self {
        Self {
            value,
            defaulted: true,
        }
    }
}

/// LCFS `fuel_type_id` of "Other".
pub const OTHER_FUEL_TYPE_ID: i32 = 19;

/// LCFS `expected_use_type_id` of "Other".
pub const OTHER_EXPECTED_USE_ID: i32 = 2;

/// Schedule A transfer type.
///
/// `1 -> Received`, `2 -> Transferred` is kept exactly as the legacy code
/// behaved. It reads inverted; flagged for product review, do not "fix" it here.
pub fn transfer_direction(transfer_type_id: i32) -> Mapped<ReceivedOrTransferred> {
    match transfer_type_id {
        1 => Mapped::found(ReceivedOrTransferred::Received),
        2 => Mapped::found(ReceivedOrTransferred::Transferred),
        _ => Mapped::fallback(ReceivedOrTransferred::Received),
    }
}

/// TFRS `fuel_class_id` to LCFS fuel category: `1 -> Diesel`, `2 -> Gasoline`.
pub fn fuel_category_for_class(fuel_class_id: i32) -> Mapped<FuelCategory> {
    match fuel_class_id {
        1 => Mapped::found(FuelCategory::Diesel),
        2 => Mapped::found(FuelCategory::Gasoline),
        _ => Mapped::fallback(FuelCategory::Gasoline),
    }
}

/// Fuel category guessed from a fuel-type name. Used for allocation records,
/// whose source rows carry no fuel class.
pub fn fuel_category_from_fuel_name(fuel_type: &str) -> Option<FuelCategory> {
    let name = fuel_type.to_lowercase();
    if name.contains("gasoline") {
        Some(FuelCategory::Gasoline)
    } else if name.contains("diesel") {
        Some(FuelCategory::Diesel)
    } else {
        None
    }
}

// (TFRS approved_fuel_type id, LCFS fuel_type id, fuel name)
const FUEL_TYPES: &[(i32, i32, &str)] = &[
    (1, 1, "Biodiesel"),
    (2, 2, "CNG"),
    (3, 3, "Electricity"),
    (4, 4, "Ethanol"),
    (5, 5, "HDRD"),
    (6, 6, "Hydrogen"),
    (7, 7, "LNG"),
    (8, 13, "Propane"),
    (9, 14, "Renewable gasoline"),
    (10, 15, "Renewable naphtha"),
    (11, 16, "Fossil-derived diesel"),
    (12, 17, "Fossil-derived gasoline"),
    (13, 16, "Petroleum-based diesel"),
    (14, 17, "Petroleum-based gasoline"),
    (15, 11, "Alternative jet fuel"),
    (16, 18, "Fossil-derived jet fuel"),
    (17, 19, "Natural gas-based gasoline"),
    (18, 5, "Renewable diesel"),
    (19, 20, "Other diesel fuel"),
    (20, 13, "Renewable propane"),
    (21, 19, "Other"),
];

/// TFRS approved fuel type to LCFS `fuel_type_id`, "Other" when unmapped.
pub fn lcfs_fuel_type_id(tfrs_fuel_type_id: i32) -> Mapped<i32> {
    FUEL_TYPES
        .iter()
        .find(|(tfrs, _, _)| *tfrs == tfrs_fuel_type_id)
        .map(|(_, lcfs, _)| Mapped::found(*lcfs))
        .unwrap_or_else(|| Mapped::fallback(OTHER_FUEL_TYPE_ID))
}

/// TFRS fuel type name (as snapshots carry it) to LCFS `fuel_type_id`.
pub fn lcfs_fuel_type_for_name(name: &str) -> Mapped<i32> {
    let wanted = name.trim();
    FUEL_TYPES
        .iter()
        .find(|(_, _, fuel)| fuel.eq_ignore_ascii_case(wanted))
        .map(|(_, lcfs, _)| Mapped::found(*lcfs))
        .unwrap_or_else(|| Mapped::fallback(OTHER_FUEL_TYPE_ID))
}

/// TFRS expected use to LCFS `expected_use_type_id`.
pub fn lcfs_expected_use_id(tfrs_expected_use_id: i32) -> Mapped<i32> {
    match tfrs_expected_use_id {
        // Heating oil
        1 => Mapped::found(1),
        // Department of National Defence, aviation, other
        2..=4 => Mapped::found(OTHER_EXPECTED_USE_ID),
        _ => Mapped::fallback(OTHER_EXPECTED_USE_ID),
    }
}

/// TFRS unit of measure to the LCFS `quantityunitsenum` label.
pub fn lcfs_units(tfrs_unit: &str) -> Mapped<&'static str> {
    match tfrs_unit.trim().to_lowercase().as_str() {
        "l" | "litres" | "liters" | "litre" => Mapped::found("Litres"),
        "kg" | "kilograms" => Mapped::found("Kilograms"),
        "kwh" | "kilowatt_hour" | "kilowatt hours" => Mapped::found("Kilowatt_hour"),
        "m³" | "m3" | "cubic_metres" | "cubic metres" => Mapped::found("Cubic_metres"),
        _ => Mapped::fallback("Litres"),
    }
}

/// Allocation responsibility (TFRS transaction type) to the LCFS
/// `allocation_transaction_type.type` label.
pub fn allocation_transaction_type(responsibility: &str) -> Mapped<&'static str> {
    match responsibility.trim().to_lowercase().as_str() {
        "purchased" | "allocated from" => Mapped::found("Allocated from"),
        "sold" | "allocated to" => Mapped::found("Allocated to"),
        _ => Mapped::fallback("Allocated from"),
    }
}

pub const PROVISION_PRESCRIBED: &str = "Prescribed carbon intensity - section 19 (a)";
pub const PROVISION_FUEL_CODE: &str = "Approved fuel code - section 19 (b) (i)";
pub const PROVISION_DEFAULT_CI: &str = "Default carbon intensity - section 19 (b) (ii)";
pub const PROVISION_UNKNOWN: &str = "Unknown";

/// TFRS Part 3 provision (`Section 6 (5) ...`) to the LCFS provision name.
pub fn lcfs_provision(tfrs_provision: &str) -> Mapped<&'static str> {
    let compact: String = tfrs_provision
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    if compact.contains("(d)(ii)(a)") {
        Mapped::found(PROVISION_FUEL_CODE)
    } else if compact.contains("(d)(ii)(b)") {
        Mapped::found(PROVISION_UNKNOWN)
    } else if compact.contains("(d)(i)") {
        Mapped::found(PROVISION_DEFAULT_CI)
    } else if compact.contains("(5)(a)") || compact.contains("(5)(b)") || compact.contains("(5)(c)") {
        Mapped::found(PROVISION_PRESCRIBED)
    } else {
        Mapped::fallback(PROVISION_UNKNOWN)
    }
}

/// Director decision on a TFRS report to the destination report status.
pub fn status_from_director(director_status: Option<&str>) -> ComplianceReportStatus {
    match director_status.map(|s| s.trim().to_lowercase()) {
        Some(s) if s == "accepted" => ComplianceReportStatus::Assessed,
        Some(s) if s == "rejected" => ComplianceReportStatus::Rejected,
        _ => ComplianceReportStatus::Draft,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_type_keeps_legacy_direction() {
        assert_eq!(
            transfer_direction(1).value,
            ReceivedOrTransferred::Received
        );
        assert_eq!(
            transfer_direction(2).value,
            ReceivedOrTransferred::Transferred
        );
        assert!(transfer_direction(7).defaulted);
    }

    #[test]
    fn fuel_class_maps_to_swapped_category() {
        assert_eq!(fuel_category_for_class(1).value.id(), 2);
        assert_eq!(fuel_category_for_class(2).value.id(), 1);
        assert!(fuel_category_for_class(0).defaulted);
    }

    #[test]
    fn fuel_name_heuristic() {
        assert_eq!(
            fuel_category_from_fuel_name("Petroleum-based gasoline"),
            Some(FuelCategory::Gasoline)
        );
        assert_eq!(
            fuel_category_from_fuel_name("Renewable Diesel"),
            Some(FuelCategory::Diesel)
        );
        assert_eq!(fuel_category_from_fuel_name("Propane"), None);
    }

    #[test]
    fn unmapped_fuel_type_falls_back_to_other() {
        assert_eq!(lcfs_fuel_type_id(8), Mapped::found(13));
        let other = lcfs_fuel_type_id(99);
        assert_eq!(other.value, OTHER_FUEL_TYPE_ID);
        assert!(other.defaulted);
    }

    #[test]
    fn fuel_type_names_resolve_like_ids() {
        assert_eq!(lcfs_fuel_type_for_name("renewable naphtha"), lcfs_fuel_type_id(10));
        assert_eq!(lcfs_fuel_type_for_name(" HDRD "), Mapped::found(5));
        assert!(lcfs_fuel_type_for_name("Coal").defaulted);
    }

    #[test]
    fn every_tfrs_fuel_type_is_mapped() {
        for id in 1..=21 {
            assert!(!lcfs_fuel_type_id(id).defaulted, "fuel type {id}");
        }
    }

    #[test]
    fn provisions_follow_section_letters() {
        assert_eq!(
            lcfs_provision("Section 6 (5) (d) (ii) (A)").value,
            PROVISION_FUEL_CODE
        );
        assert_eq!(
            lcfs_provision("Section 6 (5) (d) (i)").value,
            PROVISION_DEFAULT_CI
        );
        assert_eq!(lcfs_provision("Section 6 (5) (a)").value, PROVISION_PRESCRIBED);
        assert!(lcfs_provision("something else").defaulted);
    }

    #[test]
    fn director_status_mapping() {
        assert_eq!(
            status_from_director(Some("Accepted")),
            ComplianceReportStatus::Assessed
        );
        assert_eq!(
            status_from_director(Some("Rejected")),
            ComplianceReportStatus::Rejected
        );
        assert_eq!(
            status_from_director(Some("Unreviewed")),
            ComplianceReportStatus::Draft
        );
        assert_eq!(status_from_director(None), ComplianceReportStatus::Draft);
    }

    #[test]
    fn units_and_allocation_types() {
        assert_eq!(lcfs_units("L").value, "Litres");
        assert_eq!(lcfs_units("m³").value, "Cubic_metres");
        assert!(lcfs_units("gallons").defaulted);
        assert_eq!(allocation_transaction_type("Sold").value, "Allocated to");
        assert_eq!(
            allocation_transaction_type("Purchased").value,
            "Allocated from"
        );
    }
}
