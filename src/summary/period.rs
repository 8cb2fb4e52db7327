//! Compliance period instants.
//!
//! A compliance period is a calendar year; its balances are struck at
//! March 31 of the following year, 23:59:59 Pacific time.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::America::Vancouver;
use sqlx::{FromRow, PgPool};

use crate::error::{MigrationError, Result};

/// End of the balance window for `year`, as a UTC instant.
pub fn period_end(year: i32) -> Option<DateTime<Utc>> {
    Vancouver
        .with_ymd_and_hms(year + 1, 3, 31, 23, 59, 59)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

fn local_midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    Vancouver
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

#[derive(Debug, Clone, FromRow)]
struct CompliancePeriodRow {
    compliance_period_id: i32,
    description: String,
    effective_date: Option<NaiveDate>,
    expiration_date: Option<NaiveDate>,
}

/// Who and when a summary is being calculated for.
///
/// Passed explicitly to the summary calculations instead of living in any
/// shared state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryContext {
    pub organization_id: i32,
    pub compliance_period_id: i32,
    pub year: i32,
    /// Start of the effective-date window used by the dynamic lines
    pub window_start: DateTime<Utc>,
    /// End of the effective-date window used by the dynamic lines
    pub window_end: DateTime<Utc>,
    /// Instant the available balance (Line 17) is struck at
    pub balance_at: DateTime<Utc>,
}

impl SummaryContext {
    /// Build the context from a period year; the window is the calendar year.
    pub fn for_year(organization_id: i32, compliance_period_id: i32, year: i32) -> Result<Self> {
        Self::with_window(organization_id, compliance_period_id, year, None, None)
    }

    fn with_window(
        organization_id: i32,
        compliance_period_id: i32,
        year: i32,
        effective: Option<NaiveDate>,
        expiration: Option<NaiveDate>,
    ) -> Result<Self> {
        let invalid = || MigrationError::InvalidData(format!("invalid compliance period year {year}"));

        let start_date = effective
            .or_else(|| NaiveDate::from_ymd_opt(year, 1, 1))
            .ok_or_else(invalid)?;
        let end_date = expiration
            .or_else(|| NaiveDate::from_ymd_opt(year, 12, 31))
            .ok_or_else(invalid)?;

        let window_start = local_midnight(start_date).ok_or_else(invalid)?;
        let window_end = end_date
            .succ_opt()
            .and_then(local_midnight)
            .map(|next| next - chrono::Duration::seconds(1))
            .ok_or_else(invalid)?;

        Ok(Self {
            organization_id,
            compliance_period_id,
            year,
            window_start,
            window_end,
            balance_at: period_end(year).ok_or_else(invalid)?,
        })
    }

    /// Load the destination compliance period and build the context from it.
    pub async fn load(
        destination: &PgPool,
        organization_id: i32,
        compliance_period_id: i32,
    ) -> Result<Self> {
        let period = sqlx::query_as::<_, CompliancePeriodRow>(
            r#"
            SELECT compliance_period_id, description,
                   effective_date::date AS effective_date,
                   expiration_date::date AS expiration_date
            FROM compliance_period
            WHERE compliance_period_id = $1
            "#,
        )
        .bind(compliance_period_id)
        .fetch_optional(destination)
        .await?
        .ok_or_else(|| {
            MigrationError::InvalidData(format!(
                "compliance period {compliance_period_id} not found"
            ))
        })?;

        let year: i32 = period.description.trim().parse().map_err(|_| {
            MigrationError::InvalidData(format!(
                "compliance period description '{}' is not a year",
                period.description
            ))
        })?;

        Self::with_window(
            organization_id,
            period.compliance_period_id,
            year,
            period.effective_date,
            period.expiration_date,
        )
    }
}
