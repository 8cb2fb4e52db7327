//! Compliance-unit balances at a period end (Line 17) and the dynamic
//! transfer / initiative-agreement lines (12-14).
//!
//! Balances follow the effective date of the parent entity (transfer,
//! initiative agreement, admin adjustment), never the transaction's
//! creation date. Only assessed-report adjustments and future debits are
//! dated by the transaction itself.
//!
//! The SQL in [`available_balance`] and the in-memory [`LedgerSnapshot`] apply
//! the same seven terms.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use super::period::SummaryContext;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionAction {
    Adjustment,
    Reserved,
    Released,
}

/// Which parent entity a ledger transaction belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOrigin {
    AssessedReport,
    /// A report that is not (yet) assessed
    OtherReport,
    Transfer,
    InitiativeAgreement,
    AdminAdjustment,
}

#[derive(Debug, Clone)]
pub struct LedgerTransaction {
    pub compliance_units: i64,
    pub action: TransactionAction,
    pub origin: TransactionOrigin,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Recorded,
    /// Sent, submitted or recommended: units are held but not moved
    Pending,
    /// Declined, refused, rescinded or deleted
    Closed,
}

#[derive(Debug, Clone)]
pub struct LedgerTransfer {
    pub from_organization_id: i32,
    pub to_organization_id: i32,
    pub quantity: i64,
    pub status: TransferStatus,
    pub effective: DateTime<Utc>,
}

/// An initiative agreement or admin adjustment.
#[derive(Debug, Clone)]
pub struct LedgerAward {
    pub compliance_units: i64,
    pub approved: bool,
    pub effective: DateTime<Utc>,
}

/// Everything on the ledger for one organization.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub organization_id: i32,
    pub transactions: Vec<LedgerTransaction>,
    pub transfers: Vec<LedgerTransfer>,
    pub initiative_agreements: Vec<LedgerAward>,
    pub admin_adjustments: Vec<LedgerAward>,
}

impl LedgerSnapshot {
    pub fn new(organization_id: i32) -> Self {
        Self {
            organization_id,
            ..Default::default()
        }
    }

    /// Available balance at `period_end`, clamped at zero.
    pub fn available_balance(&self, period_end: DateTime<Utc>) -> i64 {
        let org = self.organization_id;

        let assessed: i64 = self
            .transactions
            .iter()
            .filter(|t| {
                t.origin == TransactionOrigin::AssessedReport
                    && t.action == TransactionAction::Adjustment
                    && t.created <= period_end
            })
            .map(|t| t.compliance_units)
            .sum();

        let recorded = |t: &&LedgerTransfer| {
            t.status == TransferStatus::Recorded && t.effective <= period_end
        };
        let received: i64 = self
            .transfers
            .iter()
            .filter(|t| t.to_organization_id == org)
            .filter(recorded)
            .map(|t| t.quantity)
            .sum();
        let sent: i64 = self
            .transfers
            .iter()
            .filter(|t| t.from_organization_id == org)
            .filter(recorded)
            .map(|t| t.quantity)
            .sum();

        let approved = |awards: &[LedgerAward]| -> i64 {
            awards
                .iter()
                .filter(|a| a.approved && a.effective <= period_end)
                .map(|a| a.compliance_units)
                .sum()
        };
        let initiative = approved(&self.initiative_agreements[..]);
        let admin = approved(&self.admin_adjustments[..]);

        let pending_out: i64 = self
            .transfers
            .iter()
            .filter(|t| {
                t.from_organization_id == org
                    && t.status == TransferStatus::Pending
                    && t.effective > period_end
            })
            .map(|t| t.quantity)
            .sum();

        let future_debits: i64 = self
            .transactions
            .iter()
            .filter(|t| {
                t.created > period_end
                    && t.compliance_units < 0
                    && t.action != TransactionAction::Released
                    && t.origin != TransactionOrigin::Transfer
            })
            .map(|t| t.compliance_units.abs())
            .sum();

        (assessed + received - sent + initiative + admin - pending_out - future_debits).max(0)
    }
}

/// Line 17 for one organization, computed in the destination database.
pub async fn available_balance(destination: &PgPool, ctx: &SummaryContext) -> Result<i64> {
    let balance: i64 = sqlx::query_scalar(
        r#"
        SELECT GREATEST(
            COALESCE((
                SELECT SUM(t.compliance_units)
                FROM "transaction" t
                JOIN compliance_report cr ON cr.transaction_id = t.transaction_id
                JOIN compliance_report_status crs
                  ON crs.compliance_report_status_id = cr.current_status_id
                WHERE t.organization_id = $1
                  AND t.transaction_action = 'Adjustment'
                  AND crs.status = 'Assessed'
                  AND t.create_date <= $2
            ), 0)
          + COALESCE((
                SELECT SUM(tr.quantity)
                FROM transfer tr
                JOIN transfer_status ts ON ts.transfer_status_id = tr.current_status_id
                WHERE tr.to_organization_id = $1
                  AND ts.status = 'Recorded'
                  AND COALESCE(tr.transaction_effective_date, tr.create_date::date) <= $2
            ), 0)
          - COALESCE((
                SELECT SUM(tr.quantity)
                FROM transfer tr
                JOIN transfer_status ts ON ts.transfer_status_id = tr.current_status_id
                WHERE tr.from_organization_id = $1
                  AND ts.status = 'Recorded'
                  AND COALESCE(tr.transaction_effective_date, tr.create_date::date) <= $2
            ), 0)
          + COALESCE((
                SELECT SUM(ia.compliance_units)
                FROM initiative_agreement ia
                JOIN initiative_agreement_status ias
                  ON ias.initiative_agreement_status_id = ia.current_status_id
                WHERE ia.to_organization_id = $1
                  AND ias.status = 'Approved'
                  AND ia.transaction_effective_date <= $2
            ), 0)
          + COALESCE((
                SELECT SUM(aa.compliance_units)
                FROM admin_adjustment aa
                JOIN admin_adjustment_status aas
                  ON aas.admin_adjustment_status_id = aa.current_status_id
                WHERE aa.to_organization_id = $1
                  AND aas.status = 'Approved'
                  AND aa.transaction_effective_date <= $2
            ), 0)
          - COALESCE((
                SELECT SUM(tr.quantity)
                FROM transfer tr
                JOIN transfer_status ts ON ts.transfer_status_id = tr.current_status_id
                WHERE tr.from_organization_id = $1
                  AND ts.status IN ('Sent', 'Submitted', 'Recommended')
                  AND COALESCE(tr.transaction_effective_date, tr.create_date::date) > $2
            ), 0)
          - COALESCE((
                SELECT SUM(ABS(t.compliance_units))
                FROM "transaction" t
                WHERE t.organization_id = $1
                  AND t.create_date > $2
                  AND t.compliance_units < 0
                  AND t.transaction_action <> 'Released'
                  AND NOT EXISTS (
                      SELECT 1 FROM transfer tr
                      WHERE tr.from_transaction_id = t.transaction_id
                         OR tr.to_transaction_id = t.transaction_id
                  )
            ), 0),
            0
        )::BIGINT
        "#,
    )
    .bind(ctx.organization_id)
    .bind(ctx.balance_at)
    .fetch_one(destination)
    .await?;

    Ok(balance)
}

/// Lines 12-14: units moved inside the period's effective-date window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow)]
pub struct DynamicAggregates {
    pub transferred_out: i64,
    pub received: i64,
    pub issued: i64,
}

pub async fn dynamic_aggregates(
    destination: &PgPool,
    ctx: &SummaryContext,
) -> Result<DynamicAggregates> {
    let row = sqlx::query_as::<_, DynamicAggregates>(
        r#"
        SELECT
            COALESCE((
                SELECT SUM(tr.quantity)
                FROM transfer tr
                JOIN transfer_status ts ON ts.transfer_status_id = tr.current_status_id
                WHERE tr.from_organization_id = $1
                  AND ts.status = 'Recorded'
                  AND tr.transaction_effective_date BETWEEN $2 AND $3
            ), 0)::BIGINT AS transferred_out,
            COALESCE((
                SELECT SUM(tr.quantity)
                FROM transfer tr
                JOIN transfer_status ts ON ts.transfer_status_id = tr.current_status_id
                WHERE tr.to_organization_id = $1
                  AND ts.status = 'Recorded'
                  AND tr.transaction_effective_date BETWEEN $2 AND $3
            ), 0)::BIGINT AS received,
            COALESCE((
                SELECT SUM(ia.compliance_units)
                FROM initiative_agreement ia
                JOIN initiative_agreement_status ias
                  ON ias.initiative_agreement_status_id = ia.current_status_id
                WHERE ia.to_organization_id = $1
                  AND ias.status = 'Approved'
                  AND ia.transaction_effective_date BETWEEN $2 AND $3
            ), 0)::BIGINT AS issued
        "#,
    )
    .bind(ctx.organization_id)
    .bind(ctx.window_start)
    .bind(ctx.window_end)
    .fetch_one(destination)
    .await?;

    Ok(row)
}
