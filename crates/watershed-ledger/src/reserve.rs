//! Platform reserve: the operating account that fronts community-funded
//! disbursements until backers' pledged principal clears.

use crate::error::{LedgerError, Result};
use crate::id::generate_id;
use crate::money::Money;
use crate::policy::ReserveBands;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserve mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveTxKind {
    /// Routine platform revenue recognised into the reserve.
    PlatformCutAccrual,
    /// Reserve paid out a community-funded shortfall ahead of collection.
    DisbursementFronted,
    /// Pending revenue or pledged principal settled into the reserve.
    RevenueCleared,
    /// Administrative correction.
    ManualAdjustment,
}

impl fmt::Display for ReserveTxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReserveTxKind::PlatformCutAccrual => "platform_cut_accrual",
            ReserveTxKind::DisbursementFronted => "disbursement_fronted",
            ReserveTxKind::RevenueCleared => "revenue_cleared",
            ReserveTxKind::ManualAdjustment => "manual_adjustment",
        })
    }
}

/// Immutable audit row for a reserve mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveTransaction {
    pub id: String,
    pub kind: ReserveTxKind,
    /// Signed: positive for inflow, negative for outflow.
    pub amount: Money,
    pub balance_after: Money,
    pub loan_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Derived health classification. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveHealth {
    Healthy,
    Watch,
    Critical,
}

/// The single reserve row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveLedger {
    pub balance: Money,
    pub total_inflow: Money,
    pub total_outflow: Money,
    /// Cumulative `revenue_cleared` inflow.
    pub total_replenished: Money,
    /// Fronted disbursements not yet cleared back.
    pub pending_disbursements: Money,
    pub updated_at: DateTime<Utc>,
}

impl ReserveLedger {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            balance: Money::ZERO,
            total_inflow: Money::ZERO,
            total_outflow: Money::ZERO,
            total_replenished: Money::ZERO,
            pending_disbursements: Money::ZERO,
            updated_at: now,
        }
    }

    /// Recognise platform revenue (fees, repayment residuals).
    pub fn accrue_platform_cut(
        &mut self,
        amount: Money,
        loan_id: Option<&str>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ReserveTransaction> {
        require_positive(amount)?;
        self.post(ReserveTxKind::PlatformCutAccrual, amount, loan_id, description, now)
    }

    /// Pay out a community-funded shortfall ahead of collection.
    ///
    /// The balance may go negative; health reports it as critical.
    pub fn front_disbursement(
        &mut self,
        amount: Money,
        loan_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ReserveTransaction> {
        require_positive(amount)?;
        let pending = checked(self.pending_disbursements.checked_add(amount))?;
        let tx = self.post(
            ReserveTxKind::DisbursementFronted,
            -amount,
            Some(loan_id),
            Some("community-funded shortfall fronted".to_string()),
            now,
        )?;
        self.pending_disbursements = pending;
        Ok(tx)
    }

    /// Settle revenue into the reserve.
    ///
    /// When tied to a loan the amount also retires that much of the
    /// fronted-but-uncollected disbursements.
    pub fn clear_revenue(
        &mut self,
        amount: Money,
        loan_id: Option<&str>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ReserveTransaction> {
        require_positive(amount)?;
        let replenished = checked(self.total_replenished.checked_add(amount))?;
        let tx = self.post(ReserveTxKind::RevenueCleared, amount, loan_id, description, now)?;
        if loan_id.is_some() {
            self.pending_disbursements = self.pending_disbursements.saturating_sub_floor(amount);
        }
        self.total_replenished = replenished;
        Ok(tx)
    }

    /// Administrative correction. A description is mandatory.
    pub fn adjust(
        &mut self,
        amount: Money,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<ReserveTransaction> {
        if amount.is_zero() {
            return Err(LedgerError::validation("adjustment amount must be non-zero"));
        }
        let description = description.trim();
        if description.is_empty() {
            return Err(LedgerError::validation("manual adjustments require a description"));
        }
        self.post(
            ReserveTxKind::ManualAdjustment,
            amount,
            None,
            Some(description.to_string()),
            now,
        )
    }

    /// `balance / pending_disbursements`, or `None` when nothing is pending.
    pub fn coverage_ratio(&self) -> Option<f64> {
        if !self.pending_disbursements.is_positive() {
            return None;
        }
        Some(self.balance.cents() as f64 / self.pending_disbursements.cents() as f64)
    }

    pub fn health(&self, bands: &ReserveBands) -> ReserveHealth {
        if !self.pending_disbursements.is_positive() {
            return if self.balance.is_negative() {
                ReserveHealth::Critical
            } else {
                ReserveHealth::Healthy
            };
        }
        // Compare in integer basis points to keep band edges exact.
        let coverage_bps = self.balance.cents() as i128 * 10_000
            / self.pending_disbursements.cents() as i128;
        if coverage_bps >= bands.healthy_bps as i128 {
            ReserveHealth::Healthy
        } else if coverage_bps >= bands.watch_bps as i128 {
            ReserveHealth::Watch
        } else {
            ReserveHealth::Critical
        }
    }

    fn post(
        &mut self,
        kind: ReserveTxKind,
        amount: Money,
        loan_id: Option<&str>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ReserveTransaction> {
        let balance = checked(self.balance.checked_add(amount))?;
        if amount.is_negative() {
            self.total_outflow = checked(self.total_outflow.checked_sub(amount))?;
        } else {
            self.total_inflow = checked(self.total_inflow.checked_add(amount))?;
        }
        self.balance = balance;
        self.updated_at = now;
        Ok(ReserveTransaction {
            id: generate_id("rtx", now),
            kind,
            amount,
            balance_after: self.balance,
            loan_id: loan_id.map(str::to_string),
            description,
            created_at: now,
        })
    }
}

fn checked(sum: Option<Money>) -> Result<Money> {
    sum.ok_or_else(|| LedgerError::validation("amount would overflow the reserve ledger"))
}

fn require_positive(amount: Money) -> Result<()> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(LedgerError::validation("reserve amount must be positive"))
    }
}
