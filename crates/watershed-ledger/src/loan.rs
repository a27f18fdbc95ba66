//! Loan model.

use crate::error::{LedgerError, Result};
use crate::money::Money;
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a watershed loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Pending,
    Funding,
    Active,
    Late,
    AtRisk,
    Recovering,
    Completed,
    Defaulted,
}

impl LoanStatus {
    pub const ALL: [LoanStatus; 8] = [
        LoanStatus::Pending,
        LoanStatus::Funding,
        LoanStatus::Active,
        LoanStatus::Late,
        LoanStatus::AtRisk,
        LoanStatus::Recovering,
        LoanStatus::Completed,
        LoanStatus::Defaulted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LoanStatus::Pending => "pending",
            LoanStatus::Funding => "funding",
            LoanStatus::Active => "active",
            LoanStatus::Late => "late",
            LoanStatus::AtRisk => "at_risk",
            LoanStatus::Recovering => "recovering",
            LoanStatus::Completed => "completed",
            LoanStatus::Defaulted => "defaulted",
        }
    }

    /// `completed` and `defaulted` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, LoanStatus::Completed | LoanStatus::Defaulted)
    }

    /// Any non-terminal status blocks a new loan for the same borrower.
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }

    /// Statuses that accept repayments.
    pub fn is_repayable(self) -> bool {
        matches!(
            self,
            LoanStatus::Active | LoanStatus::Late | LoanStatus::AtRisk | LoanStatus::Recovering
        )
    }

    /// Statuses counted when valuing a funder's outstanding portfolio.
    pub fn counts_toward_portfolio(self) -> bool {
        self == LoanStatus::Funding || self.is_repayable()
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoanStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        LoanStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| LedgerError::validation(format!("unknown loan status '{}'", s)))
    }
}

/// Discriminator exposed at the API: fully self-funded or community-backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanType {
    Pure,
    Backed,
}

impl fmt::Display for LoanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoanType::Pure => "pure",
            LoanType::Backed => "backed",
        })
    }
}

/// Community-funded portion of a backed loan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backing {
    pub self_funded_amount: Money,
    pub community_funded_amount: Money,
    pub origination_fee: Money,
    pub community_remaining_balance: Money,
    pub funding_deadline: DateTime<Utc>,
    /// Protects community backers until they are made whole.
    pub funding_lock_active: bool,
    pub community_repaid_at: Option<DateTime<Utc>>,
    /// Set when the community portion was fully pledged and fronted.
    #[serde(default)]
    pub funded_at: Option<DateTime<Utc>>,
}

/// How a loan's principal is funded, resolved once at origination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Funding {
    /// Entirely covered by the borrower's watershed.
    Pure,
    /// Borrower's watershed plus a community-funded shortfall.
    Backed(Backing),
}

/// A loan against a user's watershed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatershedLoan {
    pub id: String,
    pub borrower_id: String,
    /// Principal.
    pub amount: Money,
    pub purpose: String,
    pub funding: Funding,
    /// Outstanding obligation: principal plus origination fee, less payments.
    pub remaining_balance: Money,
    pub term_months: u32,
    pub payments_remaining: u32,
    pub monthly_payment: Money,
    pub status: LoanStatus,
    pub next_payment_date: Option<DateTime<Utc>>,
    pub recovery_payments: u32,
    pub recovery_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WatershedLoan {
    pub fn loan_type(&self) -> LoanType {
        match self.funding {
            Funding::Pure => LoanType::Pure,
            Funding::Backed(_) => LoanType::Backed,
        }
    }

    pub fn backing(&self) -> Option<&Backing> {
        match &self.funding {
            Funding::Pure => None,
            Funding::Backed(backing) => Some(backing),
        }
    }

    pub fn backing_mut(&mut self) -> Option<&mut Backing> {
        match &mut self.funding {
            Funding::Pure => None,
            Funding::Backed(backing) => Some(backing),
        }
    }

    pub fn self_funded_amount(&self) -> Money {
        self.backing().map_or(self.amount, |b| b.self_funded_amount)
    }

    pub fn community_funded_amount(&self) -> Money {
        self.backing().map_or(Money::ZERO, |b| b.community_funded_amount)
    }

    pub fn origination_fee(&self) -> Money {
        self.backing().map_or(Money::ZERO, |b| b.origination_fee)
    }

    /// Principal plus fee.
    pub fn total_obligation(&self) -> Money {
        self.amount + self.origination_fee()
    }

    pub fn community_remaining_balance(&self) -> Money {
        self.backing()
            .map_or(Money::ZERO, |b| b.community_remaining_balance)
    }

    pub fn funding_lock_active(&self) -> bool {
        self.backing().is_some_and(|b| b.funding_lock_active)
    }

    pub fn funding_deadline(&self) -> Option<DateTime<Utc>> {
        self.backing().map(|b| b.funding_deadline)
    }

    pub fn community_repaid_at(&self) -> Option<DateTime<Utc>> {
        self.backing().and_then(|b| b.community_repaid_at)
    }

    /// Check the structural invariants of the record.
    pub fn check_invariants(&self) -> Result<()> {
        if self.remaining_balance.is_negative() {
            return Err(LedgerError::invariant(format!(
                "loan {} has negative remaining balance {}",
                self.id, self.remaining_balance
            )));
        }
        if self.self_funded_amount() + self.community_funded_amount() != self.amount {
            return Err(LedgerError::invariant(format!(
                "loan {} funding split does not sum to principal {}",
                self.id, self.amount
            )));
        }
        if let Some(backing) = self.backing() {
            if backing.community_remaining_balance.is_negative()
                || backing.community_remaining_balance > self.remaining_balance
            {
                return Err(LedgerError::invariant(format!(
                    "loan {} community remaining {} outside [0, {}]",
                    self.id, backing.community_remaining_balance, self.remaining_balance
                )));
            }
        }
        Ok(())
    }
}

/// Scheduled installment or full payoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    #[default]
    Scheduled,
    Payoff,
}

/// Write-once audit record of a repayment and how it was split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatershedLoanPayment {
    pub id: String,
    pub loan_id: String,
    pub payer_id: String,
    pub amount: Money,
    #[serde(rename = "type")]
    pub payment_type: PaymentType,
    pub applied_to_community: Money,
    pub applied_to_self: Money,
    pub created_at: DateTime<Utc>,
}

/// One calendar month after `now`, clamped to the end of shorter months.
pub fn one_month_after(now: DateTime<Utc>) -> DateTime<Utc> {
    now.checked_add_months(Months::new(1))
        .unwrap_or_else(|| now + chrono::Duration::days(30))
}
