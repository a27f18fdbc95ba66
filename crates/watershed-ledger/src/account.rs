//! Watershed accounts: per-user running balance with an audit trail.

use crate::error::{LedgerError, Result};
use crate::id::generate_id;
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What moved money in or out of a watershed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatershedTxKind {
    /// Giving credit accrued from the platform.
    GivingAccrual,
    /// Borrower's own balance committed to a loan at origination.
    LoanSelfFunding,
    /// A community funder repaid from a loan's distribution.
    LoanRepayment,
    /// Borrower's self-funded share paid back into their own watershed.
    LoanSelfRestore,
    /// A funder's pledged principal collected.
    PledgeSettlement,
}

impl WatershedTxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WatershedTxKind::GivingAccrual => "giving_accrual",
            WatershedTxKind::LoanSelfFunding => "loan_self_funding",
            WatershedTxKind::LoanRepayment => "loan_repayment",
            WatershedTxKind::LoanSelfRestore => "loan_self_restore",
            WatershedTxKind::PledgeSettlement => "pledge_settlement",
        }
    }
}

impl fmt::Display for WatershedTxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit row for one watershed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatershedTransaction {
    pub id: String,
    pub user_id: String,
    pub kind: WatershedTxKind,
    /// Signed: positive for inflow, negative for outflow.
    pub amount: Money,
    /// Account balance after this mutation.
    pub balance_after: Money,
    pub loan_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A user's watershed balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatershedAccount {
    pub user_id: String,
    pub balance: Money,
    pub total_inflow: Money,
    pub total_outflow: Money,
    pub updated_at: DateTime<Utc>,
}

impl WatershedAccount {
    /// A fresh, empty account.
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            balance: Money::ZERO,
            total_inflow: Money::ZERO,
            total_outflow: Money::ZERO,
            updated_at: now,
        }
    }

    /// Add `amount` and return the paired audit row.
    pub fn credit(
        &mut self,
        amount: Money,
        kind: WatershedTxKind,
        loan_id: Option<&str>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<WatershedTransaction> {
        if !amount.is_positive() {
            return Err(LedgerError::validation("credit amount must be positive"));
        }
        let (Some(balance), Some(total_inflow)) = (
            self.balance.checked_add(amount),
            self.total_inflow.checked_add(amount),
        ) else {
            return Err(LedgerError::validation("credit would overflow the watershed balance"));
        };
        self.balance = balance;
        self.total_inflow = total_inflow;
        self.updated_at = now;
        Ok(self.audit(kind, amount, loan_id, description, now))
    }

    /// Remove `amount` and return the paired audit row.
    ///
    /// The balance never goes negative.
    pub fn debit(
        &mut self,
        amount: Money,
        kind: WatershedTxKind,
        loan_id: Option<&str>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<WatershedTransaction> {
        if !amount.is_positive() {
            return Err(LedgerError::validation("debit amount must be positive"));
        }
        if amount > self.balance {
            return Err(LedgerError::InsufficientBalance {
                available: self.balance,
                requested: amount,
            });
        }
        self.balance -= amount;
        self.total_outflow += amount;
        self.updated_at = now;
        Ok(self.audit(kind, -amount, loan_id, description, now))
    }

    fn audit(
        &self,
        kind: WatershedTxKind,
        amount: Money,
        loan_id: Option<&str>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> WatershedTransaction {
        WatershedTransaction {
            id: generate_id("wtx", now),
            user_id: self.user_id.clone(),
            kind,
            amount,
            balance_after: self.balance,
            loan_id: loan_id.map(str::to_string),
            description,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dollars(d: i64) -> Money {
        Money::from_dollars_whole(d)
    }

    #[test]
    fn credit_then_debit() {
        let now = Utc::now();
        let mut account = WatershedAccount::new("alice", now);

        let tx = account
            .credit(dollars(500), WatershedTxKind::GivingAccrual, None, None, now)
            .unwrap();
        assert_eq!(tx.balance_after, dollars(500));
        assert_eq!(tx.amount, dollars(500));

        let tx = account
            .debit(dollars(200), WatershedTxKind::LoanSelfFunding, Some("loan1"), None, now)
            .unwrap();
        assert_eq!(tx.amount, -dollars(200));
        assert_eq!(tx.balance_after, dollars(300));
        assert_eq!(tx.loan_id.as_deref(), Some("loan1"));

        assert_eq!(account.balance, dollars(300));
        assert_eq!(account.total_inflow, dollars(500));
        assert_eq!(account.total_outflow, dollars(200));
    }

    #[test]
    fn debit_cannot_overdraw() {
        let now = Utc::now();
        let mut account = WatershedAccount::new("bob", now);
        let err = account
            .debit(dollars(1), WatershedTxKind::PledgeSettlement, None, None, now)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(account.balance, Money::ZERO);
        assert_eq!(account.total_outflow, Money::ZERO);
    }

    #[test]
    fn overflowing_credit_rejected() {
        let now = Utc::now();
        let mut account = WatershedAccount::new("dave", now);
        account.balance = Money::from_cents(i64::MAX - 10);
        let err = account
            .credit(dollars(1), WatershedTxKind::GivingAccrual, None, None, now)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(account.balance, Money::from_cents(i64::MAX - 10));
        assert_eq!(account.total_inflow, Money::ZERO);
    }

    #[test]
    fn zero_amounts_rejected() {
        let now = Utc::now();
        let mut account = WatershedAccount::new("carol", now);
        assert!(account
            .credit(Money::ZERO, WatershedTxKind::GivingAccrual, None, None, now)
            .is_err());
    }
}
