//! Share ledger: who funded how much of each loan.
//!
//! A loan's shares always sum to its principal once funding closes. Each
//! funder holds at most one share per loan; `amount` and `funder_id` never
//! change after creation, only `repaid` grows.

use crate::error::{LedgerError, Result};
use crate::id::generate_id;
use crate::loan::{LoanStatus, WatershedLoan};
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A funder's claim on a loan's principal and repayment stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanShare {
    pub id: String,
    pub loan_id: String,
    pub funder_id: String,
    /// Committed principal.
    pub amount: Money,
    /// Cumulative amount credited back.
    pub repaid: Money,
    /// Only the borrower's own share.
    pub is_self_funded: bool,
    pub created_at: DateTime<Utc>,
}

impl LoanShare {
    /// The borrower's own share, created at origination.
    pub fn self_funded(loan: &WatershedLoan, now: DateTime<Utc>) -> Self {
        Self::new(loan, &loan.borrower_id, loan.self_funded_amount(), true, now)
    }

    /// A community funder's share.
    pub fn community(
        loan: &WatershedLoan,
        funder_id: &str,
        amount: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(loan, funder_id, amount, false, now)
    }

    fn new(
        loan: &WatershedLoan,
        funder_id: &str,
        amount: Money,
        is_self_funded: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: generate_id("share", now),
            loan_id: loan.id.clone(),
            funder_id: funder_id.to_string(),
            amount,
            repaid: Money::ZERO,
            is_self_funded,
            created_at: now,
        }
    }

    /// Principal not yet returned to this funder.
    pub fn outstanding(&self) -> Money {
        self.amount - self.repaid
    }

    /// Record a repayment credit, keeping `0 <= repaid <= amount`.
    pub fn apply_credit(&mut self, credit: Money) -> Result<()> {
        if credit.is_negative() || credit > self.outstanding() {
            return Err(LedgerError::invariant(format!(
                "credit {} on share {} exceeds outstanding {}",
                credit,
                self.id,
                self.outstanding()
            )));
        }
        self.repaid += credit;
        Ok(())
    }
}

/// Total principal committed across shares.
pub fn total_committed(shares: &[LoanShare]) -> Money {
    shares.iter().map(|s| s.amount).sum()
}

/// Principal still open for community pledges.
pub fn open_commitment(loan: &WatershedLoan, shares: &[LoanShare]) -> Money {
    loan.amount.saturating_sub_floor(total_committed(shares))
}

/// Verify shares belong to `loan`, are unique per funder and never over-commit.
///
/// Once funding has closed (any status past `funding`), the shares must
/// sum to the principal exactly.
pub fn verify_shares(loan: &WatershedLoan, shares: &[LoanShare]) -> Result<()> {
    let mut funders: Vec<&str> = Vec::with_capacity(shares.len());
    for share in shares {
        if share.loan_id != loan.id {
            return Err(LedgerError::invariant(format!(
                "share {} belongs to loan {}, not {}",
                share.id, share.loan_id, loan.id
            )));
        }
        if share.repaid.is_negative() || share.repaid > share.amount {
            return Err(LedgerError::invariant(format!(
                "share {} repaid {} outside [0, {}]",
                share.id, share.repaid, share.amount
            )));
        }
        if funders.contains(&share.funder_id.as_str()) {
            return Err(LedgerError::invariant(format!(
                "funder {} holds two shares of loan {}",
                share.funder_id, loan.id
            )));
        }
        funders.push(&share.funder_id);
    }

    let committed = total_committed(shares);
    let funding_open = matches!(loan.status, LoanStatus::Pending | LoanStatus::Funding);
    if committed > loan.amount || (!funding_open && committed != loan.amount) {
        return Err(LedgerError::invariant(format!(
            "shares of loan {} commit {} against principal {}",
            loan.id, committed, loan.amount
        )));
    }
    Ok(())
}

/// A funder's earmark against their watershed for a community share.
///
/// Earmarked funds are not spendable but stay in the balance until the
/// pledge is settled, or released when the loan never funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pledge {
    pub id: String,
    pub loan_id: String,
    pub funder_id: String,
    pub amount: Money,
    pub disbursed: bool,
    pub created_at: DateTime<Utc>,
    pub disbursed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub released_at: Option<DateTime<Utc>>,
}

impl Pledge {
    pub fn for_share(share: &LoanShare, now: DateTime<Utc>) -> Self {
        Self {
            id: generate_id("pledge", now),
            loan_id: share.loan_id.clone(),
            funder_id: share.funder_id.clone(),
            amount: share.amount,
            disbursed: false,
            created_at: now,
            disbursed_at: None,
            released_at: None,
        }
    }

    /// Still holding funds: neither collected nor released.
    pub fn is_outstanding(&self) -> bool {
        !self.disbursed && self.released_at.is_none()
    }

    pub fn mark_disbursed(&mut self, now: DateTime<Utc>) {
        self.disbursed = true;
        self.disbursed_at = Some(now);
    }

    /// Drop the earmark without collecting it.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.released_at = Some(now);
    }
}

/// Sum of a user's outstanding pledges.
pub fn earmarked(pledges: &[Pledge]) -> Money {
    pledges
        .iter()
        .filter(|p| p.is_outstanding())
        .map(|p| p.amount)
        .sum()
}

/// Outstanding exposure a funder holds in other people's live loans.
///
/// `holdings` pairs each of the funder's shares with the loan it funds.
pub fn portfolio_value<'a, I>(funder_id: &str, holdings: I) -> Money
where
    I: IntoIterator<Item = (&'a LoanShare, &'a WatershedLoan)>,
{
    holdings
        .into_iter()
        .filter(|(share, loan)| {
            share.funder_id == funder_id
                && loan.borrower_id != funder_id
                && loan.status.counts_toward_portfolio()
        })
        .map(|(share, _)| share.outstanding())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loan::Funding;

    fn dollars(d: i64) -> Money {
        Money::from_dollars_whole(d)
    }

    fn loan(id: &str, borrower: &str, amount: Money, status: LoanStatus) -> WatershedLoan {
        let now = Utc::now();
        WatershedLoan {
            id: id.into(),
            borrower_id: borrower.into(),
            amount,
            purpose: "test loan purpose".into(),
            funding: Funding::Pure,
            remaining_balance: amount,
            term_months: 6,
            payments_remaining: 6,
            monthly_payment: amount.split_even(6),
            status,
            next_payment_date: None,
            recovery_payments: 0,
            recovery_started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn credit_is_bounded_by_outstanding() {
        let l = loan("l1", "alice", dollars(100), LoanStatus::Active);
        let mut share = LoanShare::self_funded(&l, Utc::now());
        share.apply_credit(dollars(60)).unwrap();
        assert_eq!(share.outstanding(), dollars(40));
        assert!(share.apply_credit(dollars(41)).is_err());
        assert!(share.apply_credit(-Money::CENT).is_err());
        share.apply_credit(dollars(40)).unwrap();
        assert_eq!(share.outstanding(), Money::ZERO);
    }

    #[test]
    fn verify_requires_full_commitment_after_funding() {
        let now = Utc::now();
        let mut l = loan("l1", "alice", dollars(300), LoanStatus::Funding);
        let own = LoanShare::new(&l, "alice", dollars(100), true, now);
        let bob = LoanShare::community(&l, "bob", dollars(150), now);
        let shares = vec![own, bob];

        assert!(verify_shares(&l, &shares).is_ok());
        assert_eq!(open_commitment(&l, &shares), dollars(50));

        l.status = LoanStatus::Active;
        assert!(verify_shares(&l, &shares).is_err());
    }

    #[test]
    fn verify_rejects_duplicate_funder() {
        let now = Utc::now();
        let l = loan("l1", "alice", dollars(300), LoanStatus::Funding);
        let shares = vec![
            LoanShare::community(&l, "bob", dollars(100), now),
            LoanShare::community(&l, "bob", dollars(100), now),
        ];
        assert!(verify_shares(&l, &shares).is_err());
    }

    #[test]
    fn earmarks_ignore_disbursed_pledges() {
        let now = Utc::now();
        let l = loan("l1", "alice", dollars(300), LoanStatus::Funding);
        let share = LoanShare::community(&l, "bob", dollars(80), now);
        let open = Pledge::for_share(&share, now);
        let mut done = Pledge::for_share(&share, now);
        done.mark_disbursed(now);
        let mut released = Pledge::for_share(&share, now);
        released.release(now);
        assert!(!released.is_outstanding());
        assert_eq!(earmarked(&[open, done, released]), dollars(80));
    }

    #[test]
    fn portfolio_counts_live_loans_only() {
        let now = Utc::now();
        let active = loan("l1", "alice", dollars(300), LoanStatus::Active);
        let done = loan("l2", "carol", dollars(300), LoanStatus::Completed);
        let own = loan("l3", "bob", dollars(300), LoanStatus::Active);

        let mut s1 = LoanShare::community(&active, "bob", dollars(100), now);
        s1.repaid = dollars(30);
        let s2 = LoanShare::community(&done, "bob", dollars(100), now);
        let s3 = LoanShare::self_funded(&own, now);

        let value = portfolio_value("bob", [(&s1, &active), (&s2, &done), (&s3, &own)]);
        assert_eq!(value, dollars(70));
    }
}
