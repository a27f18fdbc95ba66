//! Loan status state machine.
//!
//! Two kinds of input drive a loan:
//!
//! - **Repayments** ([`apply_repayment`]): reduce balances, release the funding
//!   lock once community backers are whole, pull delinquent loans back to
//!   `active`, count recovery payments, and complete the loan.
//! - **External transitions** ([`transition`]): the delinquency scan
//!   (`late`, `at_risk`, `recovering`, `defaulted`), the funding reaper
//!   (`funding → defaulted`), and funding completion (`funding → active`).
//!
//! ```text
//! pending → funding → active ⇄ {late, at_risk} → recovering → active … → completed
//!                        └──────────── any open state ───────────→ defaulted
//! ```

use crate::distribution::Distribution;
use crate::error::{LedgerError, Result};
use crate::loan::{one_month_after, LoanStatus, WatershedLoan};
use crate::money::Money;
use chrono::{DateTime, Utc};

/// What a repayment did to the loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepaymentOutcome {
    pub previous_status: LoanStatus,
    pub status: LoanStatus,
    /// The loan reached `completed` with this payment.
    pub completed: bool,
    /// Community backers are whole (now or earlier).
    pub community_fully_repaid: bool,
    /// This payment turned the funding lock off.
    pub funding_lock_lifted: bool,
}

/// Whether an externally driven transition `from → to` is allowed.
///
/// `completed` is only reachable through [`apply_repayment`].
pub fn can_transition(from: LoanStatus, to: LoanStatus) -> bool {
    use LoanStatus::*;
    matches!(
        (from, to),
        (Pending, Funding | Active | Defaulted)
            | (Funding, Active | Defaulted)
            | (Active, Late | AtRisk | Defaulted)
            | (Late, AtRisk | Recovering | Active | Defaulted)
            | (AtRisk, Late | Recovering | Active | Defaulted)
            | (Recovering, Late | AtRisk | Active | Defaulted)
    )
}

/// Apply an externally driven status change.
pub fn transition(loan: &mut WatershedLoan, to: LoanStatus, now: DateTime<Utc>) -> Result<()> {
    let from = loan.status;
    if !can_transition(from, to) {
        return Err(LedgerError::InvalidState {
            expected: expected_sources(to),
            actual: from,
        });
    }

    if to == LoanStatus::Recovering {
        loan.recovery_payments = 0;
        loan.recovery_started_at = Some(now);
    } else if from == LoanStatus::Recovering {
        loan.recovery_payments = 0;
        loan.recovery_started_at = None;
    }
    if matches!(from, LoanStatus::Pending | LoanStatus::Funding) && to == LoanStatus::Active {
        loan.next_payment_date = Some(one_month_after(now));
        if let Some(backing) = loan.backing_mut() {
            backing.funded_at = Some(now);
        }
    }
    if to == LoanStatus::Defaulted {
        loan.next_payment_date = None;
    }

    loan.status = to;
    loan.updated_at = now;
    Ok(())
}

fn expected_sources(to: LoanStatus) -> &'static str {
    use LoanStatus::*;
    match to {
        Pending => "no status (pending is initial only)",
        Funding => "pending",
        Active => "pending, funding, late, at_risk or recovering",
        Late => "active, at_risk or recovering",
        AtRisk => "active, late or recovering",
        Recovering => "late or at_risk",
        Completed => "a repayable status (completion happens through repayment)",
        Defaulted => "a non-terminal status",
    }
}

/// Apply a distributed payment of `payment` to the loan's balances and status.
///
/// The caller has already credited the shares and accounts from
/// `distribution`; this updates the loan record only.
pub fn apply_repayment(
    loan: &mut WatershedLoan,
    payment: Money,
    distribution: &Distribution,
    recovery_payments_required: u32,
    now: DateTime<Utc>,
) -> Result<RepaymentOutcome> {
    let previous_status = loan.status;
    if !previous_status.is_repayable() {
        return Err(LedgerError::InvalidState {
            expected: "active, late, at_risk or recovering",
            actual: previous_status,
        });
    }
    let lock_before = loan.funding_lock_active();

    loan.remaining_balance = loan.remaining_balance.saturating_sub_floor(payment);
    let remaining = loan.remaining_balance;
    if let Some(backing) = loan.backing_mut() {
        backing.community_remaining_balance = backing
            .community_remaining_balance
            .saturating_sub_floor(distribution.applied_to_community)
            .min(remaining);
    }

    if loan.remaining_balance.is_settled() {
        loan.remaining_balance = Money::ZERO;
        loan.status = LoanStatus::Completed;
        loan.completed_at = Some(now);
        loan.payments_remaining = 0;
        loan.recovery_payments = 0;
        loan.recovery_started_at = None;
        if let Some(backing) = loan.backing_mut() {
            backing.funding_lock_active = false;
            backing.community_remaining_balance = Money::ZERO;
            if backing.community_repaid_at.is_none() {
                backing.community_repaid_at = Some(now);
            }
        }
    } else {
        loan.payments_remaining = loan.payments_remaining.saturating_sub(1);

        let community_release = loan.backing().is_some_and(|b| {
            b.community_repaid_at.is_none()
                && b.community_funded_amount.is_positive()
                && b.community_remaining_balance.is_settled()
        });

        if community_release {
            if let Some(backing) = loan.backing_mut() {
                backing.community_repaid_at = Some(now);
                backing.funding_lock_active = false;
                backing.community_remaining_balance = Money::ZERO;
            }
        } else if matches!(loan.status, LoanStatus::Late | LoanStatus::AtRisk) {
            loan.status = LoanStatus::Active;
        } else if loan.status == LoanStatus::Recovering {
            loan.recovery_payments += 1;
            if loan.recovery_payments >= recovery_payments_required {
                loan.status = LoanStatus::Active;
                loan.recovery_payments = 0;
                loan.recovery_started_at = None;
            }
        }
    }

    loan.next_payment_date = if loan.status == LoanStatus::Completed {
        None
    } else {
        Some(one_month_after(now))
    };
    loan.updated_at = now;

    Ok(RepaymentOutcome {
        previous_status,
        status: loan.status,
        completed: loan.status == LoanStatus::Completed,
        community_fully_repaid: loan.community_repaid_at().is_some(),
        funding_lock_lifted: lock_before && !loan.funding_lock_active(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loan::{Backing, Funding};
    use proptest::prelude::*;

    fn dollars(d: i64) -> Money {
        Money::from_dollars_whole(d)
    }

    fn pure_loan(remaining: Money, status: LoanStatus) -> WatershedLoan {
        let now = Utc::now();
        WatershedLoan {
            id: "loan".into(),
            borrower_id: "alice".into(),
            amount: dollars(200),
            purpose: "dental work deposit".into(),
            funding: Funding::Pure,
            remaining_balance: remaining,
            term_months: 6,
            payments_remaining: 6,
            monthly_payment: Money::from_cents(3_334),
            status,
            next_payment_date: None,
            recovery_payments: 0,
            recovery_started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn backed_loan(remaining: Money, community_remaining: Money) -> WatershedLoan {
        let mut loan = pure_loan(remaining, LoanStatus::Active);
        loan.amount = dollars(300);
        loan.funding = Funding::Backed(Backing {
            self_funded_amount: dollars(100),
            community_funded_amount: dollars(200),
            origination_fee: dollars(10),
            community_remaining_balance: community_remaining,
            funding_deadline: Utc::now(),
            funding_lock_active: true,
            community_repaid_at: None,
            funded_at: None,
        });
        loan
    }

    fn paid(community: Money, self_part: Money) -> Distribution {
        Distribution {
            credits: Vec::new(),
            applied_to_community: community,
            applied_to_self: self_part,
        }
    }

    #[test]
    fn payoff_completes_the_loan() {
        let mut loan = pure_loan(dollars(25), LoanStatus::Active);
        let outcome =
            apply_repayment(&mut loan, dollars(25), &paid(Money::ZERO, dollars(25)), 3, Utc::now())
                .unwrap();
        assert!(outcome.completed);
        assert_eq!(loan.status, LoanStatus::Completed);
        assert_eq!(loan.remaining_balance, Money::ZERO);
        assert_eq!(loan.payments_remaining, 0);
        assert!(loan.completed_at.is_some());
        assert!(loan.next_payment_date.is_none());
    }

    #[test]
    fn within_a_cent_counts_as_settled() {
        let mut loan = pure_loan(Money::from_cents(2_501), LoanStatus::Active);
        apply_repayment(&mut loan, dollars(25), &paid(Money::ZERO, dollars(25)), 3, Utc::now())
            .unwrap();
        assert_eq!(loan.status, LoanStatus::Completed);
        assert_eq!(loan.remaining_balance, Money::ZERO);
    }

    #[test]
    fn completed_loan_rejects_payment() {
        let mut loan = pure_loan(Money::ZERO, LoanStatus::Completed);
        let err = apply_repayment(&mut loan, dollars(5), &paid(Money::ZERO, dollars(5)), 3, Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState { .. }));
    }

    #[test]
    fn partial_payment_advances_schedule() {
        let now = Utc::now();
        let mut loan = pure_loan(dollars(200), LoanStatus::Active);
        let outcome =
            apply_repayment(&mut loan, dollars(40), &paid(Money::ZERO, dollars(40)), 3, now).unwrap();
        assert!(!outcome.completed);
        assert_eq!(loan.remaining_balance, dollars(160));
        assert_eq!(loan.payments_remaining, 5);
        assert_eq!(loan.next_payment_date, Some(one_month_after(now)));
    }

    #[test]
    fn community_payoff_releases_lock_once() {
        let mut loan = backed_loan(dollars(150), dollars(30));
        let outcome =
            apply_repayment(&mut loan, dollars(40), &paid(dollars(30), dollars(10)), 3, Utc::now())
                .unwrap();
        assert!(outcome.funding_lock_lifted);
        assert!(outcome.community_fully_repaid);
        assert!(!loan.funding_lock_active());
        assert_eq!(loan.community_remaining_balance(), Money::ZERO);
        assert_eq!(loan.status, LoanStatus::Active);

        let outcome =
            apply_repayment(&mut loan, dollars(40), &paid(Money::ZERO, dollars(40)), 3, Utc::now())
                .unwrap();
        assert!(!outcome.funding_lock_lifted);
        assert!(outcome.community_fully_repaid);
    }

    #[test]
    fn late_payment_returns_to_active() {
        for status in [LoanStatus::Late, LoanStatus::AtRisk] {
            let mut loan = pure_loan(dollars(200), status);
            apply_repayment(&mut loan, dollars(40), &paid(Money::ZERO, dollars(40)), 3, Utc::now())
                .unwrap();
            assert_eq!(loan.status, LoanStatus::Active);
        }
    }

    #[test]
    fn recovery_needs_consecutive_payments() {
        let now = Utc::now();
        let mut loan = pure_loan(dollars(200), LoanStatus::Late);
        transition(&mut loan, LoanStatus::Recovering, now).unwrap();
        assert!(loan.recovery_started_at.is_some());

        for expected in 1..=2 {
            apply_repayment(&mut loan, dollars(10), &paid(Money::ZERO, dollars(10)), 3, now).unwrap();
            assert_eq!(loan.status, LoanStatus::Recovering);
            assert_eq!(loan.recovery_payments, expected);
        }
        apply_repayment(&mut loan, dollars(10), &paid(Money::ZERO, dollars(10)), 3, now).unwrap();
        assert_eq!(loan.status, LoanStatus::Active);
        assert_eq!(loan.recovery_payments, 0);
        assert!(loan.recovery_started_at.is_none());
    }

    #[test]
    fn transition_table() {
        use LoanStatus::*;
        assert!(can_transition(Funding, Active));
        assert!(can_transition(Funding, Defaulted));
        assert!(!can_transition(Funding, Late));
        assert!(can_transition(Active, Late));
        assert!(!can_transition(Active, Recovering));
        assert!(!can_transition(Active, Completed));
        for to in LoanStatus::ALL {
            assert!(!can_transition(Completed, to));
            assert!(!can_transition(Defaulted, to));
        }
    }

    #[test]
    fn activation_stamps_funding_but_reaping_does_not() {
        let mut funded = backed_loan(dollars(310), dollars(200));
        funded.status = LoanStatus::Funding;
        let mut reaped = funded.clone();

        transition(&mut funded, LoanStatus::Active, Utc::now()).unwrap();
        assert!(funded.backing().unwrap().funded_at.is_some());
        assert!(funded.next_payment_date.is_some());

        transition(&mut reaped, LoanStatus::Defaulted, Utc::now()).unwrap();
        assert!(reaped.backing().unwrap().funded_at.is_none());
    }

    #[test]
    fn default_clears_schedule() {
        let mut loan = pure_loan(dollars(200), LoanStatus::AtRisk);
        loan.next_payment_date = Some(Utc::now());
        transition(&mut loan, LoanStatus::Defaulted, Utc::now()).unwrap();
        assert_eq!(loan.status, LoanStatus::Defaulted);
        assert!(loan.next_payment_date.is_none());
        assert!(transition(&mut loan, LoanStatus::Active, Utc::now()).is_err());
    }

    proptest! {
        #[test]
        fn lock_and_balance_invariants_hold(payments in prop::collection::vec((1i64..20_000, 0u32..=100), 1..40)) {
            let mut loan = backed_loan(dollars(310), dollars(200));
            let mut lock_seen_off = false;
            for (cents, pct_community) in payments {
                if loan.status == LoanStatus::Completed {
                    break;
                }
                let payment = Money::from_cents(cents).min(loan.remaining_balance);
                let community = Money::from_cents(payment.cents() * pct_community as i64 / 100)
                    .min(loan.community_remaining_balance());
                let d = paid(community, payment - community);
                apply_repayment(&mut loan, payment, &d, 3, Utc::now()).unwrap();

                prop_assert!(loan.community_remaining_balance() <= loan.remaining_balance);
                prop_assert!(!loan.remaining_balance.is_negative());
                if lock_seen_off {
                    prop_assert!(!loan.funding_lock_active());
                }
                lock_seen_off |= !loan.funding_lock_active();
            }
        }
    }
}
