//! Eligibility and loan origination.
//!
//! A request is *pure* when the borrower's available watershed covers it,
//! and *backed* otherwise: the borrower commits everything available and the
//! shortfall opens for community funding, carrying an origination fee.

use crate::account::{WatershedAccount, WatershedTransaction, WatershedTxKind};
use crate::error::{IneligibleReason, LedgerError, Result};
use crate::id::generate_id;
use crate::loan::{one_month_after, Backing, Funding, LoanStatus, WatershedLoan};
use crate::money::Money;
use crate::policy::LendingPolicy;
use crate::share::LoanShare;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A borrower's loan request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanApplication {
    pub amount: Money,
    pub term_months: u32,
    pub purpose: String,
}

/// Result of a passed eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eligibility {
    pub available: Money,
    /// Snapshot of the user's outstanding exposure as a funder.
    pub portfolio_value: Money,
}

/// `balance - earmarked - self-funded portion of any open loan`, floored at zero.
pub fn available_balance(
    balance: Money,
    earmarked: Money,
    open_loan: Option<&WatershedLoan>,
) -> Money {
    let committed = open_loan.map_or(Money::ZERO, WatershedLoan::self_funded_amount);
    balance
        .saturating_sub_floor(earmarked)
        .saturating_sub_floor(committed)
}

/// The borrower's loan in a non-terminal status, if any.
pub fn find_open_loan(loans: &[WatershedLoan]) -> Option<&WatershedLoan> {
    loans.iter().find(|l| l.status.is_open())
}

/// Check the one-open-loan rule and the balance floor.
pub fn check_eligibility(
    policy: &LendingPolicy,
    available: Money,
    portfolio_value: Money,
    open_loan: Option<&WatershedLoan>,
) -> Result<Eligibility> {
    if let Some(loan) = open_loan {
        return Err(LedgerError::Ineligible(IneligibleReason::OpenLoanExists {
            loan_id: loan.id.clone(),
            status: loan.status,
        }));
    }
    if available < policy.min_balance {
        return Err(LedgerError::Ineligible(IneligibleReason::BalanceBelowMinimum {
            available,
            minimum: policy.min_balance,
        }));
    }
    Ok(Eligibility {
        available,
        portfolio_value,
    })
}

/// Bounds checks on amount, purpose and term.
pub fn validate_application(policy: &LendingPolicy, app: &LoanApplication) -> Result<()> {
    if app.amount < policy.min_amount {
        return Err(LedgerError::validation(format!(
            "minimum loan amount is {}",
            policy.min_amount
        )));
    }
    if app.amount > policy.max_amount {
        return Err(LedgerError::validation(format!(
            "maximum loan amount is {}",
            policy.max_amount
        )));
    }
    if app.purpose.trim().chars().count() < policy.min_purpose_len {
        return Err(LedgerError::validation(format!(
            "please describe the purpose in at least {} characters",
            policy.min_purpose_len
        )));
    }
    let max_term = policy.max_term(app.amount);
    if app.term_months == 0 || app.term_months > max_term {
        return Err(LedgerError::validation(format!(
            "term must be between 1 and {} months for {}",
            max_term, app.amount
        )));
    }
    Ok(())
}

/// How a principal splits between the borrower and the community.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingPlan {
    Pure,
    Backed {
        self_funded: Money,
        community_funded: Money,
    },
}

pub fn plan_funding(amount: Money, available: Money) -> FundingPlan {
    if amount <= available {
        FundingPlan::Pure
    } else {
        FundingPlan::Backed {
            self_funded: available,
            community_funded: amount - available,
        }
    }
}

/// Everything an origination writes, staged for one atomic commit.
#[derive(Debug, Clone)]
pub struct Origination {
    pub loan: WatershedLoan,
    pub self_share: LoanShare,
    /// Debit of the borrower's watershed; `None` when nothing was self-funded.
    pub debit: Option<WatershedTransaction>,
}

/// Build a loan for an eligible borrower and debit their watershed.
///
/// `account` is mutated in place; the caller persists it with the rest of
/// the [`Origination`].
pub fn originate(
    policy: &LendingPolicy,
    account: &mut WatershedAccount,
    app: &LoanApplication,
    eligibility: &Eligibility,
    now: DateTime<Utc>,
) -> Result<Origination> {
    validate_application(policy, app)?;

    let (funding, status, next_payment_date) = match plan_funding(app.amount, eligibility.available)
    {
        FundingPlan::Pure => (Funding::Pure, LoanStatus::Active, Some(one_month_after(now))),
        FundingPlan::Backed {
            self_funded,
            community_funded,
        } => {
            let window = policy.funding_window_days(community_funded);
            let backing = Backing {
                self_funded_amount: self_funded,
                community_funded_amount: community_funded,
                origination_fee: community_funded.apply_bps(policy.fee_rate_bps),
                community_remaining_balance: community_funded,
                funding_deadline: now + Duration::days(i64::from(window)),
                funding_lock_active: true,
                community_repaid_at: None,
                funded_at: None,
            };
            (Funding::Backed(backing), LoanStatus::Funding, None)
        }
    };

    let mut loan = WatershedLoan {
        id: generate_id("loan", now),
        borrower_id: account.user_id.clone(),
        amount: app.amount,
        purpose: app.purpose.trim().to_string(),
        funding,
        remaining_balance: Money::ZERO,
        term_months: app.term_months,
        payments_remaining: app.term_months,
        monthly_payment: Money::ZERO,
        status,
        next_payment_date,
        recovery_payments: 0,
        recovery_started_at: None,
        completed_at: None,
        created_at: now,
        updated_at: now,
    };
    loan.remaining_balance = loan.total_obligation();
    loan.monthly_payment = loan.total_obligation().split_even(app.term_months);
    loan.check_invariants()?;

    let self_funded = loan.self_funded_amount();
    let debit = if self_funded.is_positive() {
        Some(account.debit(
            self_funded,
            WatershedTxKind::LoanSelfFunding,
            Some(&loan.id),
            Some(format!("self-funded portion of {} loan", loan.loan_type())),
            now,
        )?)
    } else {
        None
    };
    let self_share = LoanShare::self_funded(&loan, now);

    Ok(Origination {
        loan,
        self_share,
        debit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loan::LoanType;
    use proptest::prelude::*;

    fn dollars(d: i64) -> Money {
        Money::from_dollars_whole(d)
    }

    fn funded_account(balance: Money) -> WatershedAccount {
        let now = Utc::now();
        let mut account = WatershedAccount::new("alice", now);
        if balance.is_positive() {
            account
                .credit(balance, WatershedTxKind::GivingAccrual, None, None, now)
                .unwrap();
        }
        account
    }

    fn app(amount: Money, term_months: u32) -> LoanApplication {
        LoanApplication {
            amount,
            term_months,
            purpose: "replace broken laptop".into(),
        }
    }

    fn eligible(available: Money) -> Eligibility {
        Eligibility {
            available,
            portfolio_value: Money::ZERO,
        }
    }

    #[test]
    fn pure_loan_is_self_funded_and_active() {
        let policy = LendingPolicy::default();
        let mut account = funded_account(dollars(500));
        let now = Utc::now();

        let o = originate(&policy, &mut account, &app(dollars(200), 6), &eligible(dollars(500)), now)
            .unwrap();

        assert_eq!(o.loan.loan_type(), LoanType::Pure);
        assert_eq!(o.loan.self_funded_amount(), dollars(200));
        assert_eq!(o.loan.community_funded_amount(), Money::ZERO);
        assert_eq!(o.loan.origination_fee(), Money::ZERO);
        assert_eq!(o.loan.status, LoanStatus::Active);
        assert!(!o.loan.funding_lock_active());
        assert_eq!(o.loan.next_payment_date, Some(one_month_after(now)));
        assert_eq!(o.loan.monthly_payment, Money::from_cents(3_333));
        assert_eq!(account.balance, dollars(300));
        assert_eq!(o.self_share.amount, dollars(200));
        assert!(o.self_share.is_self_funded);
        assert_eq!(o.debit.unwrap().balance_after, dollars(300));
    }

    #[test]
    fn backed_loan_opens_shortfall_with_fee() {
        let policy = LendingPolicy::default();
        let mut account = funded_account(dollars(100));
        let now = Utc::now();

        let o = originate(&policy, &mut account, &app(dollars(300), 6), &eligible(dollars(100)), now)
            .unwrap();

        assert_eq!(o.loan.loan_type(), LoanType::Backed);
        assert_eq!(o.loan.self_funded_amount(), dollars(100));
        assert_eq!(o.loan.community_funded_amount(), dollars(200));
        assert_eq!(o.loan.origination_fee(), dollars(200).apply_bps(policy.fee_rate_bps));
        assert_eq!(o.loan.origination_fee(), dollars(10));
        assert_eq!(o.loan.total_obligation(), dollars(310));
        assert_eq!(o.loan.remaining_balance, dollars(310));
        assert_eq!(o.loan.community_remaining_balance(), dollars(200));
        assert_eq!(o.loan.status, LoanStatus::Funding);
        assert!(o.loan.funding_lock_active());
        assert_eq!(o.loan.funding_deadline(), Some(now + Duration::days(7)));
        assert!(o.loan.next_payment_date.is_none());
        assert_eq!(account.balance, Money::ZERO);
    }

    #[test]
    fn huge_principal_is_a_validation_error() {
        let policy = LendingPolicy::default();
        let mut account = funded_account(dollars(100));
        let huge = Money::from_cents(9_000_000_000_000_000_000);

        let err = originate(&policy, &mut account, &app(huge, 12), &eligible(dollars(100)), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let over = policy.max_amount + Money::CENT;
        assert!(validate_application(&policy, &app(over, 12)).is_err());
        assert!(validate_application(&policy, &app(policy.max_amount, 12)).is_ok());
        assert_eq!(account.balance, dollars(100));
    }

    #[test]
    fn validation_bounds() {
        let policy = LendingPolicy::default();
        assert!(validate_application(&policy, &app(dollars(49), 6)).is_err());
        assert!(validate_application(&policy, &app(dollars(200), 0)).is_err());
        assert!(validate_application(&policy, &app(dollars(200), 7)).is_err());
        assert!(validate_application(&policy, &app(dollars(600), 12)).is_ok());

        let mut short = app(dollars(200), 6);
        short.purpose = "   rent   ".into();
        assert!(validate_application(&policy, &short).is_err());
    }

    #[test]
    fn eligibility_rules() {
        let policy = LendingPolicy::default();
        let err = check_eligibility(&policy, dollars(99), Money::ZERO, None).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Ineligible(IneligibleReason::BalanceBelowMinimum { .. })
        ));

        let mut account = funded_account(dollars(500));
        let open = originate(
            &policy,
            &mut account,
            &app(dollars(200), 6),
            &eligible(dollars(500)),
            Utc::now(),
        )
        .unwrap()
        .loan;
        let err = check_eligibility(&policy, dollars(300), Money::ZERO, Some(&open)).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Ineligible(IneligibleReason::OpenLoanExists { .. })
        ));

        let ok = check_eligibility(&policy, dollars(100), dollars(40), None).unwrap();
        assert_eq!(ok.portfolio_value, dollars(40));
    }

    #[test]
    fn available_subtracts_earmarks_and_open_loan() {
        let policy = LendingPolicy::default();
        let mut account = funded_account(dollars(500));
        let loan = originate(
            &policy,
            &mut account,
            &app(dollars(200), 6),
            &eligible(dollars(500)),
            Utc::now(),
        )
        .unwrap()
        .loan;
        assert_eq!(available_balance(dollars(500), dollars(50), None), dollars(450));
        assert_eq!(available_balance(dollars(300), dollars(50), Some(&loan)), dollars(50));
        assert_eq!(available_balance(dollars(100), dollars(150), None), Money::ZERO);
    }

    proptest! {
        #[test]
        fn split_sums_to_principal_and_debits_self_portion(
            balance in 100_00i64..1_000_000,
            amount in 50_00i64..2_000_00,
        ) {
            let policy = LendingPolicy::default();
            let balance = Money::from_cents(balance);
            let amount = Money::from_cents(amount);
            let mut account = funded_account(balance);

            let o = originate(&policy, &mut account, &app(amount, 6), &eligible(balance), Utc::now())
                .unwrap();

            prop_assert_eq!(
                o.loan.self_funded_amount() + o.loan.community_funded_amount(),
                o.loan.amount
            );
            prop_assert_eq!(balance - account.balance, o.loan.self_funded_amount());
            prop_assert!(o.loan.community_remaining_balance() <= o.loan.remaining_balance);
            prop_assert!(o.loan.check_invariants().is_ok());
        }
    }
}
