//! Repayment distribution.
//!
//! A payment is split across every share that still has principal outstanding,
//! in proportion to that outstanding balance (not join order):
//!
//! ```text
//! credit_i = round2(payment * outstanding_i / Σ outstanding), capped at outstanding_i
//! ```
//!
//! Each credit is rounded on its own, so the credits can drift from the
//! payment by up to one cent per share. The drift is left where it lands.

use crate::error::{LedgerError, Result};
use crate::loan::{PaymentType, WatershedLoan};
use crate::money::Money;
use crate::share::LoanShare;

/// One share's slice of a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareCredit {
    pub share_id: String,
    pub funder_id: String,
    pub is_self_funded: bool,
    pub credit: Money,
}

/// A payment's allocation across shares.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Distribution {
    pub credits: Vec<ShareCredit>,
    pub applied_to_community: Money,
    pub applied_to_self: Money,
}

impl Distribution {
    /// Sum of all share credits.
    pub fn total(&self) -> Money {
        self.applied_to_community + self.applied_to_self
    }

    /// Part of `payment` not credited to any share (fee portion plus drift).
    /// Negative when rounding pushed credits above the payment.
    pub fn residual(&self, payment: Money) -> Money {
        payment - self.total()
    }
}

/// Split `payment` across `shares` pro rata to outstanding principal.
pub fn distribute(payment: Money, shares: &[LoanShare]) -> Distribution {
    let open: Vec<&LoanShare> = shares
        .iter()
        .filter(|s| s.outstanding().is_positive())
        .collect();
    let total_outstanding: Money = open.iter().map(|s| s.outstanding()).sum();

    let mut distribution = Distribution::default();
    if !payment.is_positive() || !total_outstanding.is_positive() {
        return distribution;
    }

    for share in open {
        let outstanding = share.outstanding();
        let credit = payment
            .pro_rata(outstanding, total_outstanding)
            .min(outstanding);
        if !credit.is_positive() {
            continue;
        }
        if share.is_self_funded {
            distribution.applied_to_self += credit;
        } else {
            distribution.applied_to_community += credit;
        }
        distribution.credits.push(ShareCredit {
            share_id: share.id.clone(),
            funder_id: share.funder_id.clone(),
            is_self_funded: share.is_self_funded,
            credit,
        });
    }

    let drift = distribution.residual(payment);
    if drift.is_negative() {
        tracing::debug!(%payment, %drift, "distribution rounded above payment");
    }
    distribution
}

/// Resolve how much a repayment request actually pays.
///
/// Scheduled payments default to the monthly installment and are capped at
/// the remaining balance; payoff always pays the remaining balance.
pub fn payment_amount(
    loan: &WatershedLoan,
    payment_type: PaymentType,
    requested: Option<Money>,
) -> Result<Money> {
    let amount = match payment_type {
        PaymentType::Scheduled => requested
            .unwrap_or(loan.monthly_payment)
            .min(loan.remaining_balance),
        PaymentType::Payoff => loan.remaining_balance,
    };
    if !amount.is_positive() {
        return Err(LedgerError::validation("payment amount must be greater than zero"));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loan::{Funding, LoanStatus};
    use chrono::Utc;
    use proptest::prelude::*;

    fn dollars(d: i64) -> Money {
        Money::from_dollars_whole(d)
    }

    fn share(funder: &str, amount: Money, repaid: Money, is_self: bool) -> LoanShare {
        LoanShare {
            id: format!("share-{}", funder),
            loan_id: "loan".into(),
            funder_id: funder.into(),
            amount,
            repaid,
            is_self_funded: is_self,
            created_at: Utc::now(),
        }
    }

    fn loan(remaining: Money, monthly: Money) -> WatershedLoan {
        let now = Utc::now();
        WatershedLoan {
            id: "loan".into(),
            borrower_id: "alice".into(),
            amount: remaining,
            purpose: "car repair bill".into(),
            funding: Funding::Pure,
            remaining_balance: remaining,
            term_months: 6,
            payments_remaining: 6,
            monthly_payment: monthly,
            status: LoanStatus::Active,
            next_payment_date: None,
            recovery_payments: 0,
            recovery_started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn proportional_to_outstanding_not_join_order() {
        // self $50 outstanding, community $150 outstanding, pay $40
        let shares = vec![
            share("alice", dollars(100), dollars(50), true),
            share("bob", dollars(150), Money::ZERO, false),
        ];
        let d = distribute(dollars(40), &shares);
        assert_eq!(d.applied_to_self, dollars(10));
        assert_eq!(d.applied_to_community, dollars(30));
        assert_eq!(d.credits.len(), 2);
        assert_eq!(d.residual(dollars(40)), Money::ZERO);
    }

    #[test]
    fn skips_fully_repaid_shares() {
        let shares = vec![
            share("alice", dollars(100), dollars(100), true),
            share("bob", dollars(150), dollars(100), false),
        ];
        let d = distribute(dollars(80), &shares);
        assert_eq!(d.credits.len(), 1);
        assert_eq!(d.applied_to_self, Money::ZERO);
        // capped at bob's $50 outstanding; $30 left over
        assert_eq!(d.applied_to_community, dollars(50));
        assert_eq!(d.residual(dollars(80)), dollars(30));
    }

    #[test]
    fn nothing_outstanding_distributes_nothing() {
        let shares = vec![share("alice", dollars(100), dollars(100), true)];
        let d = distribute(dollars(10), &shares);
        assert!(d.credits.is_empty());
        assert_eq!(d.total(), Money::ZERO);
    }

    #[test]
    fn scheduled_defaults_to_installment_and_caps() {
        let l = loan(dollars(25), dollars(40));
        assert_eq!(payment_amount(&l, PaymentType::Scheduled, None).unwrap(), dollars(25));
        let l = loan(dollars(250), dollars(40));
        assert_eq!(payment_amount(&l, PaymentType::Scheduled, None).unwrap(), dollars(40));
        assert_eq!(
            payment_amount(&l, PaymentType::Scheduled, Some(dollars(100))).unwrap(),
            dollars(100)
        );
    }

    #[test]
    fn payoff_forces_remaining_balance() {
        let l = loan(dollars(25), dollars(40));
        assert_eq!(
            payment_amount(&l, PaymentType::Payoff, Some(dollars(1))).unwrap(),
            dollars(25)
        );
    }

    #[test]
    fn non_positive_amounts_rejected() {
        let l = loan(dollars(25), dollars(40));
        assert!(payment_amount(&l, PaymentType::Scheduled, Some(Money::ZERO)).is_err());
        assert!(payment_amount(&l, PaymentType::Scheduled, Some(-dollars(5))).is_err());
        let settled = loan(Money::ZERO, dollars(40));
        assert!(payment_amount(&settled, PaymentType::Payoff, None).is_err());
    }

    fn shares_strategy() -> impl Strategy<Value = Vec<LoanShare>> {
        prop::collection::vec((1i64..500_000, 0u32..=100, any::<bool>()), 1..8).prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, (amount, pct_repaid, is_self))| {
                    let amount = Money::from_cents(amount);
                    let repaid = Money::from_cents(amount.cents() * pct_repaid as i64 / 100);
                    share(&format!("f{}", i), amount, repaid, is_self && i == 0)
                })
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn credits_track_payment_within_a_cent_per_share(
            shares in shares_strategy(),
            payment in 1i64..1_000_000,
        ) {
            let payment = Money::from_cents(payment);
            let d = distribute(payment, &shares);
            let outstanding: Money = shares.iter().map(|s| s.outstanding()).sum();
            let tolerance = Money::from_cents(shares.len() as i64);

            prop_assert!(d.total() <= outstanding);
            prop_assert!(d.total() <= payment + tolerance);
            if payment <= outstanding {
                prop_assert!(d.total() + tolerance >= payment);
            }
            prop_assert_eq!(d.total(), d.credits.iter().map(|c| c.credit).sum::<Money>());
        }

        #[test]
        fn credits_never_exceed_a_share(
            shares in shares_strategy(),
            payment in 1i64..1_000_000,
        ) {
            let d = distribute(Money::from_cents(payment), &shares);
            for credit in &d.credits {
                let share = shares.iter().find(|s| s.id == credit.share_id).unwrap();
                prop_assert!(credit.credit.is_positive());
                prop_assert!(credit.credit <= share.outstanding());
                prop_assert_eq!(credit.is_self_funded, share.is_self_funded);
            }
        }
    }
}
