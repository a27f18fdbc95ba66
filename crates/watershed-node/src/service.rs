//! Lending service: the ledger operations as atomic units of work.
//!
//! Each operation takes its locks, reads current state, runs the ledger
//! rules, stages every resulting write in one [`LedgerBatch`] and commits
//! it. Nothing is written before the commit point, so a failure anywhere
//! leaves no partial state. Events go out only after a successful commit.

use crate::error::{Error, Result};
use crate::events::{EventBus, LedgerEvent};
use crate::locks::{account_key, loan_key, user_key, KeyedLocks, RESERVE_KEY};
use crate::storage::{LedgerBatch, Storage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use watershed_ledger::id::generate_id;
use watershed_ledger::share::{self, earmarked, open_commitment, total_committed};
use watershed_ledger::{
    apply_repayment, available_balance, check_eligibility, distribute, find_open_loan, originate,
    payment_amount, state, LedgerError, LendingPolicy, LoanApplication, LoanShare, LoanStatus,
    Money, PaymentType, Pledge, RepaymentOutcome, ReserveHealth, ReserveLedger,
    ReserveTransaction, WatershedAccount, WatershedLoan, WatershedLoanPayment,
    WatershedTransaction, WatershedTxKind,
};

/// How many audit rows the read views include.
pub const RECENT_TRANSACTIONS: usize = 20;

/// Eligibility as reported to a prospective borrower.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityReport {
    pub available: Money,
    pub portfolio_value: Money,
    pub eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of a committed repayment.
#[derive(Debug, Clone)]
pub struct RepaymentReceipt {
    pub payment: WatershedLoanPayment,
    pub loan: WatershedLoan,
    pub outcome: RepaymentOutcome,
}

/// Result of a committed pledge.
#[derive(Debug, Clone)]
pub struct PledgeReceipt {
    pub share: LoanShare,
    pub pledge: Pledge,
    pub loan: WatershedLoan,
    pub fully_funded: bool,
}

/// Result of settling a loan's pledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub pledges: usize,
    pub total: Money,
}

/// A loan with its shares and payment history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanDetail {
    pub loan: WatershedLoan,
    pub shares: Vec<LoanShare>,
    pub payments: Vec<WatershedLoanPayment>,
}

/// A user's watershed with derived availability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub account: WatershedAccount,
    pub earmarked: Money,
    pub available: Money,
    pub recent_transactions: Vec<WatershedTransaction>,
}

/// Reserve state with derived coverage and health.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveSummary {
    pub balance: Money,
    pub total_inflow: Money,
    pub total_outflow: Money,
    pub total_replenished: Money,
    pub pending_disbursements: Money,
    pub coverage_ratio: Option<f64>,
    pub health: ReserveHealth,
    pub recent_transactions: Vec<ReserveTransaction>,
}

/// What a user currently has committed, as a borrower and as a funder.
struct Standing {
    account: WatershedAccount,
    earmarked: Money,
    open_loan: Option<WatershedLoan>,
}

impl Standing {
    fn available(&self) -> Money {
        available_balance(self.account.balance, self.earmarked, self.open_loan.as_ref())
    }
}

/// Accounts touched by one operation, loaded once and staged together.
struct AccountSet<'a> {
    storage: &'a Storage,
    loaded: BTreeMap<String, WatershedAccount>,
}

impl<'a> AccountSet<'a> {
    fn new(storage: &'a Storage) -> Self {
        Self {
            storage,
            loaded: BTreeMap::new(),
        }
    }

    fn get_mut(&mut self, user_id: &str, now: DateTime<Utc>) -> Result<&mut WatershedAccount> {
        match self.loaded.entry(user_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let account = self
                    .storage
                    .get_account(user_id)?
                    .unwrap_or_else(|| WatershedAccount::new(user_id, now));
                Ok(entry.insert(account))
            }
        }
    }

    fn stage(self, batch: &mut LedgerBatch) -> Result<()> {
        for account in self.loaded.values() {
            batch.put_account(account)?;
        }
        Ok(())
    }
}

/// The lending engine over persistent storage.
pub struct LendingService {
    storage: Arc<Storage>,
    policy: LendingPolicy,
    locks: KeyedLocks,
    events: EventBus,
}

impl LendingService {
    pub fn new(storage: Arc<Storage>, policy: LendingPolicy, events: EventBus) -> Self {
        Self {
            storage,
            policy,
            locks: KeyedLocks::new(),
            events,
        }
    }

    pub fn policy(&self) -> &LendingPolicy {
        &self.policy
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // --- Borrowing ---

    /// Whether `user_id` could apply for a loan right now.
    pub fn eligibility(&self, user_id: &str) -> Result<EligibilityReport> {
        let standing = self.standing(user_id, Utc::now())?;
        let available = standing.available();
        let portfolio_value = self.portfolio_value(user_id)?;

        let reason = match check_eligibility(
            &self.policy,
            available,
            portfolio_value,
            standing.open_loan.as_ref(),
        ) {
            Ok(_) => None,
            Err(LedgerError::Ineligible(reason)) => Some(reason.to_string()),
            Err(e) => return Err(e.into()),
        };

        Ok(EligibilityReport {
            available,
            portfolio_value,
            eligible: reason.is_none(),
            reason,
        })
    }

    /// Originate a loan for `user_id`.
    pub async fn apply(&self, user_id: &str, app: &LoanApplication) -> Result<WatershedLoan> {
        let _user = self.locks.lock(&user_key(user_id)).await;
        let _account = self.locks.lock(&account_key(user_id)).await;
        let now = Utc::now();

        let Standing {
            mut account,
            earmarked,
            open_loan,
        } = self.standing(user_id, now)?;
        let available = available_balance(account.balance, earmarked, open_loan.as_ref());
        let portfolio_value = self.portfolio_value(user_id)?;
        let eligibility =
            check_eligibility(&self.policy, available, portfolio_value, open_loan.as_ref())?;

        let origination = originate(&self.policy, &mut account, app, &eligibility, now)?;

        let mut batch = LedgerBatch::new();
        batch.put_loan(&origination.loan)?;
        if origination.self_share.amount.is_positive() {
            batch.put_share(&origination.self_share)?;
        }
        if let Some(debit) = &origination.debit {
            batch.put_account(&account)?;
            batch.put_watershed_tx(debit)?;
        }
        self.commit(batch, user_id, Some(origination.loan.id.as_str()))?;

        let loan = origination.loan;
        tracing::info!(
            user_id,
            loan_id = %loan.id,
            loan_type = %loan.loan_type(),
            amount = %loan.amount,
            "Loan originated"
        );
        self.events.publish(LedgerEvent::LoanOriginated {
            loan_id: loan.id.clone(),
            borrower_id: loan.borrower_id.clone(),
            loan_type: loan.loan_type(),
            amount: loan.amount,
        });
        Ok(loan)
    }

    /// Apply a repayment from the borrower and distribute it across shares.
    pub async fn repay(
        &self,
        user_id: &str,
        loan_id: &str,
        requested: Option<Money>,
        payment_type: PaymentType,
    ) -> Result<RepaymentReceipt> {
        let _loan_lock = self.locks.lock(&loan_key(loan_id)).await;

        let mut loan = self.load_loan(loan_id)?;
        if loan.borrower_id != user_id {
            return Err(Error::Forbidden(
                "only the borrower can repay this loan".to_string(),
            ));
        }
        if !loan.status.is_repayable() {
            return Err(Error::InvalidState(format!(
                "loan is {}, payments are not accepted",
                loan.status
            )));
        }

        let amount = payment_amount(&loan, payment_type, requested)?;
        let mut shares = self.storage.shares_for_loan(loan_id)?;
        let distribution = distribute(amount, &shares);

        let account_keys = distribution
            .credits
            .iter()
            .map(|c| account_key(&c.funder_id))
            .chain(std::iter::once(account_key(&loan.borrower_id)));
        let _accounts = self.locks.lock_all(account_keys).await;
        let _reserve = self.locks.lock(RESERVE_KEY).await;
        let now = Utc::now();

        let mut batch = LedgerBatch::new();
        let mut accounts = AccountSet::new(&self.storage);

        for credit in &distribution.credits {
            let share = shares
                .iter_mut()
                .find(|s| s.id == credit.share_id)
                .ok_or_else(|| Error::Invariant(format!("share {} vanished", credit.share_id)))?;
            share.apply_credit(credit.credit)?;
            batch.put_share(share)?;

            if !credit.is_self_funded {
                let tx = accounts.get_mut(&credit.funder_id, now)?.credit(
                    credit.credit,
                    WatershedTxKind::LoanRepayment,
                    Some(loan_id),
                    Some("repayment from backed loan".to_string()),
                    now,
                )?;
                batch.put_watershed_tx(&tx)?;
            }
        }
        if distribution.applied_to_self.is_positive() {
            let tx = accounts.get_mut(&loan.borrower_id, now)?.credit(
                distribution.applied_to_self,
                WatershedTxKind::LoanSelfRestore,
                Some(loan_id),
                Some("watershed restored by repayment".to_string()),
                now,
            )?;
            batch.put_watershed_tx(&tx)?;
        }
        accounts.stage(&mut batch)?;

        let residual = distribution.residual(amount);
        if residual.is_positive() {
            let mut reserve = self.load_reserve(now)?;
            let tx = reserve.accrue_platform_cut(
                residual,
                Some(loan_id),
                Some("repayment beyond share principal".to_string()),
                now,
            )?;
            batch.put_reserve(&reserve)?;
            batch.put_reserve_tx(&tx)?;
        }

        let payment = WatershedLoanPayment {
            id: generate_id("payment", now),
            loan_id: loan.id.clone(),
            payer_id: user_id.to_string(),
            amount,
            payment_type,
            applied_to_community: distribution.applied_to_community,
            applied_to_self: distribution.applied_to_self,
            created_at: now,
        };
        batch.put_payment(&payment)?;

        let outcome = apply_repayment(
            &mut loan,
            amount,
            &distribution,
            self.policy.recovery_payments_required,
            now,
        )?;
        loan.check_invariants()?;
        share::verify_shares(&loan, &shares)?;
        batch.put_loan(&loan)?;

        self.commit(batch, user_id, Some(loan_id))?;

        tracing::info!(
            user_id,
            loan_id,
            amount = %amount,
            applied_to_community = %payment.applied_to_community,
            applied_to_self = %payment.applied_to_self,
            status = %loan.status,
            "Repayment applied"
        );
        self.events.publish(LedgerEvent::RepaymentApplied {
            loan_id: loan.id.clone(),
            borrower_id: loan.borrower_id.clone(),
            amount,
        });
        if outcome.funding_lock_lifted {
            self.events.publish(LedgerEvent::FundingLockReleased {
                loan_id: loan.id.clone(),
                borrower_id: loan.borrower_id.clone(),
            });
        }
        if outcome.completed {
            self.events.publish(LedgerEvent::LoanCompleted {
                loan_id: loan.id.clone(),
                borrower_id: loan.borrower_id.clone(),
            });
        }

        Ok(RepaymentReceipt {
            payment,
            loan,
            outcome,
        })
    }

    // --- Community funding ---

    /// Pledge part of a backed loan's shortfall.
    ///
    /// The funder's watershed is earmarked, not debited. A pledge that
    /// completes the principal activates the loan and the reserve fronts the
    /// community portion.
    pub async fn pledge(&self, funder_id: &str, loan_id: &str, amount: Money) -> Result<PledgeReceipt> {
        let _loan_lock = self.locks.lock(&loan_key(loan_id)).await;
        let _account = self.locks.lock(&account_key(funder_id)).await;
        let _reserve = self.locks.lock(RESERVE_KEY).await;
        let now = Utc::now();

        let mut loan = self.load_loan(loan_id)?;
        if loan.status != LoanStatus::Funding {
            return Err(Error::InvalidState(format!(
                "loan is {}, pledges are only accepted while funding",
                loan.status
            )));
        }
        if loan.funding_deadline().is_some_and(|deadline| now > deadline) {
            return Err(Error::InvalidState("the funding window has closed".to_string()));
        }
        if loan.borrower_id == funder_id {
            return Err(Error::Validation(
                "borrowers cannot back their own loan".to_string(),
            ));
        }

        let mut shares = self.storage.shares_for_loan(loan_id)?;
        if shares.iter().any(|s| s.funder_id == funder_id) {
            return Err(Error::Validation("you already back this loan".to_string()));
        }
        let open = open_commitment(&loan, &shares);
        if !amount.is_positive() || amount > open {
            return Err(Error::Validation(format!(
                "pledge must be greater than $0.00 and at most {}",
                open
            )));
        }

        let standing = self.standing(funder_id, now)?;
        let available = standing.available();
        if amount > available {
            return Err(LedgerError::InsufficientBalance {
                available,
                requested: amount,
            }
            .into());
        }

        let share = LoanShare::community(&loan, funder_id, amount, now);
        let pledge = Pledge::for_share(&share, now);
        let mut batch = LedgerBatch::new();
        batch.put_share(&share)?;
        batch.put_pledge(&pledge)?;
        shares.push(share.clone());

        let fully_funded = total_committed(&shares) == loan.amount;
        let mut reserve_after = None;
        if fully_funded {
            state::transition(&mut loan, LoanStatus::Active, now)?;
            let mut reserve = self.load_reserve(now)?;
            let tx = reserve.front_disbursement(loan.community_funded_amount(), &loan.id, now)?;
            batch.put_reserve(&reserve)?;
            batch.put_reserve_tx(&tx)?;
            batch.put_loan(&loan)?;
            reserve_after = Some(reserve.balance);
        }
        share::verify_shares(&loan, &shares)?;

        self.commit(batch, funder_id, Some(loan_id))?;

        tracing::info!(funder_id, loan_id, amount = %amount, fully_funded, "Pledge recorded");
        if let Some(balance) = reserve_after {
            if balance.is_negative() {
                tracing::warn!(loan_id, balance = %balance, "Reserve balance is negative");
            }
            self.events.publish(LedgerEvent::LoanFunded {
                loan_id: loan.id.clone(),
                borrower_id: loan.borrower_id.clone(),
                community_funded: loan.community_funded_amount(),
            });
        }

        Ok(PledgeReceipt {
            share,
            pledge,
            loan,
            fully_funded,
        })
    }

    /// Collect every outstanding pledge of a loan the reserve has fronted.
    pub async fn settle_pledges(&self, loan_id: &str) -> Result<Settlement> {
        let _loan_lock = self.locks.lock(&loan_key(loan_id)).await;

        let loan = self.load_loan(loan_id)?;
        if matches!(loan.status, LoanStatus::Pending | LoanStatus::Funding) {
            return Err(Error::InvalidState(format!(
                "loan is {}, pledges settle only after funding closes",
                loan.status
            )));
        }
        if loan.backing().and_then(|b| b.funded_at).is_none() {
            return Err(Error::InvalidState(format!(
                "loan {} was never funded, there is nothing to collect",
                loan.id
            )));
        }

        let mut pledges: Vec<Pledge> = self
            .storage
            .pledges_for_loan(loan_id)?
            .into_iter()
            .filter(Pledge::is_outstanding)
            .collect();
        if pledges.is_empty() {
            return Ok(Settlement {
                pledges: 0,
                total: Money::ZERO,
            });
        }

        let _accounts = self
            .locks
            .lock_all(pledges.iter().map(|p| account_key(&p.funder_id)))
            .await;
        let _reserve = self.locks.lock(RESERVE_KEY).await;
        let now = Utc::now();

        let mut batch = LedgerBatch::new();
        let mut accounts = AccountSet::new(&self.storage);
        let mut total = Money::ZERO;
        for pledge in &mut pledges {
            let tx = accounts.get_mut(&pledge.funder_id, now)?.debit(
                pledge.amount,
                WatershedTxKind::PledgeSettlement,
                Some(loan_id),
                Some("pledge collected".to_string()),
                now,
            )?;
            batch.put_watershed_tx(&tx)?;
            pledge.mark_disbursed(now);
            batch.put_pledge(pledge)?;
            total += pledge.amount;
        }
        accounts.stage(&mut batch)?;

        let mut reserve = self.load_reserve(now)?;
        let tx = reserve.clear_revenue(
            total,
            Some(loan_id),
            Some("pledged principal collected".to_string()),
            now,
        )?;
        batch.put_reserve(&reserve)?;
        batch.put_reserve_tx(&tx)?;

        self.commit(batch, "admin", Some(loan_id))?;

        tracing::info!(loan_id, pledges = pledges.len(), total = %total, "Pledges settled");
        Ok(Settlement {
            pledges: pledges.len(),
            total,
        })
    }

    // --- External transitions ---

    /// Apply a delinquency-scan or funding-reaper status change.
    pub async fn transition(&self, loan_id: &str, to: LoanStatus) -> Result<WatershedLoan> {
        let _loan_lock = self.locks.lock(&loan_key(loan_id)).await;
        let now = Utc::now();

        let mut loan = self.load_loan(loan_id)?;
        let from = loan.status;
        if to == LoanStatus::Active && matches!(from, LoanStatus::Pending | LoanStatus::Funding) {
            let shares = self.storage.shares_for_loan(loan_id)?;
            let open = open_commitment(&loan, &shares);
            if open.is_positive() {
                return Err(Error::InvalidState(format!(
                    "loan still needs {} of community funding",
                    open
                )));
            }
        }
        state::transition(&mut loan, to, now)?;

        let mut batch = LedgerBatch::new();
        batch.put_loan(&loan)?;

        // A loan reaped before funding completes frees its backers' earmarks.
        let mut released = 0usize;
        if from == LoanStatus::Funding && to == LoanStatus::Defaulted {
            for mut pledge in self.storage.pledges_for_loan(loan_id)? {
                if pledge.is_outstanding() {
                    pledge.release(now);
                    batch.put_pledge(&pledge)?;
                    released += 1;
                }
            }
        }
        self.commit(batch, "admin", Some(loan_id))?;

        tracing::info!(loan_id, from = %from, to = %to, released, "Loan status changed");
        Ok(loan)
    }

    // --- Watershed ---

    /// Record giving-platform inflow into a user's watershed.
    pub async fn credit_watershed(
        &self,
        user_id: &str,
        amount: Money,
        description: Option<String>,
    ) -> Result<WatershedTransaction> {
        let _account = self.locks.lock(&account_key(user_id)).await;
        let now = Utc::now();

        let mut account = self
            .storage
            .get_account(user_id)?
            .unwrap_or_else(|| WatershedAccount::new(user_id, now));
        let tx = account.credit(amount, WatershedTxKind::GivingAccrual, None, description, now)?;

        let mut batch = LedgerBatch::new();
        batch.put_account(&account)?;
        batch.put_watershed_tx(&tx)?;
        self.commit(batch, user_id, None)?;

        tracing::info!(user_id, amount = %amount, balance = %account.balance, "Watershed credited");
        Ok(tx)
    }

    /// A user's account, availability and recent transactions.
    pub fn account(&self, user_id: &str) -> Result<AccountView> {
        let standing = self.standing(user_id, Utc::now())?;
        let available = standing.available();
        Ok(AccountView {
            recent_transactions: self
                .storage
                .watershed_transactions(user_id, RECENT_TRANSACTIONS)?,
            earmarked: standing.earmarked,
            available,
            account: standing.account,
        })
    }

    /// A loan with shares and payments. Only the borrower may see it.
    pub fn loan_detail(&self, user_id: &str, loan_id: &str) -> Result<LoanDetail> {
        let loan = self.load_loan(loan_id)?;
        if loan.borrower_id != user_id {
            return Err(Error::Forbidden("this loan belongs to another user".to_string()));
        }
        Ok(LoanDetail {
            shares: self.storage.shares_for_loan(loan_id)?,
            payments: self.storage.payments_for_loan(loan_id)?,
            loan,
        })
    }

    // --- Reserve ---

    pub async fn accrue_platform_cut(
        &self,
        amount: Money,
        description: Option<String>,
    ) -> Result<ReserveTransaction> {
        self.with_reserve(|reserve, now| reserve.accrue_platform_cut(amount, None, description, now))
            .await
    }

    pub async fn clear_revenue(
        &self,
        amount: Money,
        description: Option<String>,
    ) -> Result<ReserveTransaction> {
        self.with_reserve(|reserve, now| reserve.clear_revenue(amount, None, description, now))
            .await
    }

    pub async fn adjust_reserve(
        &self,
        amount: Money,
        description: &str,
    ) -> Result<ReserveTransaction> {
        self.with_reserve(|reserve, now| reserve.adjust(amount, description, now))
            .await
    }

    pub fn reserve_summary(&self) -> Result<ReserveSummary> {
        let reserve = self.load_reserve(Utc::now())?;
        Ok(ReserveSummary {
            balance: reserve.balance,
            total_inflow: reserve.total_inflow,
            total_outflow: reserve.total_outflow,
            total_replenished: reserve.total_replenished,
            pending_disbursements: reserve.pending_disbursements,
            coverage_ratio: reserve.coverage_ratio(),
            health: reserve.health(&self.policy.reserve_bands),
            recent_transactions: self.storage.reserve_transactions(RECENT_TRANSACTIONS)?,
        })
    }

    async fn with_reserve<F>(&self, op: F) -> Result<ReserveTransaction>
    where
        F: FnOnce(&mut ReserveLedger, DateTime<Utc>) -> watershed_ledger::Result<ReserveTransaction>,
    {
        let _reserve = self.locks.lock(RESERVE_KEY).await;
        let now = Utc::now();

        let mut reserve = self.load_reserve(now)?;
        let tx = op(&mut reserve, now)?;

        let mut batch = LedgerBatch::new();
        batch.put_reserve(&reserve)?;
        batch.put_reserve_tx(&tx)?;
        self.commit(batch, "admin", None)?;

        tracing::info!(kind = %tx.kind, amount = %tx.amount, balance = %tx.balance_after, "Reserve updated");
        if reserve.balance.is_negative() {
            tracing::warn!(balance = %reserve.balance, "Reserve balance is negative");
        }
        Ok(tx)
    }

    // --- Helpers ---

    fn load_loan(&self, loan_id: &str) -> Result<WatershedLoan> {
        self.storage
            .get_loan(loan_id)?
            .ok_or_else(|| Error::NotFound(format!("loan {} not found", loan_id)))
    }

    fn load_reserve(&self, now: DateTime<Utc>) -> Result<ReserveLedger> {
        Ok(self
            .storage
            .get_reserve()?
            .unwrap_or_else(|| ReserveLedger::new(now)))
    }

    fn standing(&self, user_id: &str, now: DateTime<Utc>) -> Result<Standing> {
        let account = self
            .storage
            .get_account(user_id)?
            .unwrap_or_else(|| WatershedAccount::new(user_id, now));
        let earmarked = earmarked(&self.storage.pledges_for_funder(user_id)?);
        let loans = self.storage.loans_for_borrower(user_id)?;
        let open_loan = find_open_loan(&loans).cloned();
        Ok(Standing {
            account,
            earmarked,
            open_loan,
        })
    }

    fn portfolio_value(&self, user_id: &str) -> Result<Money> {
        let mut holdings = Vec::new();
        for share in self.storage.shares_for_funder(user_id)? {
            if let Some(loan) = self.storage.get_loan(&share.loan_id)? {
                holdings.push((share, loan));
            }
        }
        Ok(share::portfolio_value(
            user_id,
            holdings.iter().map(|(s, l)| (s, l)),
        ))
    }

    fn commit(&self, batch: LedgerBatch, user_id: &str, loan_id: Option<&str>) -> Result<()> {
        let writes = batch.len();
        self.storage.commit(batch).map_err(|e| {
            tracing::error!(user_id, loan_id, writes, "Ledger commit failed: {}", e);
            e
        })
    }
}
