//! Persistent ledger storage using RocksDB.
//!
//! Reads go straight to the database. Writes are staged in a [`LedgerBatch`]
//! and land together through [`Storage::commit`], a single atomic RocksDB
//! write, so an operation either persists every row it touched or none.
//!
//! Key layout (user IDs are hex-encoded, timestamps are zero-padded nanos):
//!
//! ```text
//! loan:{loan_id}                               WatershedLoan
//! borrower:{user}:{loan_id}                    index
//! share:{loan_id}:{share_id}                   LoanShare
//! funder:{user}:{loan_id}:{share_id}           index
//! payment:{loan_id}:{ts}:{payment_id}          WatershedLoanPayment
//! pledge:{loan_id}:{pledge_id}                 Pledge
//! earmark:{user}:{loan_id}:{pledge_id}         index
//! account:{user}                               WatershedAccount
//! wtx:{user}:{ts}:{seq}:{tx_id}                WatershedTransaction
//! reserve                                      ReserveLedger
//! rtx:{ts}:{seq}:{tx_id}                       ReserveTransaction
//! ```

use crate::error::Result;
use chrono::{DateTime, Utc};
use rocksdb::{Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use watershed_ledger::{
    LoanShare, Pledge, ReserveLedger, ReserveTransaction, WatershedAccount, WatershedLoan,
    WatershedLoanPayment, WatershedTransaction,
};

const RESERVE_KEY: &[u8] = b"reserve";

/// Storage backend for ledger data.
pub struct Storage {
    db: DB,
}

impl Storage {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    /// Atomically apply every write staged in `batch`.
    pub fn commit(&self, batch: LedgerBatch) -> Result<()> {
        let LedgerBatch { batch, .. } = batch;
        self.db.write(batch)?;
        Ok(())
    }

    // --- Loans ---

    /// Get a loan by ID.
    pub fn get_loan(&self, id: &str) -> Result<Option<WatershedLoan>> {
        self.get_json(&format!("loan:{}", id))
    }

    /// All loans a user has ever taken, oldest first.
    pub fn loans_for_borrower(&self, user_id: &str) -> Result<Vec<WatershedLoan>> {
        let mut loans = Vec::new();
        for loan_id in self.scan_suffixes(&format!("borrower:{}:", user_key(user_id)))? {
            if let Some(loan) = self.get_loan(&loan_id)? {
                loans.push(loan);
            }
        }
        loans.sort_by_key(|l| l.created_at);
        Ok(loans)
    }

    // --- Shares ---

    /// All shares of a loan.
    pub fn shares_for_loan(&self, loan_id: &str) -> Result<Vec<LoanShare>> {
        self.scan_json(&format!("share:{}:", loan_id))
    }

    /// Every share a user holds, in any loan.
    pub fn shares_for_funder(&self, user_id: &str) -> Result<Vec<LoanShare>> {
        let mut shares = Vec::new();
        for suffix in self.scan_suffixes(&format!("funder:{}:", user_key(user_id)))? {
            // suffix is "{loan_id}:{share_id}"
            if let Some(share) = self.get_json(&format!("share:{}", suffix))? {
                shares.push(share);
            }
        }
        Ok(shares)
    }

    // --- Payments ---

    /// Payments against a loan, oldest first.
    pub fn payments_for_loan(&self, loan_id: &str) -> Result<Vec<WatershedLoanPayment>> {
        self.scan_json(&format!("payment:{}:", loan_id))
    }

    // --- Pledges ---

    /// All pledges against a loan.
    pub fn pledges_for_loan(&self, loan_id: &str) -> Result<Vec<Pledge>> {
        self.scan_json(&format!("pledge:{}:", loan_id))
    }

    /// All pledges a user has made.
    pub fn pledges_for_funder(&self, user_id: &str) -> Result<Vec<Pledge>> {
        let mut pledges = Vec::new();
        for suffix in self.scan_suffixes(&format!("earmark:{}:", user_key(user_id)))? {
            // suffix is "{loan_id}:{pledge_id}"
            if let Some(pledge) = self.get_json(&format!("pledge:{}", suffix))? {
                pledges.push(pledge);
            }
        }
        Ok(pledges)
    }

    // --- Watershed accounts ---

    /// Get a user's watershed account.
    pub fn get_account(&self, user_id: &str) -> Result<Option<WatershedAccount>> {
        self.get_json(&format!("account:{}", user_key(user_id)))
    }

    /// The most recent `limit` watershed transactions of a user, oldest first.
    pub fn watershed_transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<WatershedTransaction>> {
        let all: Vec<WatershedTransaction> =
            self.scan_json(&format!("wtx:{}:", user_key(user_id)))?;
        Ok(tail(all, limit))
    }

    // --- Reserve ---

    /// The reserve row, if it has been initialised.
    pub fn get_reserve(&self) -> Result<Option<ReserveLedger>> {
        match self.db.get(RESERVE_KEY)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Create the reserve row if not present.
    pub fn init_reserve(&self) -> Result<()> {
        if self.get_reserve()?.is_none() {
            let mut batch = LedgerBatch::new();
            batch.put_reserve(&ReserveLedger::new(Utc::now()))?;
            self.commit(batch)?;
        }
        Ok(())
    }

    /// The most recent `limit` reserve transactions, oldest first.
    pub fn reserve_transactions(&self, limit: usize) -> Result<Vec<ReserveTransaction>> {
        let all: Vec<ReserveTransaction> = self.scan_json("rtx:")?;
        Ok(tail(all, limit))
    }

    // --- Helpers ---

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let prefix = prefix.as_bytes();
        let mut items = Vec::new();

        let iter = self.db.prefix_iterator(prefix);
        for item in iter {
            let (key, value) = item?;
            if key.starts_with(prefix) {
                items.push(serde_json::from_slice(&value)?);
            } else {
                break;
            }
        }

        Ok(items)
    }

    /// Keys under `prefix`, with the prefix stripped.
    fn scan_suffixes(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix_bytes = prefix.as_bytes();
        let mut suffixes = Vec::new();

        let iter = self.db.prefix_iterator(prefix_bytes);
        for item in iter {
            let (key, _) = item?;
            if key.starts_with(prefix_bytes) {
                let key_str = String::from_utf8_lossy(&key);
                if let Some(suffix) = key_str.strip_prefix(prefix) {
                    suffixes.push(suffix.to_string());
                }
            } else {
                break;
            }
        }

        Ok(suffixes)
    }
}

/// Writes staged for one atomic commit.
pub struct LedgerBatch {
    batch: WriteBatch,
    writes: usize,
}

impl LedgerBatch {
    pub fn new() -> Self {
        Self {
            batch: WriteBatch::default(),
            writes: 0,
        }
    }

    /// Number of records staged.
    pub fn len(&self) -> usize {
        self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes == 0
    }

    /// Stage a loan and its borrower index entry.
    pub fn put_loan(&mut self, loan: &WatershedLoan) -> Result<()> {
        self.put_json(&format!("loan:{}", loan.id), loan)?;
        self.put_index(&format!("borrower:{}:{}", user_key(&loan.borrower_id), loan.id));
        Ok(())
    }

    /// Stage a share and its funder index entry.
    pub fn put_share(&mut self, share: &LoanShare) -> Result<()> {
        self.put_json(&format!("share:{}:{}", share.loan_id, share.id), share)?;
        self.put_index(&format!(
            "funder:{}:{}:{}",
            user_key(&share.funder_id),
            share.loan_id,
            share.id
        ));
        Ok(())
    }

    pub fn put_payment(&mut self, payment: &WatershedLoanPayment) -> Result<()> {
        let key = format!(
            "payment:{}:{}:{}",
            payment.loan_id,
            ts(payment.created_at),
            payment.id
        );
        self.put_json(&key, payment)
    }

    /// Stage a pledge and its funder earmark index entry.
    pub fn put_pledge(&mut self, pledge: &Pledge) -> Result<()> {
        self.put_json(&format!("pledge:{}:{}", pledge.loan_id, pledge.id), pledge)?;
        self.put_index(&format!(
            "earmark:{}:{}:{}",
            user_key(&pledge.funder_id),
            pledge.loan_id,
            pledge.id
        ));
        Ok(())
    }

    pub fn put_account(&mut self, account: &WatershedAccount) -> Result<()> {
        self.put_json(&format!("account:{}", user_key(&account.user_id)), account)
    }

    /// Audit rows sharing a timestamp keep the order they were staged in.
    pub fn put_watershed_tx(&mut self, tx: &WatershedTransaction) -> Result<()> {
        let key = format!(
            "wtx:{}:{}:{:06}:{}",
            user_key(&tx.user_id),
            ts(tx.created_at),
            self.writes,
            tx.id
        );
        self.put_json(&key, tx)
    }

    pub fn put_reserve(&mut self, reserve: &ReserveLedger) -> Result<()> {
        self.batch.put(RESERVE_KEY, serde_json::to_vec(reserve)?);
        self.writes += 1;
        Ok(())
    }

    pub fn put_reserve_tx(&mut self, tx: &ReserveTransaction) -> Result<()> {
        let key = format!("rtx:{}:{:06}:{}", ts(tx.created_at), self.writes, tx.id);
        self.put_json(&key, tx)
    }

    fn put_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        self.batch.put(key.as_bytes(), serde_json::to_vec(value)?);
        self.writes += 1;
        Ok(())
    }

    fn put_index(&mut self, key: &str) {
        self.batch.put(key.as_bytes(), b"");
    }
}

impl Default for LedgerBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// User IDs come from the caller; hex keeps them from colliding with separators.
fn user_key(user_id: &str) -> String {
    hex::encode(user_id.as_bytes())
}

fn ts(at: DateTime<Utc>) -> String {
    format!("{:020}", at.timestamp_nanos_opt().unwrap_or_default().max(0))
}

fn tail<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    if items.len() > limit {
        items.drain(..items.len() - limit);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use watershed_ledger::{
        originate, Eligibility, LendingPolicy, LoanApplication, Money, WatershedTxKind,
    };

    fn sample_origination(user: &str) -> (WatershedAccount, watershed_ledger::Origination) {
        let now = Utc::now();
        let mut account = WatershedAccount::new(user, now);
        account
            .credit(Money::from_dollars_whole(500), WatershedTxKind::GivingAccrual, None, None, now)
            .unwrap();
        let app = LoanApplication {
            amount: Money::from_dollars_whole(200),
            term_months: 6,
            purpose: "winter heating bill".into(),
        };
        let eligibility = Eligibility {
            available: account.balance,
            portfolio_value: Money::ZERO,
        };
        let origination =
            originate(&LendingPolicy::default(), &mut account, &app, &eligibility, now).unwrap();
        (account, origination)
    }

    #[test]
    fn loan_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let (account, o) = sample_origination("alice");

        let mut batch = LedgerBatch::new();
        batch.put_loan(&o.loan).unwrap();
        batch.put_share(&o.self_share).unwrap();
        batch.put_account(&account).unwrap();
        assert_eq!(batch.len(), 3);
        storage.commit(batch).unwrap();

        let loaded = storage.get_loan(&o.loan.id).unwrap().unwrap();
        assert_eq!(loaded, o.loan);
        assert_eq!(storage.loans_for_borrower("alice").unwrap(), vec![o.loan.clone()]);
        assert_eq!(storage.shares_for_loan(&o.loan.id).unwrap(), vec![o.self_share.clone()]);
        assert_eq!(storage.shares_for_funder("alice").unwrap(), vec![o.self_share]);
        assert_eq!(storage.get_account("alice").unwrap(), Some(account));
    }

    #[test]
    fn nothing_visible_before_commit() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let (_, o) = sample_origination("alice");

        let mut batch = LedgerBatch::new();
        batch.put_loan(&o.loan).unwrap();
        assert!(storage.get_loan(&o.loan.id).unwrap().is_none());
        drop(batch);
        assert!(storage.get_loan(&o.loan.id).unwrap().is_none());
    }

    #[test]
    fn user_prefixes_do_not_collide() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let (_, a) = sample_origination("a");
        let (_, ab) = sample_origination("a:b");

        let mut batch = LedgerBatch::new();
        batch.put_loan(&a.loan).unwrap();
        batch.put_loan(&ab.loan).unwrap();
        storage.commit(batch).unwrap();

        assert_eq!(storage.loans_for_borrower("a").unwrap().len(), 1);
        assert_eq!(storage.loans_for_borrower("a:b").unwrap().len(), 1);
    }

    #[test]
    fn recent_transactions_are_tail_of_log() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let mut account = WatershedAccount::new("alice", Utc::now());

        let mut batch = LedgerBatch::new();
        for i in 1..=5 {
            let now = Utc::now() + chrono::Duration::seconds(i);
            let tx = account
                .credit(Money::from_dollars_whole(i), WatershedTxKind::GivingAccrual, None, None, now)
                .unwrap();
            batch.put_watershed_tx(&tx).unwrap();
        }
        storage.commit(batch).unwrap();

        let recent = storage.watershed_transactions("alice", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].amount, Money::from_dollars_whole(4));
        assert_eq!(recent[1].balance_after, Money::from_dollars_whole(15));
    }

    #[test]
    fn same_instant_rows_keep_staging_order() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let now = Utc::now();
        let mut account = WatershedAccount::new("bob", now);
        let mut reserve = ReserveLedger::new(now);

        let mut batch = LedgerBatch::new();
        for i in 1..=20 {
            let tx = account
                .credit(Money::from_cents(i), WatershedTxKind::LoanRepayment, None, None, now)
                .unwrap();
            batch.put_watershed_tx(&tx).unwrap();
            let rtx = reserve
                .accrue_platform_cut(Money::from_cents(i), None, None, now)
                .unwrap();
            batch.put_reserve_tx(&rtx).unwrap();
        }
        storage.commit(batch).unwrap();

        let amounts: Vec<i64> = storage
            .watershed_transactions("bob", 20)
            .unwrap()
            .iter()
            .map(|tx| tx.amount.cents())
            .collect();
        assert_eq!(amounts, (1..=20).collect::<Vec<_>>());

        let balances: Vec<Money> = storage
            .reserve_transactions(20)
            .unwrap()
            .iter()
            .map(|tx| tx.balance_after)
            .collect();
        assert!(balances.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn reserve_initialised_once() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_reserve().unwrap();
        let first = storage.get_reserve().unwrap().unwrap();
        storage.init_reserve().unwrap();
        assert_eq!(storage.get_reserve().unwrap().unwrap(), first);
    }
}
