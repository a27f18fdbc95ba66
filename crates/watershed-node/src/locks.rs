//! Keyed async locks.
//!
//! Every read-modify-commit sequence holds the locks for the records it
//! touches. Keys are namespaced by class and classes are always taken in
//! the same order, `user:` → `loan:` → `account:` → `reserve`, with keys of
//! one class locked in sorted order. That ordering is what keeps concurrent
//! operations deadlock-free.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Entries are pruned once the table grows past this many keys.
const PRUNE_THRESHOLD: usize = 1024;

/// Lock key for a borrower's origination.
pub fn user_key(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// Lock key for a loan and its shares, pledges and payments.
pub fn loan_key(loan_id: &str) -> String {
    format!("loan:{}", loan_id)
}

/// Lock key for a watershed account.
pub fn account_key(user_id: &str) -> String {
    format!("account:{}", user_id)
}

/// Lock key for the reserve row.
pub const RESERVE_KEY: &str = "reserve";

/// Held locks; released on drop.
#[must_use = "locks are released as soon as the guard is dropped"]
pub struct LockSet {
    _guards: Vec<OwnedMutexGuard<()>>,
}

/// A table of async mutexes created on demand per key.
#[derive(Default)]
pub struct KeyedLocks {
    table: StdMutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock a single key.
    pub async fn lock(&self, key: &str) -> LockSet {
        LockSet {
            _guards: vec![self.handle(key).lock_owned().await],
        }
    }

    /// Lock several keys of one class, in sorted order, skipping duplicates.
    pub async fn lock_all<I, S>(&self, keys: I) -> LockSet
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: BTreeSet<String> = keys.into_iter().map(Into::into).collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.handle(&key).lock_owned().await);
        }
        LockSet { _guards: guards }
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn handle(&self, key: &str) -> Arc<Mutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = table.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        let mutex = Arc::new(Mutex::new(()));
        table.insert(key.to_string(), Arc::downgrade(&mutex));
        if table.len() > PRUNE_THRESHOLD {
            table.retain(|_, weak| weak.strong_count() > 0);
        }
        mutex
    }
}
