//! Round-robin pool of Copilot accounts.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::account::Account;

struct PoolInner {
    accounts: Vec<Arc<Account>>,
    cursor: usize,
}

/// The lock is held only for the duration of a walk — never across an await.
pub struct AccountPool {
    inner: Mutex<PoolInner>,
}

impl Default for AccountPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                accounts: Vec::new(),
                cursor: 0,
            }),
        }
    }

    /// Re-adding a credential that is already pooled is a no-op.
    pub fn add(&self, account: Arc<Account>) {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .accounts
            .iter()
            .any(|a| a.refresh_token() == account.refresh_token())
        {
            debug!(account = %account.id, "account already pooled, skipping");
            return;
        }
        inner.accounts.push(account);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk from the cursor and return the first usable account, advancing
    /// the cursor one past the hit so every account sees service.
    pub fn next_usable(&self, now: i64) -> Option<Arc<Account>> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.accounts.len();
        if n == 0 {
            return None;
        }

        for _ in 0..n {
            let i = inner.cursor;
            inner.cursor = (i + 1) % n;

            let account = inner.accounts[i].clone();
            if account.is_usable(now) {
                account.touch(now);
                debug!(account = %account.id, "account selected");
                return Some(account);
            }
        }

        warn!("no usable accounts after checking the full pool");
        None
    }

    pub fn has_usable(&self, now: i64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.accounts.iter().any(|a| a.is_usable(now))
    }
}
