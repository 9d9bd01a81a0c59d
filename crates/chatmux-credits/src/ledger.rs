//! In-memory API-key table with credit accounting.
//!
//! Balances are deliberately not persisted — keys live for the process
//! lifetime and top-ups flow through `add_credits` (also the interface an
//! external payment watcher would write through).

use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use tracing::info;

use crate::error::AdmitError;

/// $2 per 1M tokens at $1 = 1 credit.
pub const TOKENS_PER_CREDIT: f64 = 500_000.0;

/// One issued API key and its usage counters.
#[derive(Debug, Clone)]
pub struct ApiKeyInfo {
    pub key: String,
    pub user_id: String,
    pub credits: f64,
    pub total_tokens_used: u64,
    pub enabled: bool,
    pub created_at: i64,
}

impl ApiKeyInfo {
    fn has_sufficient_credits(&self, estimated_tokens: u64) -> bool {
        self.enabled && self.credits >= estimated_tokens as f64 / TOKENS_PER_CREDIT
    }

    /// Deduct iff the balance covers the cost; a failed debit changes nothing.
    fn debit(&mut self, tokens_used: u64) -> bool {
        let credit_cost = tokens_used as f64 / TOKENS_PER_CREDIT;
        if self.credits >= credit_cost {
            self.credits -= credit_cost;
            self.total_tokens_used += tokens_used;
            true
        } else {
            false
        }
    }
}

/// Owns the key table. Every operation is linearizable under one mutex.
pub struct CreditLedger {
    keys: Mutex<HashMap<String, ApiKeyInfo>>,
}

impl Default for CreditLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl CreditLedger {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a new `cm-` key for a user with an optional starting balance.
    pub fn create(&self, user_id: &str, initial_credits: f64) -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let key = format!("cm-{}", URL_SAFE_NO_PAD.encode(raw));

        let mut keys = self.keys.lock().unwrap();
        keys.insert(
            key.clone(),
            ApiKeyInfo {
                key: key.clone(),
                user_id: user_id.to_string(),
                credits: initial_credits,
                total_tokens_used: 0,
                enabled: true,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        info!(user_id, "created new API key");
        key
    }

    /// Snapshot of a key's state, if it exists.
    pub fn info(&self, api_key: &str) -> Option<ApiKeyInfo> {
        self.keys.lock().unwrap().get(api_key).cloned()
    }

    /// True iff the key exists, is enabled, and covers the estimate.
    pub fn validate(&self, api_key: &str, estimated_tokens: u64) -> bool {
        self.keys
            .lock()
            .unwrap()
            .get(api_key)
            .map(|k| k.has_sufficient_credits(estimated_tokens))
            .unwrap_or(false)
    }

    /// Like `validate` but reports why admission failed, so the frontend can
    /// distinguish 401 / 403 / 402.
    pub fn admit(&self, api_key: &str, estimated_tokens: u64) -> Result<(), AdmitError> {
        let keys = self.keys.lock().unwrap();
        let key_info = keys.get(api_key).ok_or(AdmitError::UnknownKey)?;
        if !key_info.enabled {
            return Err(AdmitError::Disabled);
        }
        if !key_info.has_sufficient_credits(estimated_tokens) {
            return Err(AdmitError::InsufficientCredits);
        }
        Ok(())
    }

    /// Debit the key by the observed token count. Returns false when the key
    /// is unknown or the balance is insufficient; state is untouched on failure.
    pub fn debit(&self, api_key: &str, tokens_used: u64) -> bool {
        let mut keys = self.keys.lock().unwrap();
        match keys.get_mut(api_key) {
            Some(key_info) => {
                let ok = key_info.debit(tokens_used);
                if ok {
                    info!(tokens_used, "debited tokens from API key");
                }
                ok
            }
            None => false,
        }
    }

    pub fn add_credits(&self, api_key: &str, amount: f64) -> bool {
        let mut keys = self.keys.lock().unwrap();
        match keys.get_mut(api_key) {
            Some(key_info) => {
                key_info.credits += amount;
                info!(amount, "added credits to API key");
                true
            }
            None => false,
        }
    }

    pub fn enable(&self, api_key: &str) -> bool {
        self.set_enabled(api_key, true)
    }

    pub fn disable(&self, api_key: &str) -> bool {
        self.set_enabled(api_key, false)
    }

    fn set_enabled(&self, api_key: &str, enabled: bool) -> bool {
        let mut keys = self.keys.lock().unwrap();
        match keys.get_mut(api_key) {
            Some(key_info) => {
                key_info.enabled = enabled;
                info!(enabled, "toggled API key");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_keys_carry_the_cm_prefix() {
        let ledger = CreditLedger::new();
        let key = ledger.create("user-1", 5.0);
        assert!(key.starts_with("cm-"));
        // 32 random bytes → 43 unpadded base64url chars
        assert_eq!(key.len(), 3 + 43);

        let info = ledger.info(&key).unwrap();
        assert_eq!(info.user_id, "user-1");
        assert_eq!(info.credits, 5.0);
        assert_eq!(info.total_tokens_used, 0);
        assert!(info.enabled);
    }

    #[test]
    fn debit_sequence_is_exact_and_never_negative() {
        let ledger = CreditLedger::new();
        let key = ledger.create("u", 1.0);

        assert!(ledger.debit(&key, 250_000));
        assert!(ledger.debit(&key, 250_000));
        let info = ledger.info(&key).unwrap();
        assert!(info.credits.abs() < 1e-9, "balance should be zero, got {}", info.credits);
        assert_eq!(info.total_tokens_used, 500_000);

        // Balance exhausted: further debits fail and mutate nothing.
        assert!(!ledger.debit(&key, 1_000_000));
        let info = ledger.info(&key).unwrap();
        assert!(info.credits >= 0.0);
        assert_eq!(info.total_tokens_used, 500_000);
    }

    #[test]
    fn admit_distinguishes_failure_modes() {
        let ledger = CreditLedger::new();
        assert_eq!(ledger.admit("cm-nope", 1), Err(AdmitError::UnknownKey));

        let key = ledger.create("u", 0.000001);
        // 1000 estimated tokens cost 0.002 credits — more than the balance.
        assert_eq!(ledger.admit(&key, 1000), Err(AdmitError::InsufficientCredits));

        ledger.add_credits(&key, 1.0);
        assert_eq!(ledger.admit(&key, 1000), Ok(()));

        ledger.disable(&key);
        assert_eq!(ledger.admit(&key, 1000), Err(AdmitError::Disabled));
        assert!(!ledger.validate(&key, 1000));

        ledger.enable(&key);
        assert_eq!(ledger.admit(&key, 1000), Ok(()));
    }

    #[test]
    fn disabled_keys_reject_debit_via_validate_only() {
        // debit() itself is balance-gated, not enabled-gated; admission happens
        // before dispatch, so a disabled key never reaches debit in practice.
        let ledger = CreditLedger::new();
        let key = ledger.create("u", 1.0);
        ledger.disable(&key);
        assert!(!ledger.validate(&key, 1));
    }

    #[test]
    fn add_credits_unknown_key() {
        let ledger = CreditLedger::new();
        assert!(!ledger.add_credits("cm-ghost", 1.0));
        assert!(!ledger.enable("cm-ghost"));
        assert!(!ledger.disable("cm-ghost"));
        assert!(!ledger.debit("cm-ghost", 1));
    }
}
