pub mod error;
pub mod ledger;

pub use error::AdmitError;
pub use ledger::{ApiKeyInfo, CreditLedger, TOKENS_PER_CREDIT};
