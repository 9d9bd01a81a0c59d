use thiserror::Error;

/// Why a request was refused admission at the credit gate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("unknown API key")]
    UnknownKey,

    #[error("API key is disabled")]
    Disabled,

    #[error("insufficient credits for estimated token usage")]
    InsufficientCredits,
}
