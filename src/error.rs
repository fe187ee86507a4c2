//! Error types for Veilchain

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    Io(String),
    Format(String),
    Empty,
    EndOfChain,
    BeginningOfChain,
    NotFound,
    PayloadTooLarge { existing: usize, requested: usize },
    Decryption(String),
    Closed,
    AccountNotFound,
    InsufficientFunds,
    NoTransactions,
    Crypto(String),
    Config(String),
    Network(String),
    Genesis(String),
    InvalidInput(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::Io(msg) => write!(f, "IO error: {}", msg),
            ChainError::Format(msg) => write!(f, "Format error: {}", msg),
            ChainError::Empty => write!(f, "Store is empty"),
            ChainError::EndOfChain => write!(f, "End of chain"),
            ChainError::BeginningOfChain => write!(f, "Beginning of chain"),
            ChainError::NotFound => write!(f, "No matching record"),
            ChainError::PayloadTooLarge { existing, requested } => write!(
                f,
                "Replacement payload is larger than the existing record ({} > {} bytes)",
                requested, existing
            ),
            ChainError::Decryption(msg) => write!(f, "Decryption failure: {}", msg),
            ChainError::Closed => write!(f, "Store is not open"),
            ChainError::AccountNotFound => write!(f, "Account does not exist"),
            ChainError::InsufficientFunds => write!(f, "Insufficient funds to transfer"),
            ChainError::NoTransactions => write!(f, "Transactions list is empty"),
            ChainError::Crypto(msg) => write!(f, "Cryptographic error: {}", msg),
            ChainError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ChainError::Network(msg) => write!(f, "Network error: {}", msg),
            ChainError::Genesis(msg) => write!(f, "Genesis creation error: {}", msg),
            ChainError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::Format(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
