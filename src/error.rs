//! Error types for NetherChain

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    // Validation errors: the caller can correct these and retry.
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Forged transaction: signature does not match sender")]
    ForgedTransaction,
    #[error("Insufficient balance: have {available}, need {required}")]
    InsufficientBalance { available: u64, required: u64 },
    #[error("Invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },
    #[error("Invalid parent hash")]
    InvalidParent,
    #[error("Invalid block number: expected {expected}, got {got}")]
    InvalidNumber { expected: u64, got: u64 },
    #[error("Invalid block hash")]
    InvalidHash,
    #[error("Block contains no transactions")]
    EmptyBlock,
    #[error("Transaction is not a reward transaction")]
    InvalidReward,
    #[error("Invalid proof of work")]
    InvalidProofOfWork,
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Lookups that came back empty.
    #[error("Block not found: {0}")]
    BlockNotFound(String),
    #[error("Genesis record not found")]
    GenesisNotFound,
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("Receipt not found: {0}")]
    ReceiptNotFound(String),

    #[error("Chain is already initialized")]
    AlreadyInitialized,
    #[error("Chain is not initialized")]
    NotInitialized,

    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Store is locked by another process: {0}")]
    StoreLocked(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Mining cancelled")]
    MiningCancelled,
    #[error("Mining deadline exceeded")]
    MiningTimedOut,

    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ChainError {
    /// True for lookups that found nothing, as opposed to storage failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ChainError::BlockNotFound(_)
                | ChainError::GenesisNotFound
                | ChainError::TransactionNotFound(_)
                | ChainError::ReceiptNotFound(_)
        )
    }

    /// True for rejections of caller-supplied data, which retrying unchanged won't fix.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ChainError::InvalidSignature
                | ChainError::ForgedTransaction
                | ChainError::InsufficientBalance { .. }
                | ChainError::InvalidNonce { .. }
                | ChainError::InvalidParent
                | ChainError::InvalidNumber { .. }
                | ChainError::InvalidHash
                | ChainError::EmptyBlock
                | ChainError::InvalidReward
                | ChainError::InvalidProofOfWork
                | ChainError::InvalidBlock(_)
                | ChainError::InvalidTransaction(_)
                | ChainError::InvalidAddress(_)
        )
    }

    /// True when the error stems from the mining loop being stopped rather than failing.
    pub fn is_mining_interrupted(&self) -> bool {
        matches!(self, ChainError::MiningCancelled | ChainError::MiningTimedOut)
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
