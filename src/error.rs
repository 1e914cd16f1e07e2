//! Error types for CustodyChain

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// Signature missing or invalid for a sender that is not the system sentinel.
    #[error("Rejected transaction: {0}")]
    RejectedTransaction(String),
    #[error("Malformed signature encoding: {0}")]
    MalformedSignatureEncoding(String),
    #[error("Corrupt persisted chain: {0}")]
    CorruptPersistedChain(String),
    /// The store could not be written. The seal that triggered the write was not committed.
    #[error("Persistence write failure: {0}")]
    PersistenceWriteFailure(String),
    #[error("Proof-of-work search exhausted after {iterations} tries from proof {previous_proof}")]
    SealerExhaustion { previous_proof: u64, iterations: u64 },
    #[error("Proof-of-work search cancelled after {iterations} iterations")]
    SealCancelled { iterations: u64 },
    #[error("Invalid proof of work: {0}")]
    InvalidProofOfWork(String),
    #[error("Invalid block linkage: {0}")]
    InvalidBlockLinkage(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ChainError {
    /// True for the two ways a submitted transaction is turned away.
    /// Neither is fatal and neither mutates the chain.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ChainError::RejectedTransaction(_) | ChainError::MalformedSignatureEncoding(_)
        )
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
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

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
