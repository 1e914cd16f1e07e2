//! CustodyChain - a tamper-evident ledger of product custody transfers
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Ledger
//! - [`blockchain`] - Block structure, genesis, chain state and integrity validation
//! - [`transaction`] - Transaction types, attribute bag and canonical signing bytes
//! - [`engine`] - Lock-guarded chain engine: submit, seal, mine
//! - [`history`] - Custody queries (product history, current holder)
//!
//! ## Consensus
//! - [`miner`] - Proof-of-work sealing
//!
//! ## Cryptography
//! - [`crypto`] - Signatures and verification (secp256k1)
//!
//! ## State Management
//! - [`persistence`] - Storage backends (JSON file, SQLite, in-memory)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Ledger
// ============================================================================
pub mod blockchain;
pub mod engine;
pub mod history;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod miner;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use blockchain::{Block, Blockchain};
pub use engine::{ChainEngine, EngineState, LoadReport, MinedBlock};
pub use error::{ChainError, Result};
pub use miner::{CancelToken, ProofOfWork};
pub use transaction::{AttributeValue, Signature, Transaction, TransactionRequest};
