use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `previous_hash` of the first block. Not a digest.
pub const GENESIS_PREVIOUS_HASH: &str = "1";

/// Proof recorded in the first block; the search for block 2 starts from it.
pub const GENESIS_PROOF: u64 = 100;

/// Seconds since the Unix epoch with microsecond resolution.
pub fn current_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    /// Informational only; never validated.
    pub timestamp: f64,
    pub transactions: Vec<Transaction>,
    pub proof: u64,
    pub previous_hash: String,
}

impl Block {
    pub fn new(
        index: u64,
        transactions: Vec<Transaction>,
        proof: u64,
        previous_hash: String,
    ) -> Self {
        Block {
            index,
            timestamp: current_timestamp(),
            transactions,
            proof,
            previous_hash,
        }
    }

    pub fn genesis() -> Self {
        Self::new(1, Vec::new(), GENESIS_PROOF, GENESIS_PREVIOUS_HASH.to_string())
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 1
    }

    /// JCS (RFC 8785) encoding of the whole block: keys sorted, no
    /// insignificant whitespace, ECMAScript number formatting.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_jcs::to_vec(self).map_err(|e| {
            ChainError::SerializationError(format!("Canonical block encoding failed: {}", e))
        })
    }

    /// Lowercase hex SHA-256 of the canonical encoding.
    pub fn hash(&self) -> Result<String> {
        Ok(hex::encode(Sha256::digest(self.canonical_bytes()?)))
    }
}

/// The sealed blocks plus the transactions waiting for the next seal.
///
/// Always holds at least the genesis block.
#[derive(Debug, Clone)]
pub struct Blockchain {
    blocks: Vec<Block>,
    pending: Vec<Transaction>,
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockchain {
    /// A chain holding only a fresh genesis block.
    pub fn new() -> Self {
        Blockchain {
            blocks: vec![Block::genesis()],
            pending: Vec::new(),
        }
    }

    /// Adopt previously sealed blocks. The caller is responsible for
    /// validating them; only emptiness is rejected here.
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self> {
        if blocks.is_empty() {
            return Err(ChainError::InvalidBlock(
                "A chain needs at least the genesis block".to_string(),
            ));
        }
        Ok(Blockchain {
            blocks,
            pending: Vec::new(),
        })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn pending(&self) -> &[Transaction] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn last_block(&self) -> &Block {
        &self.blocks[self.blocks.len() - 1]
    }

    /// Index the next sealed block will carry.
    pub fn next_index(&self) -> u64 {
        self.blocks.len() as u64 + 1
    }

    /// Queue a transaction; returns the index of the block that will hold it.
    pub fn push_pending(&mut self, tx: Transaction) -> u64 {
        self.pending.push(tx);
        self.next_index()
    }

    pub(crate) fn push_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// Undo a `push_block` whose persistence failed. Never removes genesis.
    pub(crate) fn pop_block(&mut self) -> Option<Block> {
        if self.blocks.len() > 1 {
            self.blocks.pop()
        } else {
            None
        }
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending.clear();
    }
}
