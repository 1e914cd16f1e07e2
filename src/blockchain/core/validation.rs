use crate::blockchain::core::chain::{Block, GENESIS_PREVIOUS_HASH, GENESIS_PROOF};
use crate::error::{ChainError, Result};
use crate::miner::ProofOfWork;

/// Checks the genesis block is the fixed sentinel block.
pub fn validate_genesis(block: &Block) -> Result<()> {
    if block.index != 1 {
        return Err(ChainError::InvalidBlock(format!(
            "First block must have index 1, got {}",
            block.index
        )));
    }
    if block.previous_hash != GENESIS_PREVIOUS_HASH {
        return Err(ChainError::InvalidBlockLinkage(format!(
            "Genesis previous_hash must be '{}', got '{}'",
            GENESIS_PREVIOUS_HASH, block.previous_hash
        )));
    }
    if block.proof != GENESIS_PROOF {
        return Err(ChainError::InvalidBlock(format!(
            "Genesis proof must be {}, got {}",
            GENESIS_PROOF, block.proof
        )));
    }
    Ok(())
}

/// Checks that `block` may follow `previous`: dense index, hash linkage and
/// proof-of-work against the previous proof.
pub fn validate_successor(previous: &Block, block: &Block, pow: &ProofOfWork) -> Result<()> {
    if block.index != previous.index + 1 {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid block index. Expected {}, but got {}.",
            previous.index + 1,
            block.index
        )));
    }

    let expected_hash = previous.hash()?;
    if block.previous_hash != expected_hash {
        return Err(ChainError::InvalidBlockLinkage(format!(
            "Block {} previous_hash {} does not match hash of block {} ({})",
            block.index, block.previous_hash, previous.index, expected_hash
        )));
    }

    if !pow.valid(previous.proof, block.proof) {
        return Err(ChainError::InvalidProofOfWork(format!(
            "Proof {} of block {} does not satisfy difficulty {} after proof {}",
            block.proof,
            block.index,
            pow.difficulty(),
            previous.proof
        )));
    }

    for tx in &block.transactions {
        tx.validate_shape().map_err(|e| {
            ChainError::InvalidBlock(format!(
                "Block {} holds a malformed transaction: {}",
                block.index, e
            ))
        })?;
    }
    Ok(())
}

/// Full integrity check of a sealed chain.
pub fn validate_chain(blocks: &[Block], pow: &ProofOfWork) -> Result<()> {
    let genesis = blocks
        .first()
        .ok_or_else(|| ChainError::InvalidBlock("Chain contains no blocks".to_string()))?;
    validate_genesis(genesis)?;

    for pair in blocks.windows(2) {
        validate_successor(&pair[0], &pair[1], pow)?;
    }
    Ok(())
}
