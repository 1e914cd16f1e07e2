//! The chain engine: sole owner of the sealed chain and the pending buffer.
//!
//! Submissions, seals and the persistence write that follows a seal all run
//! under one mutex. Proof-of-work searches run outside it; a proof found for a
//! tip that has since moved is refused at seal time.

use crate::blockchain::{validate_chain, Block, Blockchain};
use crate::config::Config;
use crate::error::{ChainError, Result};
use crate::history;
use crate::miner::{CancelToken, ProofOfWork, SealStats};
use crate::persistence::{open_backend, Persistence};
use crate::transaction::{Transaction, TransactionRequest};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Genesis present, nothing pending.
    Initialized,
    /// Transactions are waiting for the next seal.
    Sealing,
}

/// How the chain was obtained when the engine opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadReport {
    Loaded { blocks: usize },
    /// Nothing was stored; a genesis block was created and persisted.
    CreatedGenesis,
    /// The store was unreadable. A fresh genesis chain replaced it.
    RecoveredFromCorruption {
        reason: String,
        quarantined: Option<String>,
    },
}

/// A sealed block together with the search that produced its proof.
#[derive(Debug, Clone)]
pub struct MinedBlock {
    pub block: Block,
    pub stats: SealStats,
}

/// Tip summary for dashboards.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSummary {
    pub length: usize,
    pub total_transactions: usize,
    pub pending: usize,
    pub last_block: Block,
}

pub struct ChainEngine {
    chain: Mutex<Blockchain>,
    persistence: Box<dyn Persistence>,
    sealer: ProofOfWork,
    node_id: String,
}

impl std::fmt::Debug for ChainEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainEngine")
            .field("sealer", &self.sealer)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl ChainEngine {
    /// Load the chain from `persistence`, creating or recovering a genesis
    /// chain when nothing usable is stored.
    pub fn open(
        persistence: Box<dyn Persistence>,
        sealer: ProofOfWork,
    ) -> Result<(Self, LoadReport)> {
        let location = persistence.describe();

        let (chain, report) = match persistence.load() {
            Ok(Some(blocks)) => match validate_chain(&blocks, &sealer) {
                Ok(()) => {
                    let count = blocks.len();
                    info!(store = %location, blocks = count, "loaded chain");
                    (Blockchain::from_blocks(blocks)?, LoadReport::Loaded { blocks: count })
                }
                Err(e) => {
                    Self::reject_difficulty_mismatch(&blocks, &sealer, &e)?;
                    Self::recover(persistence.as_ref(), e.to_string())?
                }
            },
            Ok(None) => {
                let chain = Blockchain::new();
                persistence.save(chain.blocks())?;
                info!(store = %location, "no stored chain found, created genesis block");
                (chain, LoadReport::CreatedGenesis)
            }
            Err(ChainError::CorruptPersistedChain(reason)) => {
                Self::recover(persistence.as_ref(), reason)?
            }
            Err(e) => return Err(e),
        };

        let engine = ChainEngine {
            chain: Mutex::new(chain),
            persistence,
            sealer,
            node_id: crate::config::random_node_identifier(),
        };
        Ok((engine, report))
    }

    /// Blocks that are linked and indexed correctly but whose proofs miss the
    /// configured difficulty were sealed under another setting. Opening them
    /// fails instead of discarding the ledger.
    fn reject_difficulty_mismatch(
        blocks: &[Block],
        sealer: &ProofOfWork,
        cause: &ChainError,
    ) -> Result<()> {
        if validate_chain(blocks, &ProofOfWork::new(0)?).is_err() {
            return Ok(());
        }
        error!(
            difficulty = sealer.difficulty(),
            blocks = blocks.len(),
            "stored chain does not meet the configured difficulty"
        );
        Err(ChainError::ConfigError(format!(
            "stored chain of {} blocks does not meet mining.difficulty = {} ({}); \
             restore the difficulty it was sealed with",
            blocks.len(),
            sealer.difficulty(),
            cause
        )))
    }

    fn recover(persistence: &dyn Persistence, reason: String) -> Result<(Blockchain, LoadReport)> {
        warn!(
            store = %persistence.describe(),
            %reason,
            "stored chain is corrupt; discarding it and starting a fresh genesis chain"
        );
        let quarantined = persistence.quarantine()?;
        if let Some(place) = &quarantined {
            warn!(moved_to = %place, "corrupt chain content preserved");
        }

        let chain = Blockchain::new();
        persistence.save(chain.blocks())?;
        Ok((chain, LoadReport::RecoveredFromCorruption { reason, quarantined }))
    }

    /// Open the backend, sealer and node label named by `config`.
    pub fn from_config(config: &Config) -> Result<(Self, LoadReport)> {
        let persistence = open_backend(&config.storage)?;
        let sealer = config.sealer()?;
        let (engine, report) = Self::open(persistence, sealer)?;
        Ok((engine.with_node_id(config.node_identifier()), report))
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn sealer(&self) -> &ProofOfWork {
        &self.sealer
    }

    pub fn storage_location(&self) -> String {
        self.persistence.describe()
    }

    pub fn state(&self) -> EngineState {
        if self.chain.lock().pending().is_empty() {
            EngineState::Initialized
        } else {
            EngineState::Sealing
        }
    }

    /// Admit `tx` to the pending buffer. Returns the index of the block that
    /// will hold it. Rejected transactions leave the engine untouched.
    pub fn submit_transaction(&self, tx: Transaction, public_key: Option<&str>) -> Result<u64> {
        if let Err(e) = tx.validate(public_key) {
            debug!(
                sender = %tx.sender,
                product_id = %tx.product_id,
                error = %e,
                "transaction refused"
            );
            return Err(e);
        }

        let mut chain = self.chain.lock();
        let index = chain.push_pending(tx);
        debug!(target_block = index, pending = chain.pending().len(), "transaction accepted");
        Ok(index)
    }

    /// Boundary variant taking the hex-encoded request form.
    pub fn submit_request(&self, request: TransactionRequest) -> Result<u64> {
        let (tx, public_key) = request.into_parts()?;
        self.submit_transaction(tx, public_key.as_deref())
    }

    /// Seal every pending transaction into a new block on top of the tip.
    ///
    /// The block is durable before this returns `Ok`. If the write fails the
    /// chain and the pending buffer are exactly as they were.
    pub fn seal_block(&self, proof: u64, previous_hash: Option<&str>) -> Result<Block> {
        let mut chain = self.chain.lock();
        self.seal_locked(&mut chain, proof, previous_hash, None)
    }

    /// Search a proof for the current tip. The lock is not held during the search.
    pub fn find_proof(&self, cancel: &CancelToken) -> Result<SealStats> {
        let previous_proof = self.chain.lock().last_block().proof;
        self.sealer.seal_with_cancel(previous_proof, cancel)
    }

    /// Search a proof, then seal the pending buffer as it stands. No reward
    /// is added.
    pub fn seal_pending(&self, cancel: &CancelToken) -> Result<MinedBlock> {
        self.search_and_seal(None, cancel)
    }

    /// Search a proof, then seal the pending buffer plus a reward for
    /// `reward_recipient` (this node's identifier when `None`).
    pub fn mine(&self, reward_recipient: Option<&str>, cancel: &CancelToken) -> Result<MinedBlock> {
        let reward = Transaction::mining_reward(reward_recipient.unwrap_or(&self.node_id));
        self.search_and_seal(Some(reward), cancel)
    }

    /// If another seal lands while the search runs, nothing is sealed and
    /// `InvalidProofOfWork` is returned.
    fn search_and_seal(
        &self,
        reward: Option<Transaction>,
        cancel: &CancelToken,
    ) -> Result<MinedBlock> {
        let (tip_index, tip_proof) = {
            let chain = self.chain.lock();
            (chain.last_block().index, chain.last_block().proof)
        };
        let stats = self.sealer.seal_with_cancel(tip_proof, cancel)?;

        let mut chain = self.chain.lock();
        if chain.last_block().index != tip_index {
            return Err(ChainError::InvalidProofOfWork(format!(
                "Proof {} was found for block {} but the tip is now block {}",
                stats.proof,
                tip_index,
                chain.last_block().index
            )));
        }
        let block = self.seal_locked(&mut chain, stats.proof, None, reward)?;
        debug!(iterations = stats.iterations, elapsed = ?stats.elapsed, "proof search finished");
        Ok(MinedBlock { block, stats })
    }

    fn seal_locked(
        &self,
        chain: &mut Blockchain,
        proof: u64,
        previous_hash: Option<&str>,
        reward: Option<Transaction>,
    ) -> Result<Block> {
        let tip = chain.last_block();
        if !self.sealer.valid(tip.proof, proof) {
            return Err(ChainError::InvalidProofOfWork(format!(
                "Proof {} does not satisfy difficulty {} after proof {} of block {}",
                proof,
                self.sealer.difficulty(),
                tip.proof,
                tip.index
            )));
        }

        let tip_hash = tip.hash()?;
        let previous_hash = match previous_hash {
            Some(given) if given != tip_hash => {
                return Err(ChainError::InvalidBlockLinkage(format!(
                    "previous_hash {} does not match tip block {} ({})",
                    given, tip.index, tip_hash
                )))
            }
            _ => tip_hash,
        };

        let mut transactions = chain.pending().to_vec();
        transactions.extend(reward);
        let block = Block::new(chain.next_index(), transactions, proof, previous_hash);

        chain.push_block(block.clone());
        if let Err(e) = self.persistence.save(chain.blocks()) {
            chain.pop_block();
            error!(
                store = %self.persistence.describe(),
                index = block.index,
                error = %e,
                "failed to persist sealed block; seal rolled back"
            );
            return Err(e);
        }
        chain.clear_pending();

        info!(
            index = block.index,
            transactions = block.transactions.len(),
            proof = block.proof,
            "sealed block"
        );
        Ok(block)
    }

    pub fn hash(&self, block: &Block) -> Result<String> {
        block.hash()
    }

    /// Snapshot of every sealed block.
    pub fn get_chain(&self) -> Vec<Block> {
        self.chain.lock().blocks().to_vec()
    }

    /// Run `f` over the sealed blocks without copying them.
    pub fn with_chain<R>(&self, f: impl FnOnce(&[Block]) -> R) -> R {
        f(self.chain.lock().blocks())
    }

    pub fn block(&self, index: u64) -> Option<Block> {
        let chain = self.chain.lock();
        let position = usize::try_from(index).ok()?.checked_sub(1)?;
        chain.blocks().get(position).cloned()
    }

    pub fn last_block(&self) -> Block {
        self.chain.lock().last_block().clone()
    }

    pub fn len(&self) -> usize {
        self.chain.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.lock().is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.chain.lock().pending().len()
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.chain.lock().pending().to_vec()
    }

    pub fn summary(&self) -> ChainSummary {
        let chain = self.chain.lock();
        ChainSummary {
            length: chain.len(),
            total_transactions: chain.blocks().iter().map(|b| b.transactions.len()).sum(),
            pending: chain.pending().len(),
            last_block: chain.last_block().clone(),
        }
    }

    /// Re-check linkage, indices and proofs of the in-memory chain.
    pub fn validate(&self) -> Result<()> {
        let chain = self.chain.lock();
        validate_chain(chain.blocks(), &self.sealer)
    }

    /// Build (but do not submit) a transfer of `product_id` from its current
    /// holder `sender` to `new_owner`, carrying over the product details.
    pub fn prepare_transfer(
        &self,
        product_id: &str,
        sender: &str,
        new_owner: &str,
    ) -> Result<Transaction> {
        self.with_chain(|blocks| history::prepare_transfer(blocks, product_id, sender, new_owner))
    }
}
