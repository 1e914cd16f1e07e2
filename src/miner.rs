//! Proof-of-work sealing.
//!
//! A proof for the next block is a nonce `p` such that the SHA-256 digest of
//! the decimal rendering of `previous_proof` followed by the decimal rendering
//! of `p` starts with `difficulty` zero hex digits. The search starts at 0 and
//! walks upwards, so the proof found is always the smallest valid one.
//!
//! The difficulty is fixed per process; there is no retargeting.

use crate::error::{ChainError, Result};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Reference difficulty: four leading zero hex digits.
pub const DEFAULT_DIFFICULTY: usize = 4;

/// A SHA-256 digest has 64 hex digits.
pub const MAX_DIFFICULTY: usize = 64;

/// Default iteration budget for one search.
pub const DEFAULT_MAX_ITERATIONS: u64 = 100_000_000;

/// Shared flag that aborts a running search at the next iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealStats {
    pub proof: u64,
    pub iterations: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofOfWork {
    difficulty: usize,
    max_iterations: Option<u64>,
}

impl Default for ProofOfWork {
    fn default() -> Self {
        ProofOfWork {
            difficulty: DEFAULT_DIFFICULTY,
            max_iterations: Some(DEFAULT_MAX_ITERATIONS),
        }
    }
}

impl ProofOfWork {
    pub fn new(difficulty: usize) -> Result<Self> {
        if difficulty > MAX_DIFFICULTY {
            return Err(ChainError::ConfigError(format!(
                "difficulty must be at most {}, got {}",
                MAX_DIFFICULTY, difficulty
            )));
        }
        Ok(ProofOfWork {
            difficulty,
            max_iterations: Some(DEFAULT_MAX_ITERATIONS),
        })
    }

    /// `None` removes the budget entirely.
    pub fn with_max_iterations(mut self, max_iterations: Option<u64>) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    pub fn max_iterations(&self) -> Option<u64> {
        self.max_iterations
    }

    /// Does `candidate` satisfy the work predicate after `previous_proof`?
    pub fn valid(&self, previous_proof: u64, candidate: u64) -> bool {
        leading_zero_nibbles(&proof_digest(previous_proof, candidate)) >= self.difficulty
    }

    /// Searches for the next proof with no way to abort other than the
    /// iteration budget.
    pub fn seal(&self, previous_proof: u64) -> Result<u64> {
        self.seal_with_cancel(previous_proof, &CancelToken::new())
            .map(|stats| stats.proof)
    }

    /// Searches for the next proof, checking `cancel` before every candidate.
    pub fn seal_with_cancel(
        &self,
        previous_proof: u64,
        cancel: &CancelToken,
    ) -> Result<SealStats> {
        let started = Instant::now();
        let mut iterations: u64 = 0;

        for candidate in 0..=u64::MAX {
            if cancel.is_cancelled() {
                debug!(previous_proof, iterations, "proof-of-work search cancelled");
                return Err(ChainError::SealCancelled { iterations });
            }
            if self.max_iterations.is_some_and(|max| iterations >= max) {
                break;
            }
            iterations = iterations.saturating_add(1);

            if self.valid(previous_proof, candidate) {
                return Ok(SealStats {
                    proof: candidate,
                    iterations,
                    elapsed: started.elapsed(),
                });
            }
        }

        Err(ChainError::SealerExhaustion {
            previous_proof,
            iterations,
        })
    }
}

/// SHA-256 of the concatenated decimal renderings of both proofs.
pub fn proof_digest(previous_proof: u64, candidate: u64) -> [u8; 32] {
    let guess = format!("{}{}", previous_proof, candidate);
    Sha256::digest(guess.as_bytes()).into()
}

/// Number of leading '0' characters in the hex rendering of `digest`.
fn leading_zero_nibbles(digest: &[u8; 32]) -> usize {
    let mut count = 0;
    for byte in digest {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        break;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_digest(previous_proof: u64, candidate: u64) -> String {
        hex::encode(proof_digest(previous_proof, candidate))
    }

    #[test]
    fn test_leading_zero_nibbles() {
        let mut digest = [0xffu8; 32];
        assert_eq!(leading_zero_nibbles(&digest), 0);
        digest[0] = 0x0f;
        assert_eq!(leading_zero_nibbles(&digest), 1);
        digest[0] = 0x00;
        digest[1] = 0x01;
        assert_eq!(leading_zero_nibbles(&digest), 3);
        assert_eq!(leading_zero_nibbles(&[0u8; 32]), 64);
    }

    #[test]
    fn test_valid_matches_hex_prefix() {
        let pow = ProofOfWork::new(2).unwrap();
        for candidate in 0..2_000u64 {
            let expected = hex_digest(100, candidate).starts_with("00");
            assert_eq!(pow.valid(100, candidate), expected, "candidate {}", candidate);
        }
    }

    #[test]
    fn test_seal_reference_difficulty() {
        let pow = ProofOfWork::default();
        let proof = pow.seal(100).unwrap();
        assert!(pow.valid(100, proof));
        assert!(hex_digest(100, proof).starts_with("0000"));
    }

    #[test]
    fn test_seal_returns_smallest_proof() {
        let pow = ProofOfWork::new(2).unwrap();
        let proof = pow.seal(7).unwrap();
        assert!(pow.valid(7, proof));
        assert!((0..proof).all(|p| !pow.valid(7, p)));
    }

    #[test]
    fn test_zero_difficulty_accepts_first_candidate() {
        let pow = ProofOfWork::new(0).unwrap();
        assert_eq!(pow.seal(100).unwrap(), 0);
    }

    #[test]
    fn test_difficulty_out_of_range() {
        assert!(ProofOfWork::new(MAX_DIFFICULTY + 1).is_err());
        assert!(ProofOfWork::new(MAX_DIFFICULTY).is_ok());
    }

    #[test]
    fn test_iteration_budget_exhaustion() {
        let pow = ProofOfWork::new(MAX_DIFFICULTY)
            .unwrap()
            .with_max_iterations(Some(50));
        let err = pow.seal(100).unwrap_err();
        assert!(matches!(
            err,
            ChainError::SealerExhaustion {
                previous_proof: 100,
                iterations: 50
            }
        ));
    }

    #[test]
    fn test_cancelled_search() {
        let pow = ProofOfWork::new(MAX_DIFFICULTY).unwrap().with_max_iterations(None);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = pow.seal_with_cancel(100, &cancel).unwrap_err();
        assert!(matches!(err, ChainError::SealCancelled { iterations: 0 }));
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let pow = ProofOfWork::new(MAX_DIFFICULTY).unwrap().with_max_iterations(None);
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let err = pow.seal_with_cancel(1, &cancel).unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, ChainError::SealCancelled { .. }));
    }

    #[test]
    fn test_stats_report_iterations() {
        let pow = ProofOfWork::new(1).unwrap();
        let stats = pow.seal_with_cancel(100, &CancelToken::new()).unwrap();
        assert_eq!(stats.iterations, stats.proof + 1);
    }
}
