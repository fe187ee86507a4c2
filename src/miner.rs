//! Proof-of-work mining engine
//!
//! One independent worker per configured thread. A worker remembers its
//! target (the current top block when it last looked), derives candidate
//! digests from a nonce it keeps mutating, and submits qualifying candidates
//! through [`Chain::try_extend`]. A candidate qualifies when its leading
//! `difficulty` BYTES are zero (difficulty is a byte count here, not a bit
//! count) and it is strictly smaller than the remembered target hash.
//!
//! Losing the extension race to another worker is normal: the worker just
//! keeps searching against its remembered target until it wins one, at which
//! point it re-fetches the new top block. The loop has no natural end; a
//! shared stop flag, checked once per iteration, bounds it.
//!
//! Accepted blocks are published on an event channel. Nothing has to be
//! listening; the send is fire-and-forget.

use crate::chain::{Block, Chain};
use crate::error::Result;
use crate::hash::{Digest, Nonce};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// Published whenever a worker's candidate extends the chain.
#[derive(Debug, Clone)]
pub struct FoundBlock {
    pub id: u64,
    pub hash: Digest,
    pub nonce: Nonce,
    pub difficulty: u64,
    pub thread_id: u32,
}

/// Candidate digest derivation: `H(nonce)`.
pub fn hash_nonce(nonce: &Nonce) -> Digest {
    Digest::hash_bytes(nonce.as_bytes())
}

/// Difficulty-then-comparison acceptance check against a target hash.
pub fn verify_candidate(candidate: &Digest, target: &Digest, difficulty: u64) -> bool {
    if difficulty > 32 {
        return false;
    }
    if !candidate.as_bytes()[..difficulty as usize]
        .iter()
        .all(|byte| *byte == 0)
    {
        return false;
    }
    candidate < target
}

struct Miner {
    chain: Arc<Chain>,
    thread_id: u32,
    stop: Arc<AtomicBool>,
    events: Sender<FoundBlock>,
}

impl Miner {
    fn run(&self) {
        let mut target = match self.wait_for_current() {
            Some(block) => block,
            None => return,
        };

        // Start from the target block's nonce, offset per thread so workers
        // begin in different regions of the search space.
        let mut nonce = Nonce::zero();
        let _ = nonce.set_bytes(target.nonce.as_bytes());
        let shifted = nonce
            .as_u64()
            .checked_shl(self.thread_id.saturating_sub(1))
            .unwrap_or(0)
            .checked_shl(8)
            .unwrap_or(0);
        nonce.set_u64(shifted);

        info!(
            "Miner {} started against block {} (difficulty {})",
            self.thread_id, target.id, target.difficulty
        );

        while !self.stop.load(Ordering::Relaxed) {
            let candidate = hash_nonce(&nonce);

            if verify_candidate(&candidate, &target.hash, target.difficulty) {
                match self.chain.try_extend(&candidate, &nonce) {
                    Ok(Some(_)) => {
                        info!(
                            "[B:{} H:{} N:{} D:{} T:{}]",
                            target.id + 1,
                            candidate,
                            nonce,
                            target.difficulty,
                            self.thread_id
                        );
                        let _ = self.events.send(FoundBlock {
                            id: target.id + 1,
                            hash: candidate,
                            nonce,
                            difficulty: target.difficulty,
                            thread_id: self.thread_id,
                        });
                        if let Ok(Some(block)) = self.chain.current_block() {
                            target = block;
                        }
                    }
                    Ok(None) => {
                        // lost the race for this height
                    }
                    Err(e) => {
                        warn!("Miner {} could not extend the chain: {}", self.thread_id, e);
                    }
                }
            }

            nonce.randomize();
        }
    }

    fn wait_for_current(&self) -> Option<Block> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return None;
            }
            match self.chain.current_block() {
                Ok(Some(block)) => return Some(block),
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(e) => {
                    warn!("Miner {} cannot read the chain: {}", self.thread_id, e);
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
        }
    }
}

/// Handle over a set of running mining workers.
pub struct MinerPool {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    events: Receiver<FoundBlock>,
}

impl MinerPool {
    /// Spawns `threads` workers (at least one) mining against `chain`.
    pub fn spawn(chain: Arc<Chain>, threads: usize) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = unbounded();

        let mut handles = Vec::new();
        for index in 0..threads.max(1) {
            let miner = Miner {
                chain: chain.clone(),
                thread_id: index as u32 + 1,
                stop: stop.clone(),
                events: sender.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("miner-{}", index + 1))
                .spawn(move || miner.run())?;
            handles.push(handle);
        }

        Ok(MinerPool {
            stop,
            handles,
            events: receiver,
        })
    }

    /// Channel of accepted blocks; safe to ignore.
    pub fn events(&self) -> &Receiver<FoundBlock> {
        &self.events
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Signals every worker to finish its current iteration and exit.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stops the workers and waits for them.
    pub fn shutdown(mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_nonce_is_deterministic() {
        let nonce = Nonce::from_hex("0x000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(hash_nonce(&nonce), hash_nonce(&nonce));
        assert_eq!(hash_nonce(&nonce), Digest::hash_bytes(nonce.as_bytes()));
    }

    #[test]
    fn test_verify_candidate_difficulty_bytes() {
        let mut target = Digest::zero();
        target.set_byte(0, 0x10);

        let mut candidate = Digest::zero();
        candidate.set_byte(1, 0x01);

        // difficulty 0: comparison only
        assert!(verify_candidate(&candidate, &target, 0));
        // difficulty 1: leading byte is zero
        assert!(verify_candidate(&candidate, &target, 1));
        // difficulty 2: second byte is 0x01, fails the byte check
        assert!(!verify_candidate(&candidate, &target, 2));
        // more zero bytes than a digest has
        assert!(!verify_candidate(&candidate, &target, 33));
    }

    #[test]
    fn test_verify_candidate_requires_strictly_smaller() {
        let mut target = Digest::zero();
        target.set_byte(0, 0x80);

        assert!(!verify_candidate(&target, &target, 0));

        let mut smaller = Digest::zero();
        smaller.set_byte(0, 0x7F);
        assert!(verify_candidate(&smaller, &target, 0));

        let mut larger = Digest::zero();
        larger.set_byte(0, 0x81);
        assert!(!verify_candidate(&larger, &target, 0));
    }
}
