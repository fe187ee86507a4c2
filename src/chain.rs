//! Block model and chain state
//!
//! The chain is an append-only sequence of blocks persisted as JSON records
//! through the encrypted record store. One lock guards both the in-memory
//! block vector and the genesis-in-progress flag: every read of the current
//! block and every extension attempt goes through it, so an acceptance check
//! is always evaluated against the latest committed top block and exactly one
//! extension can commit per height.
//!
//! Proof-of-work here is relative, not thresholded: a candidate extends the
//! chain iff its digest is strictly smaller than the current block's hash.
//!
//! The genesis block is created once, by a timed parallel search (see
//! [`GenesisOptions`]), and mirrored to a plain JSON snapshot file whose
//! presence gates whether the search runs again on startup.

use crate::error::{ChainError, Result};
use crate::hash::{Digest, Nonce};
use crate::store::RecordStore;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

pub const BLOCKS_FILE_NAME: &str = "blocks.dat";
pub const GENESIS_FILE_NAME: &str = "genesis.json";

/// Seed string the genesis search derives its starting digest from.
const GENESIS_SEED: &str = "Veilchain Engine genesis seed v1";

/// Address credited by the engine; copied into every block from its parent.
const COINBASE_ADDRESS: &str = "0x5b9e3ac07dd1417c6f84b1d2e00a94638cf27d15";

const BLOCK_VERSION: u16 = 1;
const GENESIS_DIFFICULTY: u64 = 1;

/// Budget checks in the genesis search happen once per this many iterations.
const GENESIS_CHECKPOINT: u64 = 500_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: u64,
    pub parent: Digest,
    pub hash: Digest,
    pub nonce: Nonce,
    pub merkle: Digest,
    pub difficulty: u64,
    pub time: u64,
    pub version: u16,
    pub coinbase: Digest,
}

impl Block {
    fn genesis(hash: Digest, nonce: Nonce) -> Self {
        Block {
            id: 0,
            parent: Digest::zero(),
            hash,
            nonce,
            merkle: Digest::zero(),
            difficulty: GENESIS_DIFFICULTY,
            time: Utc::now().timestamp() as u64,
            version: BLOCK_VERSION,
            coinbase: Digest::from_hex(COINBASE_ADDRESS).unwrap_or_else(|_| Digest::zero()),
        }
    }
}

/// Parameters of the parallel genesis search.
#[derive(Debug, Clone)]
pub struct GenesisOptions {
    /// Worker threads; defaults to the available processor count.
    pub workers: usize,
    /// Wall-clock search budget, checked coarsely.
    pub budget: Duration,
}

impl Default for GenesisOptions {
    fn default() -> Self {
        GenesisOptions {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            budget: Duration::from_secs(60),
        }
    }
}

struct ChainInner {
    blocks: Vec<Block>,
    creating_genesis: bool,
}

/// Process-lifetime chain handle; open once at startup.
pub struct Chain {
    store: RecordStore,
    genesis_path: PathBuf,
    inner: Mutex<ChainInner>,
}

impl Chain {
    /// Opens the chain under `data_dir`, running the genesis search first if
    /// no usable genesis snapshot exists yet.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(data_dir, &GenesisOptions::default())
    }

    pub fn open_with(data_dir: impl AsRef<Path>, options: &GenesisOptions) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let store = RecordStore::open(data_dir.join(BLOCKS_FILE_NAME))?;
        let chain = Chain {
            store,
            genesis_path: data_dir.join(GENESIS_FILE_NAME),
            inner: Mutex::new(ChainInner {
                blocks: Vec::new(),
                creating_genesis: false,
            }),
        };

        if !genesis_snapshot_usable(&chain.genesis_path) {
            chain.create_genesis_block(options)?;
        }

        Ok(chain)
    }

    /// The last accepted block. `None` while genesis creation is in progress.
    /// The block vector is loaded from the store on first access.
    pub fn current_block(&self) -> Result<Option<Block>> {
        let mut inner = self.inner.lock();
        if inner.creating_genesis {
            return Ok(None);
        }
        self.ensure_loaded(&mut inner)?;
        Ok(inner.blocks.last().cloned())
    }

    pub fn block_count(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.creating_genesis {
            return Ok(0);
        }
        self.ensure_loaded(&mut inner)?;
        Ok(inner.blocks.len() as u64)
    }

    /// Attempts to extend the chain with a mined candidate. Accepted iff the
    /// candidate digest is strictly smaller than the current block's hash;
    /// compare, build and append all happen inside one critical section.
    /// A rejection is an expected race outcome, not an error.
    pub fn try_extend(&self, candidate: &Digest, nonce: &Nonce) -> Result<Option<Digest>> {
        let mut inner = self.inner.lock();
        if inner.creating_genesis {
            return Ok(None);
        }
        self.ensure_loaded(&mut inner)?;

        let current = match inner.blocks.last() {
            Some(block) => block.clone(),
            None => return Ok(None),
        };

        if *candidate >= current.hash {
            return Ok(None);
        }

        let block = Block {
            id: current.id + 1,
            parent: current.hash,
            hash: *candidate,
            nonce: *nonce,
            merkle: Digest::zero(),
            difficulty: current.difficulty,
            time: Utc::now().timestamp() as u64,
            version: current.version,
            coinbase: current.coinbase,
        };

        let payload = serde_json::to_vec(&block)?;
        self.store.append(&payload)?;
        inner.blocks.push(block);

        Ok(Some(*candidate))
    }

    fn ensure_loaded(&self, inner: &mut ChainInner) -> Result<()> {
        if !inner.blocks.is_empty() {
            return Ok(());
        }

        let mut payloads: Vec<Vec<u8>> = Vec::new();
        self.store.for_each(|data| payloads.push(data.to_vec()))?;

        let mut blocks = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let block: Block = serde_json::from_slice(&payload)?;
            blocks.push(block);
        }
        verify_linkage(&blocks)?;
        inner.blocks = blocks;
        Ok(())
    }

    /// Runs the timed genesis race, persists the winner to the snapshot file
    /// and through the record store, and installs it as block 0. Snapshot
    /// write failure is fatal: no chain can exist without a genesis block.
    fn create_genesis_block(&self, options: &GenesisOptions) -> Result<()> {
        self.inner.lock().creating_genesis = true;
        let outcome = self.run_genesis(options);
        self.inner.lock().creating_genesis = false;
        outcome
    }

    fn run_genesis(&self, options: &GenesisOptions) -> Result<()> {
        let workers = options.workers.max(1);
        info!(
            "Generating genesis block with {} workers over {:?}; this will take a while",
            workers, options.budget
        );

        let selected: Mutex<Option<Block>> = Mutex::new(None);
        let budget = options.budget;
        std::thread::scope(|scope| {
            let selected = &selected;
            for _ in 0..workers {
                scope.spawn(move || genesis_worker(budget, selected));
            }
        });

        let winner = selected
            .into_inner()
            .ok_or_else(|| ChainError::Genesis("search produced no candidate".to_string()))?;

        let payload = serde_json::to_vec(&winner)?;
        std::fs::write(&self.genesis_path, &payload).map_err(|e| {
            ChainError::Genesis(format!(
                "cannot write snapshot {}: {}",
                self.genesis_path.display(),
                e
            ))
        })?;
        self.store.append(&payload)?;

        info!("Genesis block created: {}", winner.hash);

        let mut inner = self.inner.lock();
        inner.blocks = vec![winner];
        Ok(())
    }
}

fn genesis_snapshot_usable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.len() > 0,
        Err(_) => false,
    }
}

fn verify_linkage(blocks: &[Block]) -> Result<()> {
    for (index, block) in blocks.iter().enumerate() {
        if block.id != index as u64 {
            return Err(ChainError::Format(format!(
                "Block at position {} carries id {}",
                index, block.id
            )));
        }
        if index > 0 && block.parent != blocks[index - 1].hash {
            return Err(ChainError::Format(format!(
                "Block {} does not link to its parent's hash",
                block.id
            )));
        }
    }
    Ok(())
}

/// One genesis search worker. The seed digest is `H(seed string)` with its
/// two leading bytes forced to zero; each step folds a fresh random nonce
/// into the evolving digest. A candidate improves on the worker's local best
/// when it is *greater* while keeping a zero leading byte: within the
/// zero-prefixed subspace the race hunts for the lexicographically greatest
/// digest, the opposite of ordinary mining's rule. Each improvement is
/// proposed to the shared selection slot.
fn genesis_worker(budget: Duration, selected: &Mutex<Option<Block>>) {
    let mut current = Digest::hash_str(GENESIS_SEED);
    current.set_byte(0, 0);
    current.set_byte(1, 0);
    let mut best = current;

    let mut nonce = Nonce::zero();
    let start = Instant::now();
    let mut iterations: u64 = 0;

    loop {
        nonce.randomize();
        current = current.chain_with_nonce(&nonce);

        if current > best && current.byte(0) == 0 {
            best = current;
            let candidate = Block::genesis(best, nonce);

            let mut slot = selected.lock();
            let wins = match slot.as_ref() {
                None => true,
                Some(target) => genesis_candidate_wins(&best, &target.hash),
            };
            if wins {
                *slot = Some(candidate);
                drop(slot);
                info!("Genesis candidate H:{} N:{}", best, nonce);
            }
        }

        iterations += 1;
        if iterations % GENESIS_CHECKPOINT == 0 && start.elapsed() >= budget {
            break;
        }
    }
}

/// Selection rule between a proposed genesis digest and the currently
/// selected one. The generic lexicographic comparison decides first; a
/// secondary big-endian value over digest bytes 2..6 breaks the remaining
/// cases: the candidate loses only when it compares less-or-equal AND its
/// secondary value is smaller.
fn genesis_candidate_wins(candidate: &Digest, selected: &Digest) -> bool {
    let cmp = candidate.cmp(selected);
    !(cmp != Ordering::Greater && secondary_value(candidate) < secondary_value(selected))
}

fn secondary_value(digest: &Digest) -> u32 {
    u32::from_be_bytes([
        digest.byte(2),
        digest.byte(3),
        digest.byte(4),
        digest.byte(5),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Installs a handcrafted genesis block so tests skip the timed race.
    pub(crate) fn seed_genesis(data_dir: &Path, hash: Digest) {
        let block = Block {
            id: 0,
            parent: Digest::zero(),
            hash,
            nonce: Nonce::zero(),
            merkle: Digest::zero(),
            difficulty: 1,
            time: 1_700_000_000,
            version: BLOCK_VERSION,
            coinbase: Digest::zero(),
        };
        let payload = serde_json::to_vec(&block).unwrap();
        std::fs::create_dir_all(data_dir).unwrap();
        std::fs::write(data_dir.join(GENESIS_FILE_NAME), &payload).unwrap();
        let store = RecordStore::open(data_dir.join(BLOCKS_FILE_NAME)).unwrap();
        store.append(&payload).unwrap();
    }

    fn high_digest() -> Digest {
        // 0x00ff...ff: beatable by almost any zero-leading candidate
        let mut bytes = [0xFFu8; 32];
        bytes[0] = 0;
        Digest::from_bytes(&bytes)
    }

    #[test]
    fn test_block_serializes_with_expected_field_names() {
        let block = Block::genesis(Digest::hash_str("g"), Nonce::zero());
        let value: serde_json::Value = serde_json::to_value(&block).unwrap();
        for key in [
            "id",
            "parent",
            "hash",
            "nonce",
            "merkle",
            "difficulty",
            "time",
            "version",
            "coinbase",
        ] {
            assert!(value.get(key).is_some(), "missing field {}", key);
        }
        let back: Block = serde_json::from_value(value).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_try_extend_accepts_smaller_rejects_larger() {
        let dir = TempDir::new().unwrap();
        seed_genesis(dir.path(), high_digest());
        let chain = Chain::open(dir.path()).unwrap();

        let genesis = chain.current_block().unwrap().unwrap();
        assert_eq!(genesis.id, 0);
        assert!(genesis.parent.is_zero());

        let mut candidate = Digest::zero();
        candidate.set_byte(31, 1);
        let nonce = Nonce::random();

        let accepted = chain.try_extend(&candidate, &nonce).unwrap();
        assert_eq!(accepted, Some(candidate));

        let top = chain.current_block().unwrap().unwrap();
        assert_eq!(top.id, 1);
        assert_eq!(top.parent, genesis.hash);
        assert_eq!(top.hash, candidate);
        assert_eq!(top.difficulty, genesis.difficulty);

        // anything >= the new top is rejected and leaves the chain untouched
        let rejected = chain.try_extend(&high_digest(), &nonce).unwrap();
        assert_eq!(rejected, None);
        assert_eq!(chain.try_extend(&candidate, &nonce).unwrap(), None);
        assert_eq!(chain.block_count().unwrap(), 2);
    }

    #[test]
    fn test_concurrent_extension_accepts_exactly_once() {
        let dir = TempDir::new().unwrap();
        seed_genesis(dir.path(), high_digest());
        let chain = std::sync::Arc::new(Chain::open(dir.path()).unwrap());

        let mut candidate = Digest::zero();
        candidate.set_byte(31, 7);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let chain = chain.clone();
            handles.push(std::thread::spawn(move || {
                chain
                    .try_extend(&candidate, &Nonce::random())
                    .unwrap()
                    .is_some()
            }));
        }
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|accepted| *accepted)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(chain.block_count().unwrap(), 2);
    }

    #[test]
    fn test_chain_reloads_from_store() {
        let dir = TempDir::new().unwrap();
        seed_genesis(dir.path(), high_digest());

        let first_hash;
        {
            let chain = Chain::open(dir.path()).unwrap();
            let mut candidate = Digest::zero();
            candidate.set_byte(31, 3);
            chain.try_extend(&candidate, &Nonce::random()).unwrap();
            first_hash = chain.current_block().unwrap().unwrap().hash;
        }

        let reopened = Chain::open(dir.path()).unwrap();
        assert_eq!(reopened.block_count().unwrap(), 2);
        assert_eq!(reopened.current_block().unwrap().unwrap().hash, first_hash);
    }

    #[test]
    fn test_linkage_verification() {
        let genesis = Block::genesis(Digest::hash_str("g"), Nonce::zero());
        let mut child = Block::genesis(Digest::hash_str("c"), Nonce::zero());
        child.id = 1;
        child.parent = genesis.hash;
        assert!(verify_linkage(&[genesis.clone(), child.clone()]).is_ok());

        let mut broken = child.clone();
        broken.parent = Digest::hash_str("other");
        assert!(verify_linkage(&[genesis.clone(), broken]).is_err());

        let mut bad_id = child;
        bad_id.id = 5;
        assert!(verify_linkage(&[genesis, bad_id]).is_err());
    }

    #[test]
    fn test_genesis_selection_rule() {
        let mut selected = Digest::zero();
        selected.set_bytes(&[0x00, 0x10, 0x20, 0x30, 0x40, 0x50]);

        // strictly greater digest always wins
        let mut bigger = selected;
        bigger.set_byte(1, 0x11);
        assert!(genesis_candidate_wins(&bigger, &selected));

        // smaller digest with a smaller secondary value loses
        let mut small = Digest::zero();
        small.set_bytes(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01]);
        assert!(!genesis_candidate_wins(&small, &selected));

        // smaller digest whose secondary value is larger still wins
        let mut quirky = Digest::zero();
        quirky.set_bytes(&[0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(genesis_candidate_wins(&quirky, &selected));

        // equal digest ties on secondary and wins
        assert!(genesis_candidate_wins(&selected, &selected));
    }
}
