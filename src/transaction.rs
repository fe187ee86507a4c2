//! Transfer records
//!
//! Transactions are fixed-width 144-byte records persisted through their own
//! record store file. The transaction hash covers every other field, with the
//! integer fields folded in big-endian, so it stays stable across stores.

use crate::account::Accounts;
use crate::error::{ChainError, Result};
use crate::hash::Digest;
use crate::merkle::MerkleTree;
use crate::store::RecordStore;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest as _, Sha256};
use std::path::Path;

pub const TRANSACTIONS_FILE_NAME: &str = "transactions.dat";

const RECORD_LEN: usize = 32 + 32 + 32 + 8 + 8 + 32;

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Random identifier assigned at creation.
    pub id: Digest,
    pub from: Digest,
    pub to: Digest,
    pub create_time: u64,
    pub amount: f64,
    /// Hash of all the fields above.
    pub hash: Digest,
}

impl Transaction {
    pub fn compute_hash(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.from.as_bytes());
        hasher.update(self.to.as_bytes());
        hasher.update(self.create_time.to_be_bytes());
        hasher.update(self.amount.to_bits().to_be_bytes());
        Digest::from_bytes(&hasher.finalize())
    }

    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..32].copy_from_slice(self.id.as_bytes());
        buf[32..64].copy_from_slice(self.from.as_bytes());
        buf[64..96].copy_from_slice(self.to.as_bytes());
        buf[96..104].copy_from_slice(&self.create_time.to_le_bytes());
        buf[104..112].copy_from_slice(&self.amount.to_le_bytes());
        buf[112..144].copy_from_slice(self.hash.as_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != RECORD_LEN {
            return Err(ChainError::Format(format!(
                "Transaction record is {} bytes, expected {}",
                data.len(),
                RECORD_LEN
            )));
        }

        let mut u64_buf = [0u8; 8];
        u64_buf.copy_from_slice(&data[96..104]);
        let create_time = u64::from_le_bytes(u64_buf);
        u64_buf.copy_from_slice(&data[104..112]);
        let amount = f64::from_le_bytes(u64_buf);

        Ok(Transaction {
            id: Digest::from_bytes(&data[0..32]),
            from: Digest::from_bytes(&data[32..64]),
            to: Digest::from_bytes(&data[64..96]),
            create_time,
            amount,
            hash: Digest::from_bytes(&data[112..144]),
        })
    }
}

/// Transfer ledger over one record store file.
pub struct Transactions {
    store: RecordStore,
}

impl Transactions {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let store = RecordStore::open(data_dir.as_ref().join(TRANSACTIONS_FILE_NAME))?;
        Ok(Transactions { store })
    }

    /// Creates and persists a transfer between two existing accounts, moving
    /// the balance through the account registry.
    pub fn create(
        &self,
        accounts: &Accounts,
        from: &str,
        to: &str,
        amount: f64,
    ) -> Result<Transaction> {
        let from_account = accounts.get(from)?;
        let to_account = accounts.get(to)?;

        if from_account.address == to_account.address {
            return Err(ChainError::InvalidInput(
                "Attempting to transfer to the same account (from = to)".to_string(),
            ));
        }
        if from_account.balance < amount {
            return Err(ChainError::InsufficientFunds);
        }

        // Re-checked and applied under the registry lock.
        accounts.transfer(&from_account.address, &to_account.address, amount)?;

        let mut transaction = Transaction {
            id: random_id(),
            from: from_account.address,
            to: to_account.address,
            create_time: Utc::now().timestamp() as u64,
            amount,
            hash: Digest::zero(),
        };
        transaction.hash = transaction.compute_hash();

        self.store.append(&transaction.encode())?;
        Ok(transaction)
    }

    pub fn list(&self) -> Result<Vec<Transaction>> {
        let mut payloads = Vec::new();
        self.store.for_each(|data| payloads.push(data.to_vec()))?;

        let mut transactions = Vec::with_capacity(payloads.len());
        for payload in payloads {
            transactions.push(Transaction::decode(&payload)?);
        }
        Ok(transactions)
    }

    pub fn count(&self) -> i64 {
        self.store.count()
    }
}

/// Merkle root over a transaction batch, in batch order. This is what a
/// block's `merkle` field is built from when a batch is assembled.
pub fn merkle_root(transactions: &[Transaction]) -> Result<Digest> {
    let hashes: Vec<Digest> = transactions.iter().map(|tx| tx.hash).collect();
    Ok(MerkleTree::build(&hashes)?.root_hash())
}

fn random_id() -> Digest {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    Digest::hash_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Accounts, Transactions, String, String) {
        let dir = TempDir::new().unwrap();
        let accounts = Accounts::open(dir.path()).unwrap();
        let transactions = Transactions::open(dir.path()).unwrap();

        let alice = accounts.create("alice").unwrap().address.to_hex();
        let bob = accounts.create("bob").unwrap().address.to_hex();
        accounts.airdrop(&alice, 100.0).unwrap();
        (dir, accounts, transactions, alice, bob)
    }

    #[test]
    fn test_codec_round_trip() {
        let mut tx = Transaction {
            id: Digest::hash_str("id"),
            from: Digest::hash_str("from"),
            to: Digest::hash_str("to"),
            create_time: 1_700_000_123,
            amount: 42.25,
            hash: Digest::zero(),
        };
        tx.hash = tx.compute_hash();

        let encoded = tx.encode();
        assert_eq!(encoded.len(), RECORD_LEN);
        assert_eq!(Transaction::decode(&encoded).unwrap(), tx);
        assert!(Transaction::decode(&encoded[..100]).is_err());
    }

    #[test]
    fn test_hash_covers_every_field() {
        let mut tx = Transaction {
            id: Digest::hash_str("id"),
            from: Digest::hash_str("from"),
            to: Digest::hash_str("to"),
            create_time: 1,
            amount: 10.0,
            hash: Digest::zero(),
        };
        let original = tx.compute_hash();
        assert_eq!(original, tx.compute_hash());

        tx.amount = 10.5;
        assert_ne!(tx.compute_hash(), original);
        tx.amount = 10.0;
        tx.create_time = 2;
        assert_ne!(tx.compute_hash(), original);
    }

    #[test]
    fn test_create_moves_funds_and_persists() {
        let (_dir, accounts, transactions, alice, bob) = setup();

        let tx = transactions.create(&accounts, &alice, &bob, 40.0).unwrap();
        assert_eq!(tx.amount, 40.0);
        assert_eq!(tx.hash, tx.compute_hash());

        assert_eq!(accounts.get(&alice).unwrap().balance, 60.0);
        assert_eq!(accounts.get(&bob).unwrap().balance, 40.0);

        let listed = transactions.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], tx);
    }

    #[test]
    fn test_create_rejections() {
        let (_dir, accounts, transactions, alice, bob) = setup();

        assert_eq!(
            transactions
                .create(&accounts, &alice, &bob, 1000.0)
                .unwrap_err(),
            ChainError::InsufficientFunds
        );
        assert!(matches!(
            transactions.create(&accounts, &alice, &alice, 1.0),
            Err(ChainError::InvalidInput(_))
        ));
        assert_eq!(
            transactions
                .create(&accounts, &Digest::hash_str("ghost").to_hex(), &bob, 1.0)
                .unwrap_err(),
            ChainError::AccountNotFound
        );
        assert_eq!(transactions.count(), 0);
    }

    #[test]
    fn test_merkle_root_over_batch() {
        let (_dir, accounts, transactions, alice, bob) = setup();
        for amount in [1.0, 2.0, 3.0] {
            transactions.create(&accounts, &alice, &bob, amount).unwrap();
        }

        let batch = transactions.list().unwrap();
        let root = merkle_root(&batch).unwrap();

        let hashes: Vec<Digest> = batch.iter().map(|tx| tx.hash).collect();
        assert_eq!(root, MerkleTree::build(&hashes).unwrap().root_hash());
        assert!(matches!(merkle_root(&[]), Err(ChainError::NoTransactions)));
    }
}
