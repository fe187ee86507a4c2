//! Account records
//!
//! Accounts are ordinary payloads to the record store: a fixed-width
//! little-endian record of 177 bytes, so an in-place balance update never
//! grows the record and `update_matching` always fits. The store encrypts
//! them like everything else.
//!
//! Record layout: label (64 bytes, NUL-padded) | address (32) |
//! create_time (u64) | balance (f64) | public key (33, compressed) |
//! secret key (32).

use crate::crypto::KeyPair;
use crate::error::{ChainError, Result};
use crate::hash::Digest;
use crate::store::RecordStore;
use chrono::Utc;
use parking_lot::Mutex;
use secp256k1::constants::COMPACT_SIGNATURE_SIZE;
use std::path::Path;
use tracing::warn;

pub const ACCOUNTS_FILE_NAME: &str = "accounts.dat";

pub const MAX_LABEL_LEN: usize = 64;

const PUBLIC_KEY_LEN: usize = 33;
const SECRET_KEY_LEN: usize = 32;
const RECORD_LEN: usize = MAX_LABEL_LEN + 32 + 8 + 8 + PUBLIC_KEY_LEN + SECRET_KEY_LEN;

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    label: [u8; MAX_LABEL_LEN],
    pub address: Digest,
    pub create_time: u64,
    pub balance: f64,
    pub public_key: [u8; PUBLIC_KEY_LEN],
    secret_key: [u8; SECRET_KEY_LEN],
}

impl Account {
    pub fn label(&self) -> String {
        let end = self
            .label
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(MAX_LABEL_LEN);
        String::from_utf8_lossy(&self.label[..end]).into_owned()
    }

    pub fn keypair(&self) -> Result<KeyPair> {
        KeyPair::from_secret_bytes(&self.secret_key)
    }

    /// Signs arbitrary bytes with the account's key.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE]> {
        self.keypair()?.sign(data)
    }

    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        let mut at = 0;
        buf[at..at + MAX_LABEL_LEN].copy_from_slice(&self.label);
        at += MAX_LABEL_LEN;
        buf[at..at + 32].copy_from_slice(self.address.as_bytes());
        at += 32;
        buf[at..at + 8].copy_from_slice(&self.create_time.to_le_bytes());
        at += 8;
        buf[at..at + 8].copy_from_slice(&self.balance.to_le_bytes());
        at += 8;
        buf[at..at + PUBLIC_KEY_LEN].copy_from_slice(&self.public_key);
        at += PUBLIC_KEY_LEN;
        buf[at..at + SECRET_KEY_LEN].copy_from_slice(&self.secret_key);
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != RECORD_LEN {
            return Err(ChainError::Format(format!(
                "Account record is {} bytes, expected {}",
                data.len(),
                RECORD_LEN
            )));
        }

        let mut label = [0u8; MAX_LABEL_LEN];
        label.copy_from_slice(&data[..MAX_LABEL_LEN]);
        let mut at = MAX_LABEL_LEN;

        let address = Digest::from_bytes(&data[at..at + 32]);
        at += 32;

        let mut u64_buf = [0u8; 8];
        u64_buf.copy_from_slice(&data[at..at + 8]);
        let create_time = u64::from_le_bytes(u64_buf);
        at += 8;

        u64_buf.copy_from_slice(&data[at..at + 8]);
        let balance = f64::from_le_bytes(u64_buf);
        at += 8;

        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(&data[at..at + PUBLIC_KEY_LEN]);
        at += PUBLIC_KEY_LEN;

        let mut secret_key = [0u8; SECRET_KEY_LEN];
        secret_key.copy_from_slice(&data[at..at + SECRET_KEY_LEN]);

        Ok(Account {
            label,
            address,
            create_time,
            balance,
            public_key,
            secret_key,
        })
    }
}

/// Account registry over one record store file.
pub struct Accounts {
    store: RecordStore,
    cache: Mutex<Vec<Account>>,
}

impl Accounts {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let store = RecordStore::open(data_dir.as_ref().join(ACCOUNTS_FILE_NAME))?;
        Ok(Accounts {
            store,
            cache: Mutex::new(Vec::new()),
        })
    }

    /// Creates a new account with a fresh keypair and a zero balance.
    pub fn create(&self, label: &str) -> Result<Account> {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(ChainError::InvalidInput(format!(
                "Account label has invalid length; 1 to {} characters allowed",
                MAX_LABEL_LEN
            )));
        }

        let keypair = KeyPair::generate();
        let mut label_bytes = [0u8; MAX_LABEL_LEN];
        label_bytes[..label.len()].copy_from_slice(label.as_bytes());

        let account = Account {
            label: label_bytes,
            address: keypair.address(),
            create_time: Utc::now().timestamp() as u64,
            balance: 0.0,
            public_key: keypair.public_key_bytes(),
            secret_key: keypair.secret_key_bytes(),
        };

        let mut cache = self.cache.lock();
        self.ensure_cache(&mut cache)?;
        self.store.append(&account.encode())?;
        cache.push(account.clone());
        Ok(account)
    }

    pub fn get(&self, address: &str) -> Result<Account> {
        self.get_by_digest(&Digest::from_hex(address)?)
    }

    pub fn get_by_digest(&self, address: &Digest) -> Result<Account> {
        let mut cache = self.cache.lock();
        self.ensure_cache(&mut cache)?;
        cache
            .iter()
            .find(|account| account.address == *address)
            .cloned()
            .ok_or(ChainError::AccountNotFound)
    }

    pub fn list(&self) -> Result<Vec<Account>> {
        let mut cache = self.cache.lock();
        self.ensure_cache(&mut cache)?;
        Ok(cache.clone())
    }

    /// Credits `amount` straight onto an account.
    pub fn airdrop(&self, to: &str, amount: f64) -> Result<Account> {
        let mut account = self.get(to)?;
        account.balance += amount;
        self.persist(&account)?;
        Ok(account)
    }

    /// Moves `amount` between two accounts, both updated in place. The
    /// balance check and both writes happen under the registry lock.
    pub fn transfer(&self, from: &Digest, to: &Digest, amount: f64) -> Result<()> {
        let mut cache = self.cache.lock();
        self.ensure_cache(&mut cache)?;

        let mut sender = cache
            .iter()
            .find(|account| account.address == *from)
            .cloned()
            .ok_or(ChainError::AccountNotFound)?;
        let mut receiver = cache
            .iter()
            .find(|account| account.address == *to)
            .cloned()
            .ok_or(ChainError::AccountNotFound)?;

        if sender.balance < amount {
            return Err(ChainError::InsufficientFunds);
        }

        sender.balance -= amount;
        receiver.balance += amount;
        self.persist_locked(&mut cache, &sender)?;
        self.persist_locked(&mut cache, &receiver)?;
        Ok(())
    }

    /// Writes an account back: a known address is updated in place, a new
    /// one is appended.
    pub fn persist(&self, account: &Account) -> Result<()> {
        let mut cache = self.cache.lock();
        self.ensure_cache(&mut cache)?;
        self.persist_locked(&mut cache, account)
    }

    /// Signs through the store rather than the cache, matching the record by
    /// address.
    pub fn sign_with_account(
        &self,
        address: &str,
        data: &[u8],
    ) -> Result<[u8; COMPACT_SIGNATURE_SIZE]> {
        let digest = Digest::from_hex(address)?;
        let account = self
            .store
            .find_first(|record| Account::decode(record).ok().filter(|a| a.address == digest))
            .map_err(|e| match e {
                ChainError::NotFound => ChainError::AccountNotFound,
                other => other,
            })?;
        account.sign(data)
    }

    pub fn count(&self) -> i64 {
        self.store.count()
    }

    fn persist_locked(&self, cache: &mut Vec<Account>, account: &Account) -> Result<()> {
        let encoded = account.encode();
        if let Some(existing) = cache
            .iter_mut()
            .find(|cached| cached.address == account.address)
        {
            *existing = account.clone();
            let label = account.label;
            self.store.update_matching(&encoded, |record| {
                Account::decode(record)
                    .map(|candidate| candidate.label == label)
                    .unwrap_or(false)
            })
        } else {
            self.store.append(&encoded)?;
            cache.push(account.clone());
            Ok(())
        }
    }

    fn ensure_cache(&self, cache: &mut Vec<Account>) -> Result<()> {
        if !cache.is_empty() || self.store.count() == 0 {
            return Ok(());
        }
        let mut loaded = Vec::new();
        self.store.for_each(|record| match Account::decode(record) {
            Ok(account) => loaded.push(account),
            Err(e) => warn!("Skipping unreadable account record: {}", e),
        })?;
        *cache = loaded;
        Ok(())
    }
}
