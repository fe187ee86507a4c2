//! Fixed-width digest and mining nonce primitives
//!
//! `Digest` is the 32-byte hash value used everywhere in the engine: block
//! hashes, parent links, Merkle nodes, account addresses. Ordering is plain
//! unsigned lexicographic comparison with byte 0 most significant, which is
//! exactly what the mining acceptance rules are defined over.
//!
//! `Nonce` is the 16-byte value a miner varies while searching. Besides raw
//! byte access it exposes big-endian integer views over its leading bytes,
//! which the mining engine uses to offset worker start positions.

use crate::error::{ChainError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;

pub const DIGEST_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;

/// 32-byte hash value. Derived `Ord` on the inner array gives the unsigned
/// lexicographic order the chain's acceptance rules rely on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub fn zero() -> Self {
        Digest([0u8; DIGEST_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Copies up to 32 bytes from the front of `bytes`, zero-padding the rest.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut digest = Digest::zero();
        digest.set_bytes(bytes);
        digest
    }

    pub fn set_bytes(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(DIGEST_LEN);
        self.0[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn byte(&self, index: usize) -> u8 {
        self.0[index]
    }

    pub fn set_byte(&mut self, index: usize, value: u8) {
        self.0[index] = value;
    }

    /// SHA-256 of an arbitrary byte string.
    pub fn hash_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest(hasher.finalize().into())
    }

    pub fn hash_str(text: &str) -> Self {
        Self::hash_bytes(text.as_bytes())
    }

    /// `H(self || nonce)`; the genesis race folds each candidate nonce into
    /// its evolving seed with this.
    pub fn chain_with_nonce(&self, nonce: &Nonce) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(nonce.as_bytes());
        Digest(hasher.finalize().into())
    }

    /// Parses a hex string, with or without a leading `0x`/`0X`. Shorter
    /// strings fill the digest from the front.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = decode_hex(text)?;
        if bytes.len() > DIGEST_LEN {
            return Err(ChainError::InvalidInput(format!(
                "hex string decodes to {} bytes, digest holds {}",
                bytes.len(),
                DIGEST_LEN
            )));
        }
        Ok(Self::from_bytes(&bytes))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Digest::from_hex(&text).map_err(D::Error::custom)
    }
}

/// 16-byte mining nonce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn zero() -> Self {
        Nonce([0u8; NONCE_LEN])
    }

    /// Fills the nonce with fresh OS randomness.
    pub fn randomize(&mut self) -> &mut Self {
        OsRng.fill_bytes(&mut self.0);
        self
    }

    pub fn random() -> Self {
        let mut nonce = Nonce::zero();
        nonce.randomize();
        nonce
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    /// Fails on empty input or input wider than the nonce; shorter input
    /// fills the nonce from the front.
    pub fn set_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        if bytes.is_empty() || bytes.len() > NONCE_LEN {
            return Err(ChainError::InvalidInput("invalid nonce size".to_string()));
        }
        self.0[..bytes.len()].copy_from_slice(bytes);
        Ok(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut nonce = Nonce::zero();
        nonce.set_bytes(bytes)?;
        Ok(nonce)
    }

    // Big-endian integer views over the leading bytes.

    pub fn as_u16(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn as_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }

    pub fn set_u16(&mut self, value: u16) -> &mut Self {
        self.0[..2].copy_from_slice(&value.to_be_bytes());
        self
    }

    pub fn set_u32(&mut self, value: u32) -> &mut Self {
        self.0[..4].copy_from_slice(&value.to_be_bytes());
        self
    }

    pub fn set_u64(&mut self, value: u64) -> &mut Self {
        self.0[..8].copy_from_slice(&value.to_be_bytes());
        self
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = decode_hex(text)?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Nonce::from_hex(&text).map_err(D::Error::custom)
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let trimmed = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    hex::decode(trimmed).map_err(|e| ChainError::InvalidInput(format!("invalid hex string: {}", e)))
}
