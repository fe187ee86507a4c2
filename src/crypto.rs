//! Cryptographic primitives for Veilchain
//!
//! Two concerns live here: the symmetric cipher every record store payload
//! passes through, and the secp256k1 keypairs accounts sign with.
//!
//! The record cipher is a pluggable boundary: the store only needs
//! `encrypt`/`decrypt`, so deployments can swap the default for their own
//! implementation. The default seals with AES-256-GCM under an embedded key
//! and a fixed key-derived nonce. The fixed nonce forfeits the mode's
//! multi-message confidentiality guarantee; it is kept for on-disk
//! compatibility with existing store files (see DESIGN.md).

use crate::error::{ChainError, Result};
use crate::hash::Digest;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce as GcmNonce};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest as _, Sha256};

/// A thread-safe, lazily initialized Secp256k1 context.
/// This prevents repeated, unnecessary context creation.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Key the default cipher seals store payloads with. The first 12 bytes
/// double as the fixed GCM nonce.
const STORE_KEY: [u8; 32] = [
    0x6b, 0xd2, 0x1a, 0x8e, 0x47, 0x0c, 0xe6, 0x91, 0x3f, 0xa4, 0x5d, 0x28, 0xb9, 0x70, 0x0e, 0xc5,
    0x82, 0x19, 0x4c, 0xf3, 0xaa, 0x36, 0x61, 0xd8, 0x05, 0xbe, 0x97, 0x2f, 0x40, 0xcb, 0x13, 0x7a,
];

const GCM_NONCE_LEN: usize = 12;

/// Symmetric cipher applied to every record store payload.
pub trait RecordCipher: Send + Sync {
    /// Fails only on cipher setup problems.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Fails when the ciphertext does not authenticate.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Default AES-256-GCM record cipher.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
    nonce: [u8; GCM_NONCE_LEN],
}

impl AesGcmCipher {
    pub fn new() -> Self {
        Self::with_key(&STORE_KEY)
    }

    pub fn with_key(key: &[u8; 32]) -> Self {
        let mut nonce = [0u8; GCM_NONCE_LEN];
        nonce.copy_from_slice(&key[..GCM_NONCE_LEN]);
        AesGcmCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce,
        }
    }
}

impl Default for AesGcmCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(GcmNonce::from_slice(&self.nonce), plaintext)
            .map_err(|e| ChainError::Crypto(format!("Failed to encrypt payload: {}", e)))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(GcmNonce::from_slice(&self.nonce), ciphertext)
            .map_err(|e| ChainError::Decryption(format!("Payload did not authenticate: {}", e)))
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Creates a KeyPair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::Crypto(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::Crypto(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        Ok(KeyPair {
            secret_key,
            public_key,
        })
    }

    /// Account address: SHA-256 of the compressed public key.
    pub fn address(&self) -> Digest {
        let pubkey_bytes: [u8; PUBLIC_KEY_SIZE] = self.public_key.serialize();
        Digest::from_bytes(&Sha256::digest(pubkey_bytes))
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.secret_key.secret_bytes()
    }

    /// Signs a message (first hashed with SHA-256); returns the compact signature.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE]> {
        let digest = Sha256::digest(message);
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| ChainError::Crypto(format!("Failed to create message: {}", e)))?;

        let signature = SECP256K1_CONTEXT.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact())
    }
}

/// Verifies an ECDSA signature given compressed public key bytes, the message,
/// and compact signature bytes.
pub fn verify_signature(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<()> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::Crypto(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::Crypto(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ChainError::Crypto(format!("Invalid public key: {}", e)))?;

    let digest = Sha256::digest(message);
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| ChainError::Crypto(format!("Failed to create message: {}", e)))?;

    let signature = Signature::from_compact(signature_bytes)
        .map_err(|e| ChainError::Crypto(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::Crypto("Signature verification failed".to_string()))
}
