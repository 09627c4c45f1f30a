// signer.rs — Signing and verification capabilities.
//
// The ledger (and the PCCap token validator) never hold raw key material in
// their configuration. They call through the `Signer` and `Verifier` traits,
// so keys can live in an HSM/KMS or be rotated without touching core logic.
// The in-process implementations here are backed by `ring`:
//
// - `HmacKeyring`: HMAC-SHA256 with symmetric keys. Verification goes through
//   `ring::hmac::verify`, which compares tags in constant time.
// - `Ed25519Signer` / `Ed25519Verifier`: asymmetric signatures for receipts
//   that must be checkable by parties who cannot sign.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::hmac;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Supported signature algorithms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    #[serde(rename = "HS256")]
    HmacSha256,
    #[serde(rename = "Ed25519")]
    Ed25519,
}

/// Produces signatures with one active key.
pub trait Signer: Send + Sync {
    /// Opaque handle of the active key.
    fn key_id(&self) -> &str;

    fn algorithm(&self) -> SignatureAlgorithm;

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, LedgerError>;
}

/// Checks signatures made by any key it knows about.
pub trait Verifier: Send + Sync {
    /// Returns `false` for unknown keys, algorithm mismatches, and bad
    /// signatures alike. MAC comparisons must be constant-time.
    fn verify(
        &self,
        key_id: &str,
        algorithm: SignatureAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> bool;
}

/// Encode signature bytes for storage in JSON.
pub fn encode_signature(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a stored signature. Malformed input yields `None`.
pub fn decode_signature(encoded: &str) -> Option<Vec<u8>> {
    BASE64.decode(encoded).ok()
}

/// HMAC-SHA256 keyring. The first key is the active signing key; further keys
/// are kept for verifying material signed before a rotation.
pub struct HmacKeyring {
    active: String,
    keys: HashMap<String, hmac::Key>,
}

impl HmacKeyring {
    pub fn new(key_id: impl Into<String>, secret: &[u8]) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), hmac::Key::new(hmac::HMAC_SHA256, secret));
        Self {
            active: key_id,
            keys,
        }
    }

    /// Add a verification-only key (builder pattern).
    pub fn with_retired_key(mut self, key_id: impl Into<String>, secret: &[u8]) -> Self {
        self.keys
            .insert(key_id.into(), hmac::Key::new(hmac::HMAC_SHA256, secret));
        self
    }

    /// Make `key_id` the signing key. The previous key stays available for verification.
    pub fn rotate(&mut self, key_id: impl Into<String>, secret: &[u8]) {
        let key_id = key_id.into();
        self.keys
            .insert(key_id.clone(), hmac::Key::new(hmac::HMAC_SHA256, secret));
        self.active = key_id;
    }
}

impl Signer for HmacKeyring {
    fn key_id(&self) -> &str {
        &self.active
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::HmacSha256
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, LedgerError> {
        let key = self
            .keys
            .get(&self.active)
            .ok_or_else(|| LedgerError::SigningFailed {
                key_id: self.active.clone(),
                reason: "active key missing from keyring".to_string(),
            })?;
        Ok(hmac::sign(key, message).as_ref().to_vec())
    }
}

impl Verifier for HmacKeyring {
    fn verify(
        &self,
        key_id: &str,
        algorithm: SignatureAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> bool {
        if algorithm != SignatureAlgorithm::HmacSha256 {
            return false;
        }
        match self.keys.get(key_id) {
            Some(key) => hmac::verify(key, message, signature).is_ok(),
            None => false,
        }
    }
}

/// Ed25519 signer over a PKCS#8 key pair.
pub struct Ed25519Signer {
    key_id: String,
    pair: Ed25519KeyPair,
}

impl Ed25519Signer {
    pub fn from_pkcs8(key_id: impl Into<String>, pkcs8: &[u8]) -> Result<Self, LedgerError> {
        let key_id = key_id.into();
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8).map_err(|e| LedgerError::InvalidKey {
            key_id: key_id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { key_id, pair })
    }

    /// Generate a fresh key pair, returning the signer and its PKCS#8 document
    /// so the caller can hand it to whatever custody system it uses.
    pub fn generate(key_id: impl Into<String>) -> Result<(Self, Vec<u8>), LedgerError> {
        let key_id = key_id.into();
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| LedgerError::InvalidKey {
            key_id: key_id.clone(),
            reason: "key generation failed".to_string(),
        })?;
        let bytes = pkcs8.as_ref().to_vec();
        let signer = Self::from_pkcs8(key_id, &bytes)?;
        Ok((signer, bytes))
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.pair.public_key().as_ref().to_vec()
    }
}

impl Signer for Ed25519Signer {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Ed25519
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, LedgerError> {
        Ok(self.pair.sign(message).as_ref().to_vec())
    }
}

/// Ed25519 verifier holding public keys by key id.
#[derive(Default)]
pub struct Ed25519Verifier {
    keys: HashMap<String, Vec<u8>>,
}

impl Ed25519Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a public key (builder pattern).
    pub fn with_key(mut self, key_id: impl Into<String>, public_key: Vec<u8>) -> Self {
        self.keys.insert(key_id.into(), public_key);
        self
    }
}

impl Verifier for Ed25519Verifier {
    fn verify(
        &self,
        key_id: &str,
        algorithm: SignatureAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> bool {
        if algorithm != SignatureAlgorithm::Ed25519 {
            return false;
        }
        match self.keys.get(key_id) {
            Some(public_key) => UnparsedPublicKey::new(&ED25519, public_key)
                .verify(message, signature)
                .is_ok(),
            None => false,
        }
    }
}
