//! Encryption collaborator contract and an AES-256-GCM keyring.
//!
//! Codes are stored as [`CryptoValue`]s: the ciphertext plus the algorithm
//! and key id that produced it. Encryption always uses the active key;
//! decryption accepts any key still present in the keyring, so keys can be
//! rotated without invalidating pending codes.

use std::collections::HashMap;
use std::fmt;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Algorithm id reported by [`AesGcmEncryption`].
pub const AES_256_GCM: &str = "aes-256-gcm";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// An encrypted value together with what is needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoValue {
    /// Algorithm id of the producing collaborator.
    pub algorithm: String,
    /// Key id used for encryption.
    pub key_id: String,
    /// Ciphertext, base64 in serialized form.
    #[serde(with = "base64_bytes")]
    pub crypted: Vec<u8>,
}

/// Symmetric encryption with key rotation.
pub trait EncryptionAlgorithm: Send + Sync {
    /// Algorithm id recorded on every produced [`CryptoValue`].
    fn algorithm(&self) -> &str;

    /// Id of the key used for new encryptions.
    fn encryption_key_id(&self) -> &str;

    /// Ids of every key accepted for decryption, including the active one.
    fn decryption_key_ids(&self) -> Vec<String>;

    /// Encrypt with the active key.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt with the named key.
    fn decrypt(&self, crypted: &[u8], key_id: &str) -> Result<Vec<u8>, CryptoError>;
}

/// Encrypt `plain` into a [`CryptoValue`] with the active key.
///
/// # Errors
///
/// Returns [`CryptoError::Encrypt`] if the collaborator fails.
pub fn encrypt(plain: &[u8], alg: &dyn EncryptionAlgorithm) -> Result<CryptoValue, CryptoError> {
    Ok(CryptoValue {
        algorithm: alg.algorithm().to_string(),
        key_id: alg.encryption_key_id().to_string(),
        crypted: alg.encrypt(plain)?,
    })
}

/// Decrypt a stored value back to a UTF-8 string.
///
/// # Errors
///
/// - [`CryptoError::AlgorithmMismatch`] if `value` came from another algorithm.
/// - [`CryptoError::UnknownKey`] if its key was dropped from the keyring.
/// - [`CryptoError::Decrypt`] if the ciphertext is corrupt or not UTF-8.
pub fn decrypt_to_string(
    value: &CryptoValue,
    alg: &dyn EncryptionAlgorithm,
) -> Result<String, CryptoError> {
    if value.algorithm != alg.algorithm() {
        return Err(CryptoError::AlgorithmMismatch {
            expected: alg.algorithm().to_string(),
            found: value.algorithm.clone(),
        });
    }
    if !alg.decryption_key_ids().contains(&value.key_id) {
        return Err(CryptoError::UnknownKey(value.key_id.clone()));
    }
    let plain = alg.decrypt(&value.crypted, &value.key_id)?;
    String::from_utf8(plain).map_err(|_| CryptoError::Decrypt)
}

/// AES-256-GCM keyring.
///
/// Ciphertexts are laid out as `nonce (12 bytes) || ciphertext+tag`, with a
/// fresh random nonce per encryption.
pub struct AesGcmEncryption {
    active: String,
    keys: HashMap<String, Aes256Gcm>,
}

impl AesGcmEncryption {
    /// Create a keyring with a single active key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] unless `key` is 32 bytes long.
    pub fn new(key_id: impl Into<String>, key: &[u8]) -> Result<Self, CryptoError> {
        let key_id = key_id.into();
        let cipher = cipher_for(&key_id, key)?;
        Ok(Self {
            active: key_id.clone(),
            keys: HashMap::from([(key_id, cipher)]),
        })
    }

    /// Keep a retired key available for decryption only.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] unless `key` is 32 bytes long.
    pub fn with_retired_key(
        mut self,
        key_id: impl Into<String>,
        key: &[u8],
    ) -> Result<Self, CryptoError> {
        let key_id = key_id.into();
        let cipher = cipher_for(&key_id, key)?;
        self.keys.insert(key_id, cipher);
        Ok(self)
    }

    /// Make a new key active; the previous one stays available for decryption.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] unless `key` is 32 bytes long.
    pub fn rotate(mut self, key_id: impl Into<String>, key: &[u8]) -> Result<Self, CryptoError> {
        let key_id = key_id.into();
        let cipher = cipher_for(&key_id, key)?;
        self.keys.insert(key_id.clone(), cipher);
        self.active = key_id;
        Ok(self)
    }

    /// Generate a random 32-byte key.
    pub fn generate_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }
}

impl fmt::Debug for AesGcmEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.keys.keys().collect();
        ids.sort();
        f.debug_struct("AesGcmEncryption")
            .field("active", &self.active)
            .field("keys", &ids)
            .finish()
    }
}

fn cipher_for(key_id: &str, key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey(key_id.to_string()));
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey(key_id.to_string()))
}

impl EncryptionAlgorithm for AesGcmEncryption {
    fn algorithm(&self) -> &str {
        AES_256_GCM
    }

    fn encryption_key_id(&self) -> &str {
        &self.active
    }

    fn decryption_key_ids(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }

    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self
            .keys
            .get(&self.active)
            .ok_or_else(|| CryptoError::UnknownKey(self.active.clone()))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plain)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, crypted: &[u8], key_id: &str) -> Result<Vec<u8>, CryptoError> {
        let cipher = self
            .keys
            .get(key_id)
            .ok_or_else(|| CryptoError::UnknownKey(key_id.to_string()))?;
        if crypted.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = crypted.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

/// Serde adapter storing bytes as standard base64.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
