//! Credential Vault
//!
//! Envelope-encrypts small secrets under a key held by a [`KeyStore`]
//! and stores the result in a [`PrefStore`].
//!
//! # Record Format
//!
//! ```text
//! "v1:" + base64( iv_len (1 byte) || iv || ciphertext || tag (16 bytes) )
//! ```
//!
//! Records are addressed by `service + ":" + key`. Anything that fails to
//! decode or authenticate reads back as "not present".

use crate::keystore::KeyStore;
use crate::prefs::PrefStore;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Alias of the wrapping key inside the key store
pub const CREDENTIALS_KEY_ALIAS: &str = "tollgate_credentials_key";

/// Version prefix of stored payloads
pub const FORMAT_PREFIX: &str = "v1:";

/// Credential vault
#[derive(Clone)]
pub struct CredentialVault {
    keystore: Arc<dyn KeyStore>,
    store: Arc<dyn PrefStore>,
}

impl CredentialVault {
    /// Create a vault over the given key store and record store
    pub fn new(keystore: Arc<dyn KeyStore>, store: Arc<dyn PrefStore>) -> Self {
        Self { keystore, store }
    }

    /// Read a secret
    pub fn get(&self, service: &str, key: &str) -> Option<String> {
        let payload = self.store.get_string(&record_id(service, key))?;
        match self.open(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Credential {}:{} unreadable: {}", service, key, e);
                None
            }
        }
    }

    /// Store or overwrite a secret
    pub fn set(&self, service: &str, key: &str, value: &str) -> bool {
        let payload = match self.keystore.encrypt(CREDENTIALS_KEY_ALIAS, value.as_bytes()) {
            Ok(sealed) => match encode_payload(&sealed.iv, &sealed.ciphertext) {
                Some(payload) => payload,
                None => {
                    warn!("Credential {}:{} IV too long to encode", service, key);
                    return false;
                }
            },
            Err(e) => {
                warn!("Encrypt credential {}:{} failed: {}", service, key, e);
                return false;
            }
        };

        match self.store.put_string(&record_id(service, key), &payload) {
            Ok(()) => true,
            Err(e) => {
                warn!("Persist credential {}:{} failed: {}", service, key, e);
                false
            }
        }
    }

    /// Remove a secret (removing a missing secret succeeds)
    pub fn delete(&self, service: &str, key: &str) -> bool {
        match self.store.remove(&record_id(service, key)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Delete credential {}:{} failed: {}", service, key, e);
                false
            }
        }
    }

    fn open(&self, payload: &str) -> Result<String, VaultError> {
        let (iv, ciphertext) = decode_payload(payload)?;
        let plain = self
            .keystore
            .decrypt(CREDENTIALS_KEY_ALIAS, &iv, &ciphertext)
            .map_err(|e| VaultError::Cipher(e.to_string()))?;
        String::from_utf8(plain).map_err(|_| VaultError::NotUtf8)
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialVault([redacted])")
    }
}

/// Composite record identifier
pub fn record_id(service: &str, key: &str) -> String {
    format!("{}:{}", service, key)
}

/// Encode an IV and ciphertext into a stored payload
///
/// Returns `None` when the IV does not fit the one-byte length field.
pub fn encode_payload(iv: &[u8], ciphertext: &[u8]) -> Option<String> {
    let iv_len = u8::try_from(iv.len()).ok()?;

    let mut raw = Vec::with_capacity(1 + iv.len() + ciphertext.len());
    raw.push(iv_len);
    raw.extend_from_slice(iv);
    raw.extend_from_slice(ciphertext);

    Some(format!("{}{}", FORMAT_PREFIX, BASE64.encode(raw)))
}

/// Split a stored payload into IV and ciphertext
pub fn decode_payload(payload: &str) -> Result<(Vec<u8>, Vec<u8>), VaultError> {
    let encoded = payload
        .strip_prefix(FORMAT_PREFIX)
        .ok_or(VaultError::UnknownFormat)?;
    let raw = BASE64.decode(encoded).map_err(|_| VaultError::InvalidBase64)?;

    let (&iv_len, rest) = raw.split_first().ok_or(VaultError::Empty)?;
    let iv_len = iv_len as usize;
    // At least one ciphertext byte must follow the IV
    if iv_len == 0 || iv_len >= rest.len() {
        return Err(VaultError::InvalidIvLength(iv_len));
    }

    let (iv, ciphertext) = rest.split_at(iv_len);
    Ok((iv.to_vec(), ciphertext.to_vec()))
}

/// Reasons a stored record could not be read
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    #[error("Payload is missing the version prefix")]
    UnknownFormat,

    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Empty payload")]
    Empty,

    #[error("Invalid IV length: {0}")]
    InvalidIvLength(usize),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Decrypted value is not UTF-8")]
    NotUtf8,
}
