//! Wrapping Key Storage
//!
//! The credential vault never sees key material. It asks a [`KeyStore`]
//! to encrypt or decrypt under a named alias, and the key store creates
//! the AES-256-GCM key for that alias lazily on first use.
//!
//! On a device this trait is backed by the platform keystore. The
//! implementations here cover tests ([`SoftwareKeyStore`]) and desktop
//! hosts ([`FileKeyStore`]).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// GCM IV length in bytes
pub const IV_LEN: usize = 12;

/// Ciphertext produced by a key store (tag appended to ciphertext)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Encrypt/decrypt capability over non-exportable keys
pub trait KeyStore: Send + Sync {
    /// Encrypt `plaintext` under `alias`, creating the key if needed
    fn encrypt(&self, alias: &str, plaintext: &[u8]) -> Result<Sealed, KeyStoreError>;

    /// Decrypt and authenticate `ciphertext` under `alias`
    fn decrypt(&self, alias: &str, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, KeyStoreError>;
}

/// Seal with a fresh random IV
fn seal(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<Sealed, KeyStoreError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| KeyStoreError::Cipher("seal failed".into()))?;

    Ok(Sealed {
        iv: iv.to_vec(),
        ciphertext,
    })
}

/// Open, verifying the tag
fn open(cipher: &Aes256Gcm, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
    if iv.len() != IV_LEN {
        return Err(KeyStoreError::InvalidIv(iv.len()));
    }
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| KeyStoreError::Cipher("open failed".into()))
}

fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

fn cipher_from(bytes: &[u8; KEY_LEN]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(bytes))
}

/// Process-local key store
///
/// Keys live only in memory and vanish with the process.
#[derive(Default)]
pub struct SoftwareKeyStore {
    keys: Mutex<HashMap<String, Aes256Gcm>>,
}

impl SoftwareKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_cipher<T>(
        &self,
        alias: &str,
        f: impl FnOnce(&Aes256Gcm) -> Result<T, KeyStoreError>,
    ) -> Result<T, KeyStoreError> {
        let mut keys = self.keys.lock().map_err(|_| KeyStoreError::Unavailable)?;
        let cipher = keys.entry(alias.to_string()).or_insert_with(|| {
            debug!("Generating software key for alias {}", alias);
            cipher_from(&generate_key())
        });
        f(cipher)
    }
}

impl KeyStore for SoftwareKeyStore {
    fn encrypt(&self, alias: &str, plaintext: &[u8]) -> Result<Sealed, KeyStoreError> {
        self.with_cipher(alias, |cipher| seal(cipher, plaintext))
    }

    fn decrypt(&self, alias: &str, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        self.with_cipher(alias, |cipher| open(cipher, iv, ciphertext))
    }
}

impl fmt::Debug for SoftwareKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SoftwareKeyStore([redacted])")
    }
}

/// Key store that keeps one raw key file per alias
///
/// Key files are created with owner-only permissions on unix. The key
/// bytes are loaded into a cipher and never returned to callers.
pub struct FileKeyStore {
    dir: PathBuf,
    keys: Mutex<HashMap<String, Aes256Gcm>>,
}

impl FileKeyStore {
    /// Create a key store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn key_path(&self, alias: &str) -> Result<PathBuf, KeyStoreError> {
        let valid = !alias.is_empty()
            && alias
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(KeyStoreError::InvalidAlias(alias.to_string()));
        }
        Ok(self.dir.join(format!("{}.key", alias)))
    }

    fn load_or_create(&self, path: &Path) -> Result<[u8; KEY_LEN], KeyStoreError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let key: [u8; KEY_LEN] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| KeyStoreError::CorruptKey(path.display().to_string()))?;
                return Ok(key);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(KeyStoreError::Io(e.to_string())),
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| KeyStoreError::Io(e.to_string()))?;
        let key = generate_key();

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        match options.open(path) {
            Ok(mut file) => {
                file.write_all(&key)
                    .and_then(|_| file.sync_all())
                    .map_err(|e| KeyStoreError::Io(e.to_string()))?;
                info!("Created wrapping key {}", path.display());
                Ok(key)
            }
            // Another writer won the race; use its key
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let bytes = std::fs::read(path).map_err(|e| KeyStoreError::Io(e.to_string()))?;
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| KeyStoreError::CorruptKey(path.display().to_string()))
            }
            Err(e) => Err(KeyStoreError::Io(e.to_string())),
        }
    }

    fn with_cipher<T>(
        &self,
        alias: &str,
        f: impl FnOnce(&Aes256Gcm) -> Result<T, KeyStoreError>,
    ) -> Result<T, KeyStoreError> {
        let mut keys = self.keys.lock().map_err(|_| KeyStoreError::Unavailable)?;
        if !keys.contains_key(alias) {
            let path = self.key_path(alias)?;
            let bytes = self.load_or_create(&path)?;
            keys.insert(alias.to_string(), cipher_from(&bytes));
        }
        match keys.get(alias) {
            Some(cipher) => f(cipher),
            None => Err(KeyStoreError::Unavailable),
        }
    }
}

impl KeyStore for FileKeyStore {
    fn encrypt(&self, alias: &str, plaintext: &[u8]) -> Result<Sealed, KeyStoreError> {
        self.with_cipher(alias, |cipher| seal(cipher, plaintext))
    }

    fn decrypt(&self, alias: &str, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        self.with_cipher(alias, |cipher| open(cipher, iv, ciphertext))
    }
}

impl fmt::Debug for FileKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileKeyStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// Key store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyStoreError {
    #[error("Key store unavailable")]
    Unavailable,

    #[error("Invalid key alias: {0:?}")]
    InvalidAlias(String),

    #[error("Corrupt key file: {0}")]
    CorruptKey(String),

    #[error("Invalid IV length: {0}")]
    InvalidIv(usize),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Key store I/O error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::temp_dir;

    #[test]
    fn test_software_seal_open() {
        let store = SoftwareKeyStore::new();
        let sealed = store.encrypt("alias", b"secret").unwrap();

        assert_eq!(sealed.iv.len(), IV_LEN);
        // 16-byte GCM tag appended
        assert_eq!(sealed.ciphertext.len(), b"secret".len() + 16);

        let plain = store.decrypt("alias", &sealed.iv, &sealed.ciphertext).unwrap();
        assert_eq!(plain, b"secret");
    }

    #[test]
    fn test_fresh_iv_per_encrypt() {
        let store = SoftwareKeyStore::new();
        let a = store.encrypt("alias", b"same").unwrap();
        let b = store.encrypt("alias", b"same").unwrap();
        assert_ne!(a.iv, b.iv);
    }

    #[test]
    fn test_wrong_alias_fails() {
        let store = SoftwareKeyStore::new();
        let sealed = store.encrypt("one", b"secret").unwrap();
        assert!(store.decrypt("two", &sealed.iv, &sealed.ciphertext).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let store = SoftwareKeyStore::new();
        let mut sealed = store.encrypt("alias", b"secret").unwrap();
        sealed.ciphertext[0] ^= 0xff;
        assert!(matches!(
            store.decrypt("alias", &sealed.iv, &sealed.ciphertext),
            Err(KeyStoreError::Cipher(_))
        ));
    }

    #[test]
    fn test_short_iv_rejected() {
        let store = SoftwareKeyStore::new();
        assert!(matches!(
            store.decrypt("alias", &[1, 2, 3], &[0u8; 20]),
            Err(KeyStoreError::InvalidIv(3))
        ));
    }

    #[test]
    fn test_file_key_survives_reopen() {
        let dir = temp_dir("keystore");
        let sealed = FileKeyStore::new(dir.path())
            .encrypt("vault_key", b"persisted")
            .unwrap();

        let reopened = FileKeyStore::new(dir.path());
        let plain = reopened
            .decrypt("vault_key", &sealed.iv, &sealed.ciphertext)
            .unwrap();
        assert_eq!(plain, b"persisted");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_key_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = temp_dir("keystore");
        FileKeyStore::new(dir.path()).encrypt("k", b"x").unwrap();

        let mode = std::fs::metadata(dir.path().join("k.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_alias_rejects_paths() {
        let dir = temp_dir("keystore");
        let store = FileKeyStore::new(dir.path());
        assert!(matches!(
            store.encrypt("../escape", b"x"),
            Err(KeyStoreError::InvalidAlias(_))
        ));
    }
}
