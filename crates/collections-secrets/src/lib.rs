//! Envelope-encrypted secret storage.
//!
//! Tokens are never written to disk in plaintext. Each entry is stored as
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)`, encrypted with
//! AES-256-GCM (`ring`, the same primitive the teacher uses for its own
//! at-rest encryption — see `common/src/aes.rs`). The AES key is derived
//! with PBKDF2-HMAC-SHA256 from an installation-stable passphrase and a
//! random salt persisted alongside the store on first use, mirroring the
//! original's `TokenCache._derive_key`.

use std::{
    fs,
    num::NonZeroU32,
    path::{Path, PathBuf},
};

use ring::{
    aead::{self, BoundKey},
    pbkdf2,
    rand::{SecureRandom, SystemRandom},
};
use thiserror::Error;

use collections_core::{Classify, ErrorKind};

const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("secret entry at {path} is corrupt or too short to contain a valid envelope")]
    Corrupt { path: String },
    #[error("decryption failed for {path}: wrong key or tampered data")]
    DecryptionFailed { path: String },
    #[error("key derivation failed")]
    KeyDerivation,
}

impl Classify for SecretStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            SecretStoreError::Io { .. } => ErrorKind::Transient,
            SecretStoreError::Corrupt { .. } => ErrorKind::StateCorruption,
            SecretStoreError::DecryptionFailed { .. } => ErrorKind::StateCorruption,
            SecretStoreError::KeyDerivation => ErrorKind::StateCorruption,
        }
    }
}

/// A keyed store for opaque encrypted secrets. Implemented once over the
/// filesystem ([`FileSecretStore`]); kept as a trait so callers (C2's
/// `TokenCache`) don't hard-depend on the concrete backend.
pub trait SecretStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), SecretStoreError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SecretStoreError>;
    fn delete(&self, key: &str) -> Result<(), SecretStoreError>;
}

/// Stores one file per key under `{root}/{app}.{provider}:{account}`.
/// `key` is the caller's responsibility to format (spec §6:
/// `{app}.{provider}:{account}`); this store treats it as an opaque,
/// filesystem-safe string.
pub struct FileSecretStore {
    root: PathBuf,
    aes_key: aead::LessSafeKey,
    rng: SystemRandom,
}

impl FileSecretStore {
    /// Opens (creating if absent) a secret store rooted at `root`, deriving
    /// its AES key from `passphrase` and a salt persisted at
    /// `{root}/.salt` (generated on first use).
    pub fn open(root: impl Into<PathBuf>, passphrase: &[u8]) -> Result<Self, SecretStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| SecretStoreError::Io {
                path: root.display().to_string(),
                source: e,
            })?;
        let rng = SystemRandom::new();
        let salt = Self::load_or_create_salt(&root, &rng)?;
        let aes_key = Self::derive_key(passphrase, &salt)?;
        Ok(Self { root, aes_key, rng })
    }

    fn load_or_create_salt(root: &Path, rng: &SystemRandom) -> Result<[u8; SALT_LEN], SecretStoreError> {
        let salt_path = root.join(".salt");
        match fs::read(&salt_path) {
            Ok(bytes) if bytes.len() == SALT_LEN => {
                let mut salt = [0u8; SALT_LEN];
                salt.copy_from_slice(&bytes);
                Ok(salt)
            }
            Ok(_) => Err(SecretStoreError::Corrupt {
                path: salt_path.display().to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut salt = [0u8; SALT_LEN];
                rng.fill(&mut salt).map_err(|_| SecretStoreError::KeyDerivation)?;
                write_private(&salt_path, &salt).map_err(|e| SecretStoreError::Io {
                    path: salt_path.display().to_string(),
                    source: e,
                })?;
                Ok(salt)
            }
            Err(e) => Err(SecretStoreError::Io {
                path: salt_path.display().to_string(),
                source: e,
            }),
        }
    }

    fn derive_key(passphrase: &[u8], salt: &[u8; SALT_LEN]) -> Result<aead::LessSafeKey, SecretStoreError> {
        let mut key_bytes = [0u8; KEY_LEN];
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).expect("nonzero constant");
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            passphrase,
            &mut key_bytes,
        );
        let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
            .map_err(|_| SecretStoreError::KeyDerivation)?;
        Ok(aead::LessSafeKey::new(unbound))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_filename(key))
    }
}

impl SecretStore for FileSecretStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), SecretStoreError> {
        let path = self.entry_path(key);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| SecretStoreError::KeyDerivation)?;
        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = bytes.to_vec();
        self.aes_key
            .seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
            .map_err(|_| SecretStoreError::KeyDerivation)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + in_out.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&in_out);

        write_private(&path, &envelope).map_err(|e| SecretStoreError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SecretStoreError> {
        let path = self.entry_path(key);
        let envelope = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SecretStoreError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        if envelope.len() < NONCE_LEN + aead::AES_256_GCM.tag_len() {
            return Err(SecretStoreError::Corrupt {
                path: path.display().to_string(),
            });
        }
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        let nonce = aead::Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| SecretStoreError::Corrupt {
                path: path.display().to_string(),
            })?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .aes_key
            .open_in_place(nonce, aead::Aad::empty(), &mut in_out)
            .map_err(|_| SecretStoreError::DecryptionFailed {
                path: path.display().to_string(),
            })?;
        Ok(Some(plaintext.to_vec()))
    }

    fn delete(&self, key: &str) -> Result<(), SecretStoreError> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SecretStoreError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }
}

/// Replaces filesystem-unsafe characters (`/`, `:`) in a `{app}.{provider}
/// :{account}` key with `_` so it's a valid single path component while
/// staying visually close to the original key for debugging.
fn sanitize_filename(key: &str) -> String {
    key.chars()
        .map(|c| if c == '/' || c == ':' { '_' } else { c })
        .collect()
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    std::io::Write::write_all(&mut f, bytes)
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    fs::write(path, bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    fn store(dir: &Path) -> FileSecretStore {
        FileSecretStore::open(dir, b"test-passphrase").unwrap()
    }

    #[test]
    fn round_trips_put_get() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        s.put("novotechno.microsoft:acct1", b"super-secret-token").unwrap();
        let got = s.get("novotechno.microsoft:acct1").unwrap();
        assert_eq!(got.unwrap(), b"super-secret-token");
    }

    #[test]
    fn missing_key_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        assert!(s.get("nope").unwrap().is_none());
    }

    #[test]
    fn delete_then_get_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        s.put("k", b"v").unwrap();
        s.delete("k").unwrap();
        assert!(s.get("k").unwrap().is_none());
    }

    #[test]
    fn reopening_with_same_passphrase_can_decrypt() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let s = store(tmp.path());
            s.put("k", b"persisted").unwrap();
        }
        let s2 = store(tmp.path());
        assert_eq!(s2.get("k").unwrap().unwrap(), b"persisted");
    }

    #[test]
    fn reopening_with_wrong_passphrase_fails_to_decrypt() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let s = store(tmp.path());
            s.put("k", b"persisted").unwrap();
        }
        let s2 = FileSecretStore::open(tmp.path(), b"wrong-passphrase").unwrap();
        assert!(matches!(
            s2.get("k"),
            Err(SecretStoreError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn corrupt_envelope_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        fs::write(tmp.path().join("k"), b"too short").unwrap();
        assert!(matches!(s.get("k"), Err(SecretStoreError::Corrupt { .. })));
    }
}
