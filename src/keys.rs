//! Key derivation and memory-protected key storage.
//!
//! [`VaultKey`] wraps a single 256-bit AEAD key behind [`memsafe::MemSafe`]
//! and an `RwLock`, following the same scoped-access discipline as a
//! two-key master key wrapper: callers never get a bare reference to the
//! key bytes, only a callback invocation with the key temporarily readable.

use std::sync::RwLock;

use memsafe::MemSafe;
use scrypt::{scrypt, Params};
use thiserror::Error;
use zeroize::Zeroize;

use crate::frame::FrameKey;

#[derive(Debug, Error)]
pub enum KeyAccessError {
    #[error("memory protection operation failed: {0}")]
    MemoryProtection(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("key lock was poisoned")]
    LockPoisoned,
}

impl KeyAccessError {
    fn memory_protection<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        KeyAccessError::MemoryProtection(Box::new(err))
    }
}

/// A memory-protected 256-bit AEAD key.
#[derive(Debug)]
pub struct VaultKey {
    key: RwLock<MemSafe<[u8; 32]>>,
}

impl VaultKey {
    pub fn new(bytes: [u8; 32]) -> Result<Self, KeyAccessError> {
        Ok(VaultKey {
            key: RwLock::new(MemSafe::new(bytes).map_err(KeyAccessError::memory_protection)?),
        })
    }

    pub fn random() -> Result<Self, KeyAccessError> {
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut bytes);
        Self::new(bytes)
    }

    /// Run `f` with the raw key bytes visible only for the duration of the
    /// call; the bytes are zeroized before this returns.
    pub fn with_key_bytes<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        struct ZeroOnDrop([u8; 32]);
        impl Drop for ZeroOnDrop {
            fn drop(&mut self) {
                self.0.zeroize();
            }
        }

        let mut lock = self.key.write().map_err(|_| KeyAccessError::LockPoisoned)?;
        let guard = lock.read().map_err(KeyAccessError::memory_protection)?;
        let copy = ZeroOnDrop(*guard);
        Ok(f(&copy.0))
    }

    /// Produce a [`FrameKey`] for use with the frame codec.
    pub fn frame_key(&self) -> Result<FrameKey, KeyAccessError> {
        self.with_key_bytes(|bytes| FrameKey::new(*bytes))
    }
}

/// scrypt parameters for passphrase-to-key derivation (log_n=15, r=8, p=1).
fn kdf_params() -> Params {
    Params::new(15, 8, 1, 32).expect("static scrypt params are always valid")
}

/// Derive a 256-bit key from a passphrase and salt.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> Result<VaultKey, KeyAccessError> {
    let mut out = [0u8; 32];
    scrypt(passphrase.as_bytes(), salt, &kdf_params(), &mut out)
        .map_err(KeyAccessError::memory_protection)?;
    let key = VaultKey::new(out);
    out.zeroize();
    key
}
