//! Vault configuration.
//!
//! Not itself part of the data-flow pipeline: a small serde-serializable
//! value describing how to wire the other modules together (chunk size,
//! cache bound, and an opaque description of the backend the embedder is
//! responsible for constructing a [`crate::blob::BlobStore`] for).

use serde::{Deserialize, Serialize};

/// Default chunk split size: 256 MiB.
pub const DEFAULT_CHUNK_SPLIT_SIZE: u64 = 256 * 1024 * 1024;

/// Default cache capacity bound: 4 GiB.
pub const DEFAULT_CACHE_CAPACITY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Must be a power of two; files are split into chunks of this size.
    pub chunk_split_size: u64,

    /// Upper bound on bytes retained in the local cache before LRU eviction
    /// kicks in. Entries that are not `Clean`/`Absent` are never evicted
    /// regardless of this bound.
    pub cache_capacity_bytes: u64,

    /// Opaque to this crate; interpreted by whatever constructs the backend
    /// `BlobStore` the embedder passes in.
    pub backend_kind: String,
    pub backend_root: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        VaultConfig {
            chunk_split_size: DEFAULT_CHUNK_SPLIT_SIZE,
            cache_capacity_bytes: DEFAULT_CACHE_CAPACITY_BYTES,
            backend_kind: String::new(),
            backend_root: String::new(),
        }
    }
}

impl VaultConfig {
    /// Validate invariants that the rest of the crate relies on.
    pub fn validate(&self) -> Result<(), String> {
        if !self.chunk_split_size.is_power_of_two() {
            return Err(format!(
                "chunk_split_size must be a power of two, got {}",
                self.chunk_split_size
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(VaultConfig::default().validate().is_ok());
    }

    #[test]
    fn non_power_of_two_chunk_size_rejected() {
        let mut cfg = VaultConfig::default();
        cfg.chunk_split_size = 100;
        assert!(cfg.validate().is_err());
    }
}
