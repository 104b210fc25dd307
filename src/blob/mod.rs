//! Blob store abstraction.
//!
//! A `BlobStore` is an opaque key-value byte store addressed by path-like
//! strings, supporting positional reads/writes, size queries, truncation,
//! and listing. Both the remote backend and the local disk cache implement
//! this trait; everything above this layer is backend-agnostic.

mod file_store;
mod mux;

pub use file_store::FileBlobStore;
pub use mux::BlobStoreMux;

use rand::RngCore;

use crate::error::{Error, Result};

/// Requested access mode for [`BlobStore::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlags {
    ReadOnly,
    ReadWrite,
    /// Create the blob if it does not exist.
    ReadWriteCreate,
    /// Create the blob; fail if it already exists.
    ReadWriteCreateExclusive,
}

impl OpenFlags {
    #[must_use]
    pub fn is_write_allowed(self) -> bool {
        !matches!(self, OpenFlags::ReadOnly)
    }

    #[must_use]
    pub fn is_create(self) -> bool {
        matches!(
            self,
            OpenFlags::ReadWriteCreate | OpenFlags::ReadWriteCreateExclusive
        )
    }
}

/// A handle to an opened blob.
pub trait BlobHandle: Send {
    fn pread(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn pwrite(&mut self, offset: u64, buf: &[u8]) -> Result<usize>;
    fn size(&self) -> Result<u64>;
    fn truncate(&mut self, size: u64) -> Result<()>;
    fn close(self: Box<Self>) -> Result<()>;
}

/// The blob store trait: open/remove/list over opaque path-addressed blobs.
pub trait BlobStore: Send + Sync {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn BlobHandle>>;
    fn remove(&self, path: &str) -> Result<()>;
    fn list(&self) -> Result<Vec<String>>;
}

/// Generate a fresh, unused blob path in `store` and create it, retrying on
/// collision. Mirrors the original `GenerateNewBlobPath` helper.
pub fn generate_new_blob_path(store: &dyn BlobStore) -> Result<String> {
    for _ in 0..64 {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        let path = hex::encode(bytes);
        match store.open(&path, OpenFlags::ReadWriteCreateExclusive) {
            Ok(handle) => {
                handle.close()?;
                return Ok(path);
            }
            Err(Error::AlreadyExists { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::Internal(
        "could not generate a unique blob path after 64 attempts".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_paths_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let path = generate_new_blob_path(&store).unwrap();
            assert!(seen.insert(path));
        }
        assert_eq!(store.list().unwrap().len(), 200);
    }
}
