//! Chunked file I/O.
//!
//! A file's content is split into fixed-size chunks of [`split_size`]
//! bytes; each chunk lives in its own blob, addressed by a generated path
//! and tracked as a [`FileChunk`] record (offset, length, blob path). Chunk
//! records for a file are obtained from a [`ChunksArrayIO`] collaborator —
//! in production this is backed by the owning file node's chunk list in the
//! inode database, but the trait boundary lets chunk layout be tested
//! without a full inode DB.
//!
//! Each chunk blob carries a small header (magic, format version, payload
//! length, best-effort original path, and a monotonic chunk version) ahead
//! of the frame-encrypted payload.
//!
//! [`split_size`]: ChunkedFileIO::split_size

mod header;
mod io;

pub use header::ChunkHeader;
pub use io::ChunkIo;

use crate::blob::{generate_new_blob_path, BlobStore};
use crate::error::Result;
use crate::frame::FrameKey;

use std::sync::Arc;

/// A single chunk's placement within a file and the blob that backs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub offset: u64,
    pub length: u64,
    pub blob_path: String,
}

/// Collaborator providing the ordered chunk list for one file. Production
/// callers back this with the file node's chunk records in the inode
/// database; it is a trait so chunk-layout logic can be tested against an
/// in-memory double.
pub trait ChunksArrayIO: Send {
    fn read(&self) -> Result<Vec<FileChunk>>;
    fn write(&mut self, chunks: Vec<FileChunk>) -> Result<()>;
}

/// A `ChunksArrayIO` backed by nothing but a `Vec` held in memory, useful
/// for tests and as a reference implementation of the trait's contract.
pub struct InMemoryChunksArrayIO {
    chunks: Vec<FileChunk>,
}

impl InMemoryChunksArrayIO {
    #[must_use]
    pub fn new() -> Self {
        InMemoryChunksArrayIO { chunks: Vec::new() }
    }
}

impl Default for InMemoryChunksArrayIO {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunksArrayIO for InMemoryChunksArrayIO {
    fn read(&self) -> Result<Vec<FileChunk>> {
        Ok(self.chunks.clone())
    }

    fn write(&mut self, chunks: Vec<FileChunk>) -> Result<()> {
        self.chunks = chunks;
        Ok(())
    }
}

/// Chunked file I/O over a blob store: maps file-relative offsets onto
/// per-chunk blobs of at most `split_size` bytes each.
pub struct ChunkedFileIo {
    bs: Arc<dyn BlobStore>,
    key: FrameKey,
    split_size: u64,
    orig_path: String,
}

impl ChunkedFileIo {
    pub fn new(bs: Arc<dyn BlobStore>, key: FrameKey, split_size: u64, orig_path: impl Into<String>) -> Self {
        assert!(split_size.is_power_of_two(), "split_size must be a power of two");
        ChunkedFileIo {
            bs,
            key,
            split_size,
            orig_path: orig_path.into(),
        }
    }

    #[must_use]
    pub fn split_size(&self) -> u64 {
        self.split_size
    }

    fn chunk_index(&self, offset: u64) -> u64 {
        offset / self.split_size
    }

    fn chunk_start(&self, index: u64) -> u64 {
        index * self.split_size
    }

    fn find_chunk(chunks: &[FileChunk], start: u64) -> Option<usize> {
        chunks.iter().position(|c| c.offset == start)
    }

    /// Read `buf.len()` bytes (or fewer, at EOF) starting at `offset`.
    /// Regions with no backing chunk read as zero (no sparse-hole support:
    /// unwritten regions are simply never materialized and are treated as
    /// zero-filled on read).
    pub fn pread(
        &self,
        chunks_io: &dyn ChunksArrayIO,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let chunks = chunks_io.read()?;
        let mut total = 0usize;
        while total < buf.len() {
            let cur_offset = offset + total as u64;
            let index = self.chunk_index(cur_offset);
            let start = self.chunk_start(index);
            let within = (cur_offset - start) as usize;
            let want = (buf.len() - total).min((self.split_size as usize) - within);

            match Self::find_chunk(&chunks, start) {
                Some(i) => {
                    let chunk = &chunks[i];
                    if within as u64 >= chunk.length {
                        buf[total..total + want].fill(0);
                    } else {
                        let io = ChunkIo::new(self.bs.clone(), self.key.clone(), &chunk.blob_path);
                        let read_len = want.min((chunk.length - within as u64) as usize);
                        io.pread(within as u64, &mut buf[total..total + read_len])?;
                        if read_len < want {
                            buf[total + read_len..total + want].fill(0);
                        }
                    }
                }
                None => buf[total..total + want].fill(0),
            }
            total += want;
        }
        Ok(total)
    }

    /// Write `data` at `offset`, creating chunks as needed and updating the
    /// chunk list via `chunks_io`.
    pub fn pwrite(
        &self,
        chunks_io: &mut dyn ChunksArrayIO,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let mut chunks = chunks_io.read()?;
        let mut total = 0usize;
        while total < data.len() {
            let cur_offset = offset + total as u64;
            let index = self.chunk_index(cur_offset);
            let start = self.chunk_start(index);
            let within = (cur_offset - start) as u64;
            let take = (data.len() - total).min((self.split_size - within) as usize);

            let chunk_idx = match Self::find_chunk(&chunks, start) {
                Some(i) => i,
                None => {
                    let blob_path = generate_new_blob_path(self.bs.as_ref())?;
                    chunks.push(FileChunk {
                        offset: start,
                        length: 0,
                        blob_path,
                    });
                    chunks.len() - 1
                }
            };

            let blob_path = chunks[chunk_idx].blob_path.clone();
            let io = ChunkIo::new(self.bs.clone(), self.key.clone(), &blob_path);
            io.pwrite(within, &data[total..total + take])?;

            let new_len = (within + take as u64).max(chunks[chunk_idx].length);
            chunks[chunk_idx].length = new_len;

            total += take;
        }
        chunks_io.write(chunks)?;
        Ok(total)
    }

    /// Truncate the file to `new_size`, dropping chunks entirely past the
    /// new size and shrinking the last surviving chunk.
    pub fn truncate(&self, chunks_io: &mut dyn ChunksArrayIO, new_size: u64) -> Result<()> {
        let chunks = chunks_io.read()?;
        let mut kept = Vec::new();
        for chunk in chunks {
            if chunk.offset >= new_size {
                let _ = self.bs.remove(&chunk.blob_path);
                continue;
            }
            let max_len = new_size - chunk.offset;
            if chunk.length > max_len {
                let io = ChunkIo::new(self.bs.clone(), self.key.clone(), &chunk.blob_path);
                io.truncate(max_len)?;
                kept.push(FileChunk {
                    length: max_len,
                    ..chunk
                });
            } else {
                kept.push(chunk);
            }
        }
        chunks_io.write(kept)
    }
}

impl std::fmt::Debug for ChunkedFileIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedFileIo")
            .field("split_size", &self.split_size)
            .field("orig_path", &self.orig_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FileBlobStore;

    fn io(split_size: u64) -> (ChunkedFileIo, InMemoryChunksArrayIO) {
        let dir = tempfile::tempdir().unwrap();
        // Leak the tempdir for the lifetime of the test; fine for unit tests.
        let path = dir.into_path();
        let bs = Arc::new(FileBlobStore::new(path).unwrap());
        let key = FrameKey::new([3u8; 32]);
        (
            ChunkedFileIo::new(bs, key, split_size, "orig/path.txt"),
            InMemoryChunksArrayIO::new(),
        )
    }

    #[test]
    fn single_chunk_round_trip() {
        let (cfio, mut arr) = io(64 * 1024);
        cfio.pwrite(&mut arr, 0, b"Hello, World!").unwrap();
        let mut buf = [0u8; 13];
        cfio.pread(&arr, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"Hello, World!");
        let chunks = arr.read().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 0);
    }

    #[test]
    fn multi_chunk_write_splits_across_blobs() {
        let split = 16u64;
        let (cfio, mut arr) = io(split);
        let data = vec![0x42u8; (split * 3) as usize];
        cfio.pwrite(&mut arr, 0, &data).unwrap();

        let chunks = arr.read().unwrap();
        assert_eq!(chunks.len(), 3);
        let mut offsets: Vec<u64> = chunks.iter().map(|c| c.offset).collect();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, split, split * 2]);

        let mut buf = vec![0u8; data.len()];
        cfio.pread(&arr, 0, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn write_across_chunk_boundary() {
        let split = 16u64;
        let (cfio, mut arr) = io(split);
        let data = vec![0x7u8; 10];
        cfio.pwrite(&mut arr, split - 5, &data).unwrap();

        let chunks = arr.read().unwrap();
        assert_eq!(chunks.len(), 2);

        let mut buf = vec![0u8; 10];
        cfio.pread(&arr, split - 5, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn unwritten_region_reads_zero_filled() {
        let (cfio, mut arr) = io(4096);
        cfio.pwrite(&mut arr, 100, b"x").unwrap();
        let mut buf = [0xFFu8; 10];
        cfio.pread(&arr, 0, &mut buf).unwrap();
        assert_eq!(&buf, &[0u8; 10]);
    }

    #[test]
    fn truncate_drops_and_shrinks_chunks() {
        let split = 16u64;
        let (cfio, mut arr) = io(split);
        let data = vec![0xAAu8; (split * 3) as usize];
        cfio.pwrite(&mut arr, 0, &data).unwrap();

        cfio.truncate(&mut arr, split + 4).unwrap();
        let chunks = arr.read().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.iter().map(|c| c.length).sum::<u64>(), split + 4);
    }
}
