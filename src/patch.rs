//! Write patch cache.
//!
//! Buffers pending writes as a sorted, non-overlapping list of patches
//! above the chunked file I/O layer. Reads are served by reading through to
//! the underlying storage and overlaying any patches that intersect the
//! requested range; writes are merged into the patch list without
//! immediately touching the underlying chunk store. Flushing applies every
//! patch to the underlying store in offset order and clears the cache.

use crate::error::Result;

/// Flush when more than this many patches have accumulated.
pub const MAX_PATCHES: usize = 32;
/// Flush when the patch list holds more than this many total bytes.
pub const MAX_PATCH_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
struct Patch {
    offset: u64,
    data: Vec<u8>,
}

impl Patch {
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

#[derive(Debug, Default)]
pub struct PatchCache {
    patches: Vec<Patch>,
}

impl PatchCache {
    #[must_use]
    pub fn new() -> Self {
        PatchCache {
            patches: Vec::new(),
        }
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.patches.iter().map(|p| p.data.len()).sum()
    }

    #[must_use]
    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    #[must_use]
    pub fn needs_sync(&self) -> bool {
        self.patches.len() > MAX_PATCHES || self.total_bytes() > MAX_PATCH_BYTES
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Record a pending write, merging it with any overlapping or adjacent
    /// existing patches so the list stays sorted and non-overlapping.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.patches.push(Patch {
            offset,
            data: data.to_vec(),
        });
        self.coalesce();
    }

    fn coalesce(&mut self) {
        self.patches.sort_by_key(|p| p.offset);
        let mut merged: Vec<Patch> = Vec::with_capacity(self.patches.len());
        for patch in self.patches.drain(..) {
            match merged.last_mut() {
                Some(last) if patch.offset <= last.end() => {
                    let overlap_start = (patch.offset - last.offset) as usize;
                    if patch.end() > last.end() {
                        last.data.truncate(overlap_start);
                        last.data.extend_from_slice(&patch.data);
                    }
                    // else: patch is fully contained in `last`; newer write
                    // still wins for the overlapping bytes.
                    if overlap_start < last.data.len() {
                        let write_len = patch.data.len().min(last.data.len() - overlap_start);
                        last.data[overlap_start..overlap_start + write_len]
                            .copy_from_slice(&patch.data[..write_len]);
                    }
                }
                _ => merged.push(patch),
            }
        }
        self.patches = merged;
    }

    /// Read `buf.len()` bytes starting at `offset`. Bytes not covered by a
    /// patch are filled by calling `read_underlying` first; patches are
    /// then overlaid on top.
    pub fn read_through(
        &self,
        offset: u64,
        buf: &mut [u8],
        mut read_underlying: impl FnMut(u64, &mut [u8]) -> Result<usize>,
    ) -> Result<usize> {
        let n = read_underlying(offset, buf)?;
        let range_end = offset + buf.len() as u64;
        for patch in &self.patches {
            if patch.end() <= offset || patch.offset >= range_end {
                continue;
            }
            let overlap_start = patch.offset.max(offset);
            let overlap_end = patch.end().min(range_end);
            let buf_start = (overlap_start - offset) as usize;
            let buf_end = (overlap_end - offset) as usize;
            let patch_start = (overlap_start - patch.offset) as usize;
            buf[buf_start..buf_end]
                .copy_from_slice(&patch.data[patch_start..patch_start + (buf_end - buf_start)]);
        }
        Ok(n)
    }

    /// Apply every patch to the underlying store in offset order, then
    /// clear the cache.
    pub fn flush(
        &mut self,
        mut write_underlying: impl FnMut(u64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        for patch in &self.patches {
            write_underlying(patch.offset, &patch.data)?;
        }
        self.patches.clear();
        Ok(())
    }

    /// Clip patches to a shrunk file size, dropping any entirely past
    /// `new_len` and truncating one that straddles it.
    pub fn truncate(&mut self, new_len: u64) {
        for patch in &mut self.patches {
            if patch.offset < new_len && patch.end() > new_len {
                patch.data.truncate((new_len - patch.offset) as usize);
            }
        }
        self.patches.retain(|p| p.offset < new_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_through_no_underlying_data() {
        let mut cache = PatchCache::new();
        cache.write(0, b"hello");
        let mut buf = [0u8; 5];
        cache
            .read_through(0, &mut buf, |_, b| {
                b.fill(0);
                Ok(b.len())
            })
            .unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn overlapping_writes_merge_newest_wins() {
        let mut cache = PatchCache::new();
        cache.write(0, b"aaaaaaaaaa");
        cache.write(2, b"bb");
        assert_eq!(cache.patch_count(), 1);

        let mut buf = [0u8; 10];
        cache
            .read_through(0, &mut buf, |_, b| {
                b.fill(0);
                Ok(b.len())
            })
            .unwrap();
        assert_eq!(&buf, b"aabbaaaaaa");
    }

    #[test]
    fn adjacent_writes_merge_into_one_patch() {
        let mut cache = PatchCache::new();
        cache.write(0, b"abc");
        cache.write(3, b"def");
        assert_eq!(cache.patch_count(), 1);
    }

    #[test]
    fn read_through_mixes_patch_and_underlying() {
        let mut cache = PatchCache::new();
        cache.write(2, b"XX");
        let mut buf = [0u8; 6];
        cache
            .read_through(0, &mut buf, |_, b| {
                b.copy_from_slice(&b"abcdef"[..b.len()]);
                Ok(b.len())
            })
            .unwrap();
        assert_eq!(&buf, b"abXXef");
    }

    #[test]
    fn needs_sync_on_patch_count() {
        let mut cache = PatchCache::new();
        for i in 0..33 {
            cache.write(i * 100, b"x");
        }
        assert!(cache.needs_sync());
    }

    #[test]
    fn flush_applies_in_order_and_clears() {
        let mut cache = PatchCache::new();
        cache.write(10, b"b");
        cache.write(0, b"a");
        let mut applied = Vec::new();
        cache
            .flush(|offset, data| {
                applied.push((offset, data.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(applied, vec![(0, b"a".to_vec()), (10, b"b".to_vec())]);
        assert!(cache.is_empty());
    }

    #[test]
    fn truncate_clips_straddling_patch_and_drops_later_ones() {
        let mut cache = PatchCache::new();
        cache.write(0, b"0123456789");
        cache.write(20, b"late");
        cache.truncate(5);
        assert_eq!(cache.patch_count(), 1);
        let mut applied = Vec::new();
        cache
            .flush(|offset, data| {
                applied.push((offset, data.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(applied, vec![(0, b"01234".to_vec())]);
    }
}
