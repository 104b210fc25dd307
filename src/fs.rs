//! Filesystem facade.
//!
//! Every operation here is path-free: callers address nodes by inode id,
//! exactly as the kernel filesystem binding or management server would
//! once they resolve a path to an id (that resolution happens outside this
//! crate). The facade owns the open-file table: each inode id that is
//! currently open has exactly one [`OpenFile`] shared across every handle
//! on it, mirroring one in-kernel inode having many file descriptors.
//!
//! The first handle opened for write takes an exclusive node lock from the
//! inode database; later write handles on the same node reuse it since
//! they share the same in-process `OpenFile`. The lock is released the
//! moment the last write-capable handle on that node closes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::chunk::{ChunkedFileIo, ChunksArrayIO, FileChunk};
use crate::error::Error;
use crate::frame::FrameKey;
use crate::inodedb::{InodeDb, Node, NodeKind, Op, ROOT_ID};

pub type Result<T> = std::result::Result<T, PosixError>;

/// POSIX-style error codes the facade translates [`Error`] into. A single
/// [`Error`] Kind can map to more than one
/// code; the mapping refines on message content where the Kind alone is
/// ambiguous (`WrongType` covers both "expected a directory" and "expected
/// a file").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosixError {
    EAcces,
    EBadF,
    EExist,
    EIsDir,
    ENoEnt,
    ENotDir,
    ENotEmpty,
    EPerm,
    /// Anything that doesn't fit a specific POSIX code (e.g. a cache
    /// corruption or backend outage): surfaced to the caller as an opaque
    /// I/O failure rather than invented as a more specific errno.
    EIo,
}

impl From<&Error> for PosixError {
    fn from(err: &Error) -> Self {
        match err {
            Error::NotFound { .. } => PosixError::ENoEnt,
            Error::AlreadyExists { what } if what.contains("not empty") => PosixError::ENotEmpty,
            Error::AlreadyExists { .. } => PosixError::EExist,
            Error::WrongType { what } if what.contains("expected a directory") => {
                PosixError::ENotDir
            }
            Error::WrongType { what } if what.contains("expected a file") => PosixError::EIsDir,
            Error::WrongType { .. } => PosixError::EIo,
            Error::LockBusy { .. } | Error::LockStale { .. } => PosixError::EAcces,
            Error::CryptoInit(_) | Error::AuthFailed { .. } => PosixError::EPerm,
            _ => PosixError::EIo,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl OpenMode {
    #[must_use]
    pub fn allows_write(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite)
    }
}

struct HandleEntry {
    id: u64,
    write_allowed: bool,
}

struct OpenFile {
    node_id: u64,
    lock_ticket: Mutex<Option<u64>>,
    patch: Mutex<crate::patch::PatchCache>,
    handles: Mutex<Vec<HandleEntry>>,
}

struct InodeChunksArrayIO<'a> {
    idb: &'a InodeDb,
    node_id: u64,
    /// The write-capable caller's current lock ticket. Only read-only
    /// callers (plain `pread`) may leave this as `0`, since `write` is
    /// never invoked without the node's exclusive lock held.
    ticket: u64,
}

impl ChunksArrayIO for InodeChunksArrayIO<'_> {
    fn read(&self) -> crate::error::Result<Vec<FileChunk>> {
        self.idb.with_state(|s| {
            Ok(s.nodes
                .get(&self.node_id)
                .ok_or_else(|| Error::NotFound {
                    what: format!("node {}", self.node_id),
                })?
                .as_file()?
                .chunks
                .clone())
        })
    }

    fn write(&mut self, chunks: Vec<FileChunk>) -> crate::error::Result<()> {
        self.idb
            .apply_transaction(vec![Op::UpdateChunks {
                id: self.node_id,
                chunks,
                ticket: self.ticket,
            }])
            .map(|_| ())
    }
}

pub struct FileSystem {
    idb: Arc<InodeDb>,
    bs: Arc<dyn crate::blob::BlobStore>,
    key: FrameKey,
    chunk_split_size: u64,
    open_files: DashMap<u64, Arc<OpenFile>>,
    /// Best-effort, informational original-path tracking, kept outside the
    /// transaction log: it is never consulted to decide correctness, only
    /// used to label chunk blobs for debugging.
    orig_paths: DashMap<u64, String>,
    next_handle: AtomicU64,
}

impl FileSystem {
    pub fn new(
        idb: Arc<InodeDb>,
        bs: Arc<dyn crate::blob::BlobStore>,
        key: FrameKey,
        chunk_split_size: u64,
    ) -> Self {
        FileSystem {
            idb,
            bs,
            key,
            chunk_split_size,
            open_files: DashMap::new(),
            orig_paths: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    fn chunked_io(&self, orig_path: &str) -> ChunkedFileIo {
        ChunkedFileIo::new(self.bs.clone(), self.key.clone(), self.chunk_split_size, orig_path)
    }

    fn get_or_create_open_file(&self, node_id: u64) -> Arc<OpenFile> {
        self.open_files
            .entry(node_id)
            .or_insert_with(|| {
                Arc::new(OpenFile {
                    node_id,
                    lock_ticket: Mutex::new(None),
                    patch: Mutex::new(crate::patch::PatchCache::new()),
                    handles: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Open `node_id`, returning an opaque handle id. Write-capable opens
    /// acquire the node's exclusive lock the first time any handle on it
    /// needs write access.
    #[instrument(level = "debug", skip(self))]
    pub fn open(&self, node_id: u64, mode: OpenMode) -> Result<u64> {
        self.idb
            .with_state(|s| s.nodes.get(&node_id).map(|_| ()))
            .ok_or(PosixError::ENoEnt)?;

        let open_file = self.get_or_create_open_file(node_id);

        if mode.allows_write() {
            let mut ticket = open_file.lock_ticket.lock().unwrap();
            if ticket.is_none() {
                let t = self
                    .idb
                    .lock_node(node_id)
                    .map_err(|e| PosixError::from(&e))?;
                *ticket = Some(t);
            }
        }

        let handle_id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        open_file.handles.lock().unwrap().push(HandleEntry {
            id: handle_id,
            write_allowed: mode.allows_write(),
        });
        debug!(node_id, handle_id, "opened file handle");
        Ok(handle_id)
    }

    fn require_handle(&self, node_id: u64, handle_id: u64) -> Result<(Arc<OpenFile>, bool)> {
        let open_file = self.open_files.get(&node_id).ok_or(PosixError::EBadF)?.clone();
        let write_allowed = open_file
            .handles
            .lock()
            .unwrap()
            .iter()
            .find(|h| h.id == handle_id)
            .map(|h| h.write_allowed)
            .ok_or(PosixError::EBadF)?;
        Ok((open_file, write_allowed))
    }

    /// Close a handle. If it was the last write-capable handle on the
    /// node, the exclusive lock is released; if it was the last handle of
    /// any kind, pending writes are flushed and the open-file entry is
    /// dropped.
    #[instrument(level = "debug", skip(self))]
    pub fn close_handle(&self, node_id: u64, handle_id: u64) -> Result<()> {
        let open_file = self.open_files.get(&node_id).ok_or(PosixError::EBadF)?.clone();
        let last_write_handle_closing;
        {
            let mut handles = open_file.handles.lock().unwrap();
            let pos = handles
                .iter()
                .position(|h| h.id == handle_id)
                .ok_or(PosixError::EBadF)?;
            handles.remove(pos);
            last_write_handle_closing = !handles.iter().any(|h| h.write_allowed);
        }

        // Pending patches must be flushed under the still-held ticket:
        // releasing the lock first would leave nothing to validate the
        // UpdateSize/UpdateChunks ops a late flush produces.
        if last_write_handle_closing {
            self.flush_patches(node_id, &open_file)?;
            let mut ticket = open_file.lock_ticket.lock().unwrap();
            if let Some(t) = ticket.take() {
                let _ = self.idb.unlock_node(node_id, t);
            }
        }

        if open_file.handles.lock().unwrap().is_empty() {
            self.sync(node_id)?;
            self.open_files.remove(&node_id);
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self, buf))]
    pub fn pread(&self, node_id: u64, handle_id: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let (open_file, _) = self.require_handle(node_id, handle_id)?;
        let orig_path = self.orig_path(node_id)?;
        let cfio = self.chunked_io(&orig_path);
        let chunks_io = InodeChunksArrayIO {
            idb: &self.idb,
            node_id,
            ticket: open_file.lock_ticket.lock().unwrap().unwrap_or(0),
        };
        let patch = open_file.patch.lock().unwrap();
        patch
            .read_through(offset, buf, |o, b| cfio.pread(&chunks_io, o, b))
            .map_err(|e| PosixError::from(&e))
    }

    #[instrument(level = "debug", skip(self, data))]
    pub fn pwrite(&self, node_id: u64, handle_id: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let (open_file, write_allowed) = self.require_handle(node_id, handle_id)?;
        if !write_allowed {
            return Err(PosixError::EAcces);
        }

        {
            let mut patch = open_file.patch.lock().unwrap();
            patch.write(offset, data);
            let needs_sync = patch.needs_sync();
            drop(patch);
            if needs_sync {
                self.flush_patches(node_id, &open_file)?;
            }
        }

        let ticket = open_file.lock_ticket.lock().unwrap().unwrap_or(0);
        let new_end = offset + data.len() as u64;
        let current_size = self
            .idb
            .with_state(|s| s.nodes.get(&node_id).and_then(|n| n.as_file().ok().map(|f| f.size)))
            .unwrap_or(0);
        if new_end > current_size {
            self.idb
                .apply_transaction(vec![Op::UpdateSize {
                    id: node_id,
                    size: new_end,
                    ticket,
                }])
                .map_err(|e| PosixError::from(&e))?;
        }

        Ok(data.len())
    }

    fn flush_patches(&self, node_id: u64, open_file: &OpenFile) -> Result<()> {
        let orig_path = self.orig_path(node_id)?;
        let cfio = self.chunked_io(&orig_path);
        let ticket = open_file.lock_ticket.lock().unwrap().unwrap_or(0);
        let mut chunks_io = InodeChunksArrayIO {
            idb: &self.idb,
            node_id,
            ticket,
        };
        let mut patch = open_file.patch.lock().unwrap();
        patch
            .flush(|offset, data| cfio.pwrite(&mut chunks_io, offset, data).map(|_| ()))
            .map_err(|e| PosixError::from(&e))
    }

    /// Flush pending writes for `node_id` to the chunk store and push
    /// cached blobs to the backend.
    #[instrument(level = "debug", skip(self))]
    pub fn sync(&self, node_id: u64) -> Result<()> {
        if let Some(open_file) = self.open_files.get(&node_id) {
            self.flush_patches(node_id, &open_file)?;
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub fn truncate(&self, node_id: u64, handle_id: u64, new_size: u64) -> Result<()> {
        let (open_file, write_allowed) = self.require_handle(node_id, handle_id)?;
        if !write_allowed {
            return Err(PosixError::EAcces);
        }

        let current_size = self
            .idb
            .with_state(|s| s.nodes.get(&node_id).and_then(|n| n.as_file().ok().map(|f| f.size)))
            .unwrap_or(0);

        let ticket = open_file.lock_ticket.lock().unwrap().unwrap_or(0);
        if new_size < current_size {
            open_file.patch.lock().unwrap().truncate(new_size);
            let orig_path = self.orig_path(node_id)?;
            let cfio = self.chunked_io(&orig_path);
            let mut chunks_io = InodeChunksArrayIO {
                idb: &self.idb,
                node_id,
                ticket,
            };
            cfio.truncate(&mut chunks_io, new_size)
                .map_err(|e| PosixError::from(&e))?;
        }

        self.idb
            .apply_transaction(vec![Op::UpdateSize {
                id: node_id,
                size: new_size,
                ticket,
            }])
            .map_err(|e| PosixError::from(&e))?;
        Ok(())
    }

    fn orig_path(&self, node_id: u64) -> Result<String> {
        Ok(self
            .orig_paths
            .get(&node_id)
            .map(|p| p.clone())
            .unwrap_or_else(|| format!("node-{node_id}")))
    }

    /// Create a new, empty file node and link it into `parent` as `name`.
    /// `orig_path` is recorded best-effort for chunk-blob labelling only.
    #[instrument(level = "debug", skip(self))]
    pub fn create_file(&self, parent: u64, name: &str, orig_path: Option<&str>) -> Result<u64> {
        self.require_dir(parent)?;
        let (new_id, _) = self
            .idb
            .apply_with_new_id(|id| {
                vec![
                    Op::CreateNode {
                        id,
                        kind: NodeKind::File,
                    },
                    Op::HardLink {
                        parent,
                        name: name.to_string(),
                        child: id,
                    },
                ]
            })
            .map_err(|e| PosixError::from(&e))?;
        if let Some(path) = orig_path {
            self.orig_paths.insert(new_id, path.to_string());
        }
        Ok(new_id)
    }

    /// Create a new, empty directory node and link it into `parent`.
    #[instrument(level = "debug", skip(self))]
    pub fn create_dir(&self, parent: u64, name: &str) -> Result<u64> {
        self.require_dir(parent)?;
        let (new_id, _) = self
            .idb
            .apply_with_new_id(|id| {
                vec![
                    Op::CreateNode {
                        id,
                        kind: NodeKind::Dir,
                    },
                    Op::HardLink {
                        parent,
                        name: name.to_string(),
                        child: id,
                    },
                ]
            })
            .map_err(|e| PosixError::from(&e))?;
        Ok(new_id)
    }

    pub fn rename(&self, src_dir: u64, src_name: &str, dst_dir: u64, dst_name: &str) -> Result<()> {
        self.idb
            .apply_transaction(vec![Op::Rename {
                src_dir,
                src_name: src_name.to_string(),
                dst_dir,
                dst_name: dst_name.to_string(),
            }])
            .map(|_| ())
            .map_err(|e| PosixError::from(&e))
    }

    pub fn remove(&self, parent: u64, name: &str) -> Result<()> {
        let child_id = self
            .idb
            .with_state(|s| {
                s.nodes
                    .get(&parent)
                    .and_then(|n| n.as_dir().ok())
                    .and_then(|d| d.entries.get(name).copied())
            })
            .ok_or(PosixError::ENoEnt)?;

        let is_nonempty_dir = self.idb.with_state(|s| {
            matches!(s.nodes.get(&child_id), Some(Node::Dir(d)) if !d.entries.is_empty())
        });
        if is_nonempty_dir {
            return Err(PosixError::ENotEmpty);
        }

        self.idb
            .apply_transaction(vec![Op::Remove {
                parent,
                name: name.to_string(),
            }])
            .map(|_| ())
            .map_err(|e| PosixError::from(&e))
    }

    fn require_dir(&self, node_id: u64) -> Result<()> {
        self.idb
            .with_state(|s| {
                s.nodes
                    .get(&node_id)
                    .ok_or(PosixError::ENoEnt)
                    .and_then(|n| matches!(n, Node::Dir(_)).then_some(()).ok_or(PosixError::ENotDir))
            })
    }

    pub fn root_id(&self) -> u64 {
        ROOT_ID
    }
}
