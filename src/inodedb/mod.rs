//! Inode database with transaction log.
//!
//! All filesystem metadata — directory entries, file sizes, chunk lists,
//! and node locks — lives in an in-memory [`State`] that is only ever
//! mutated by applying a [`Transaction`]. Boot replays the log on top of
//! the most recent snapshot; every subsequent mutation is logged before it
//! is applied, so a crash between the two never leaves the log and the
//! live state disagreeing about which transactions committed.

pub mod log;
pub mod snapshot;

pub use log::LogIO;
pub use snapshot::SnapshotIO;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, instrument};

use crate::chunk::FileChunk as ChunkRecord;
use crate::error::{Error, Result};

pub const ROOT_ID: u64 = 1;

#[derive(Debug, Clone, Default)]
pub struct DirNode {
    pub id: u64,
    pub entries: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default)]
pub struct FileNode {
    pub id: u64,
    pub size: u64,
    pub chunks: Vec<ChunkRecord>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Dir(DirNode),
    File(FileNode),
}

impl Node {
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Node::Dir(d) => d.id,
            Node::File(f) => f.id,
        }
    }

    pub fn as_dir(&self) -> Result<&DirNode> {
        match self {
            Node::Dir(d) => Ok(d),
            Node::File(_) => Err(Error::WrongType {
                what: format!("node {} is a file, expected a directory", self.id()),
            }),
        }
    }

    pub fn as_dir_mut(&mut self) -> Result<&mut DirNode> {
        match self {
            Node::Dir(d) => Ok(d),
            Node::File(_) => Err(Error::WrongType {
                what: format!("node {} is a file, expected a directory", self.id()),
            }),
        }
    }

    pub fn as_file(&self) -> Result<&FileNode> {
        match self {
            Node::File(f) => Ok(f),
            Node::Dir(_) => Err(Error::WrongType {
                what: format!("node {} is a directory, expected a file", self.id()),
            }),
        }
    }

    pub fn as_file_mut(&mut self) -> Result<&mut FileNode> {
        match self {
            Node::File(f) => Ok(f),
            Node::Dir(_) => Err(Error::WrongType {
                what: format!("node {} is a directory, expected a file", self.id()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File,
}

/// A node-level lock ticket. `0` means unlocked.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeLock {
    pub ticket: u64,
}

#[derive(Debug, Clone)]
pub enum Op {
    CreateNode { id: u64, kind: NodeKind },
    HardLink { parent: u64, name: String, child: u64 },
    /// `ticket` must match the node's currently held exclusive lock.
    UpdateSize { id: u64, size: u64, ticket: u64 },
    /// `ticket` must match the node's currently held exclusive lock.
    UpdateChunks { id: u64, chunks: Vec<ChunkRecord>, ticket: u64 },
    Rename {
        src_dir: u64,
        src_name: String,
        dst_dir: u64,
        dst_name: String,
    },
    Remove { parent: u64, name: String },
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub tx_id: u64,
    pub ops: Vec<Op>,
}

#[derive(Debug, Clone)]
pub struct State {
    pub nodes: HashMap<u64, Node>,
    pub next_id: u64,
    pub last_tx: u64,
    pub active_locks: HashMap<u64, NodeLock>,
}

impl Default for State {
    fn default() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID,
            Node::Dir(DirNode {
                id: ROOT_ID,
                entries: HashMap::new(),
            }),
        );
        State {
            nodes,
            next_id: ROOT_ID + 1,
            last_tx: 0,
            active_locks: HashMap::new(),
        }
    }
}

impl State {
    /// Check that `ticket` matches the live exclusive lock on `id`. Only
    /// meaningful against the live lock table; replay bypasses this (locks
    /// don't persist across restarts, per boot's validation rules).
    fn check_ticket(&self, id: u64, ticket: u64) -> Result<()> {
        let held = self.active_locks.get(&id).map(|l| l.ticket).unwrap_or(0);
        if held == 0 || held != ticket {
            return Err(Error::LockStale { node_id: id, ticket });
        }
        Ok(())
    }

    /// Apply one op to live state: validates the caller's lock ticket for
    /// ops that mutate an already-locked node.
    fn apply(&mut self, op: &Op) -> Result<()> {
        self.apply_inner(op, true)
    }

    /// Apply one op during log replay: lock tickets are not persisted
    /// across restarts, so ticket validation is skipped.
    fn apply_replayed(&mut self, op: &Op) -> Result<()> {
        self.apply_inner(op, false)
    }

    fn apply_inner(&mut self, op: &Op, enforce_locks: bool) -> Result<()> {
        match op {
            Op::CreateNode { id, kind } => {
                let node = match kind {
                    NodeKind::Dir => Node::Dir(DirNode {
                        id: *id,
                        entries: HashMap::new(),
                    }),
                    NodeKind::File => Node::File(FileNode {
                        id: *id,
                        ..Default::default()
                    }),
                };
                self.nodes.insert(*id, node);
                if *id >= self.next_id {
                    self.next_id = *id + 1;
                }
                Ok(())
            }
            Op::HardLink { parent, name, child } => {
                if !self.nodes.contains_key(child) {
                    return Err(Error::NotFound {
                        what: format!("node {child}"),
                    });
                }
                let dir = self
                    .nodes
                    .get_mut(parent)
                    .ok_or_else(|| Error::NotFound {
                        what: format!("node {parent}"),
                    })?
                    .as_dir_mut()?;
                if dir.entries.contains_key(name) {
                    return Err(Error::AlreadyExists {
                        what: format!("{name} in directory {parent}"),
                    });
                }
                dir.entries.insert(name.clone(), *child);
                Ok(())
            }
            Op::UpdateSize { id, size, ticket } => {
                if enforce_locks {
                    self.check_ticket(*id, *ticket)?;
                }
                self.nodes
                    .get_mut(id)
                    .ok_or_else(|| Error::NotFound {
                        what: format!("node {id}"),
                    })?
                    .as_file_mut()?
                    .size = *size;
                Ok(())
            }
            Op::UpdateChunks { id, chunks, ticket } => {
                if enforce_locks {
                    self.check_ticket(*id, *ticket)?;
                }
                self.nodes
                    .get_mut(id)
                    .ok_or_else(|| Error::NotFound {
                        what: format!("node {id}"),
                    })?
                    .as_file_mut()?
                    .chunks = chunks.clone();
                Ok(())
            }
            Op::Rename {
                src_dir,
                src_name,
                dst_dir,
                dst_name,
            } => {
                let dst_has_entry = self
                    .nodes
                    .get(dst_dir)
                    .ok_or_else(|| Error::NotFound {
                        what: format!("node {dst_dir}"),
                    })?
                    .as_dir()?
                    .entries
                    .contains_key(dst_name);
                if dst_has_entry {
                    return Err(Error::AlreadyExists {
                        what: format!("{dst_name} in directory {dst_dir}"),
                    });
                }

                let child = self
                    .nodes
                    .get_mut(src_dir)
                    .ok_or_else(|| Error::NotFound {
                        what: format!("node {src_dir}"),
                    })?
                    .as_dir_mut()?
                    .entries
                    .remove(src_name)
                    .ok_or_else(|| Error::NotFound {
                        what: format!("{src_name} in directory {src_dir}"),
                    })?;

                self.nodes
                    .get_mut(dst_dir)
                    .ok_or_else(|| Error::NotFound {
                        what: format!("node {dst_dir}"),
                    })?
                    .as_dir_mut()?
                    .entries
                    .insert(dst_name.clone(), child);
                Ok(())
            }
            Op::Remove { parent, name } => {
                let dir = self
                    .nodes
                    .get_mut(parent)
                    .ok_or_else(|| Error::NotFound {
                        what: format!("node {parent}"),
                    })?
                    .as_dir_mut()?;
                dir.entries.remove(name).ok_or_else(|| Error::NotFound {
                    what: format!("{name} in directory {parent}"),
                })?;
                Ok(())
            }
        }
    }
}

pub struct InodeDb {
    state: Mutex<State>,
    log_io: Box<dyn LogIO>,
    snapshot_io: Box<dyn SnapshotIO>,
    next_ticket: AtomicU64,
}

impl InodeDb {
    /// Boot the database: load the most recent snapshot (or start fresh
    /// with just a root directory), then replay every logged transaction
    /// newer than the snapshot.
    #[instrument(level = "debug", skip_all)]
    pub fn boot(log_io: Box<dyn LogIO>, snapshot_io: Box<dyn SnapshotIO>) -> Result<Self> {
        let mut state = snapshot_io.load_snapshot()?.unwrap_or_default();
        let pending = log_io.query_transactions(state.last_tx + 1)?;
        for tx in pending {
            debug!(tx_id = tx.tx_id, "replaying transaction");
            for op in &tx.ops {
                state.apply_replayed(op)?;
            }
            state.last_tx = tx.tx_id;
        }
        Ok(InodeDb {
            state: Mutex::new(state),
            log_io,
            snapshot_io,
            next_ticket: AtomicU64::new(1),
        })
    }

    /// Validate, log, and apply a batch of operations as one atomic
    /// transaction. If logging fails the in-memory state is left
    /// untouched.
    #[instrument(level = "debug", skip(self, ops))]
    pub fn apply_transaction(&self, ops: Vec<Op>) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut trial = state.clone();
        for op in &ops {
            trial.apply(op)?;
        }

        let tx_id = state.last_tx + 1;
        let tx = Transaction { tx_id, ops };
        self.log_io.append_transaction(&tx)?;

        trial.last_tx = tx_id;
        *state = trial;
        Ok(tx_id)
    }

    /// Like [`Self::apply_transaction`], but allocates a fresh node id
    /// under the same lock held for validation and logging, so concurrent
    /// creators can never be handed the same id. `build_ops` receives the
    /// allocated id and returns the operations to apply.
    #[instrument(level = "debug", skip(self, build_ops))]
    pub fn apply_with_new_id(&self, build_ops: impl FnOnce(u64) -> Vec<Op>) -> Result<(u64, u64)> {
        let mut state = self.state.lock().unwrap();
        let new_id = state.next_id;
        let mut trial = state.clone();
        let ops = build_ops(new_id);
        for op in &ops {
            trial.apply(op)?;
        }

        let tx_id = state.last_tx + 1;
        let tx = Transaction { tx_id, ops };
        self.log_io.append_transaction(&tx)?;

        trial.last_tx = tx_id;
        *state = trial;
        Ok((new_id, tx_id))
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let state = self.state.lock().unwrap();
        f(&state)
    }

    pub fn snapshot_now(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        self.snapshot_io.save_snapshot(&state)
    }

    /// Acquire an exclusive lock on `id`, returning a nonzero ticket.
    pub fn lock_node(&self, id: u64) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if !state.nodes.contains_key(&id) {
            return Err(Error::NotFound {
                what: format!("node {id}"),
            });
        }
        let existing = state.active_locks.get(&id).copied().unwrap_or_default();
        if existing.ticket != 0 {
            return Err(Error::LockBusy {
                node_id: id,
                holder: existing.ticket,
            });
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        state.active_locks.insert(id, NodeLock { ticket });
        Ok(ticket)
    }

    pub fn unlock_node(&self, id: u64, ticket: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.active_locks.get(&id) {
            Some(lock) if lock.ticket == ticket => {
                state.active_locks.remove(&id);
                Ok(())
            }
            Some(lock) => Err(Error::LockStale {
                node_id: id,
                ticket: lock.ticket,
            }),
            None => Err(Error::LockStale { node_id: id, ticket }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inodedb::log::InMemoryLogIO;
    use crate::inodedb::snapshot::InMemorySnapshotIO;

    fn fresh_db() -> InodeDb {
        InodeDb::boot(
            Box::new(InMemoryLogIO::new()),
            Box::new(InMemorySnapshotIO::new()),
        )
        .unwrap()
    }

    #[test]
    fn boot_creates_root_directory() {
        let db = fresh_db();
        db.with_state(|s| {
            assert!(s.nodes.contains_key(&ROOT_ID));
        });
    }

    #[test]
    fn create_and_link_file() {
        let db = fresh_db();
        let tx1 = db
            .apply_transaction(vec![Op::CreateNode {
                id: 2,
                kind: NodeKind::File,
            }])
            .unwrap();
        assert_eq!(tx1, 1);
        let tx2 = db
            .apply_transaction(vec![Op::HardLink {
                parent: ROOT_ID,
                name: "hello.txt".into(),
                child: 2,
            }])
            .unwrap();
        assert_eq!(tx2, 2);

        db.with_state(|s| {
            let root = s.nodes[&ROOT_ID].as_dir().unwrap();
            assert_eq!(root.entries["hello.txt"], 2);
        });
    }

    #[test]
    fn tx_ids_are_monotonic_and_dense() {
        let db = fresh_db();
        let mut ids = Vec::new();
        for i in 0..5 {
            let id = db
                .apply_transaction(vec![Op::CreateNode {
                    id: 100 + i,
                    kind: NodeKind::File,
                }])
                .unwrap();
            ids.push(id);
        }
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn invalid_op_leaves_state_unchanged() {
        let db = fresh_db();
        let before = db.with_state(|s| s.last_tx);
        let err = db
            .apply_transaction(vec![Op::HardLink {
                parent: ROOT_ID,
                name: "ghost".into(),
                child: 999,
            }])
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        let after = db.with_state(|s| s.last_tx);
        assert_eq!(before, after);
    }

    #[test]
    fn lock_then_duplicate_lock_is_busy() {
        let db = fresh_db();
        let ticket = db.lock_node(ROOT_ID).unwrap();
        let err = db.lock_node(ROOT_ID).unwrap_err();
        assert!(matches!(err, Error::LockBusy { .. }));
        db.unlock_node(ROOT_ID, ticket).unwrap();
        db.lock_node(ROOT_ID).unwrap();
    }

    #[test]
    fn stale_ticket_rejected() {
        let db = fresh_db();
        let ticket = db.lock_node(ROOT_ID).unwrap();
        let err = db.unlock_node(ROOT_ID, ticket + 1).unwrap_err();
        assert!(matches!(err, Error::LockStale { .. }));
    }

    #[test]
    fn update_size_without_matching_lock_is_rejected() {
        let db = fresh_db();
        db.apply_transaction(vec![Op::CreateNode {
            id: 2,
            kind: NodeKind::File,
        }])
        .unwrap();

        // No lock held at all.
        let err = db
            .apply_transaction(vec![Op::UpdateSize {
                id: 2,
                size: 10,
                ticket: 1,
            }])
            .unwrap_err();
        assert!(matches!(err, Error::LockStale { .. }));

        // Lock held by someone else's ticket.
        let real_ticket = db.lock_node(2).unwrap();
        let err = db
            .apply_transaction(vec![Op::UpdateSize {
                id: 2,
                size: 10,
                ticket: real_ticket + 1,
            }])
            .unwrap_err();
        assert!(matches!(err, Error::LockStale { .. }));

        // Matching ticket succeeds.
        db.apply_transaction(vec![Op::UpdateSize {
            id: 2,
            size: 10,
            ticket: real_ticket,
        }])
        .unwrap();
        db.with_state(|s| assert_eq!(s.nodes[&2].as_file().unwrap().size, 10));
    }

    #[test]
    fn rename_moves_entry_across_directories() {
        let db = fresh_db();
        let (dir_a, _) = db
            .apply_with_new_id(|id| {
                vec![
                    Op::CreateNode { id, kind: NodeKind::Dir },
                    Op::HardLink {
                        parent: ROOT_ID,
                        name: "a".into(),
                        child: id,
                    },
                ]
            })
            .unwrap();
        let (dir_b, _) = db
            .apply_with_new_id(|id| {
                vec![
                    Op::CreateNode { id, kind: NodeKind::Dir },
                    Op::HardLink {
                        parent: ROOT_ID,
                        name: "b".into(),
                        child: id,
                    },
                ]
            })
            .unwrap();
        let (file_id, _) = db
            .apply_with_new_id(|id| {
                vec![
                    Op::CreateNode { id, kind: NodeKind::File },
                    Op::HardLink {
                        parent: dir_a,
                        name: "f.txt".into(),
                        child: id,
                    },
                ]
            })
            .unwrap();

        db.apply_transaction(vec![Op::Rename {
            src_dir: dir_a,
            src_name: "f.txt".into(),
            dst_dir: dir_b,
            dst_name: "moved.txt".into(),
        }])
        .unwrap();

        db.with_state(|s| {
            assert!(!s.nodes[&dir_a].as_dir().unwrap().entries.contains_key("f.txt"));
            assert_eq!(s.nodes[&dir_b].as_dir().unwrap().entries["moved.txt"], file_id);
        });
    }

    #[test]
    fn replay_reproduces_live_state() {
        let log = InMemoryLogIO::new();
        let snapshot = InMemorySnapshotIO::new();
        let db = InodeDb::boot(Box::new(log.clone()), Box::new(snapshot.clone())).unwrap();

        db.apply_transaction(vec![Op::CreateNode {
            id: 2,
            kind: NodeKind::File,
        }])
        .unwrap();
        db.apply_transaction(vec![Op::HardLink {
            parent: ROOT_ID,
            name: "a".into(),
            child: 2,
        }])
        .unwrap();
        let ticket = db.lock_node(2).unwrap();
        db.apply_transaction(vec![Op::UpdateSize {
            id: 2,
            size: 42,
            ticket,
        }])
        .unwrap();
        db.unlock_node(2, ticket).unwrap();

        let replayed = InodeDb::boot(Box::new(log), Box::new(snapshot)).unwrap();

        db.with_state(|live| {
            replayed.with_state(|replayed_state| {
                assert_eq!(live.last_tx, replayed_state.last_tx);
                assert_eq!(
                    live.nodes[&ROOT_ID].as_dir().unwrap().entries,
                    replayed_state.nodes[&ROOT_ID].as_dir().unwrap().entries
                );
                assert_eq!(
                    live.nodes[&2].as_file().unwrap().size,
                    replayed_state.nodes[&2].as_file().unwrap().size
                );
            });
        });
    }
}
