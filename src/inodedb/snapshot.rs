//! Snapshot collaborator interface.
//!
//! A snapshot is a point-in-time copy of [`State`] tagged with the
//! transaction id it reflects. Boot loads the latest snapshot (if any) and
//! replays only the transactions logged after it, bounding replay time
//! regardless of how long the vault has been in use. Snapshotting cadence
//! is the embedder's decision (see `PeriodicRunner`), not this crate's.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::FrameKey;

use super::{DirNode, FileNode, Node, State};

pub trait SnapshotIO: Send + Sync {
    fn load_snapshot(&self) -> Result<Option<State>>;
    fn save_snapshot(&self, state: &State) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct WireState {
    nodes: Vec<WireNode>,
    next_id: u64,
    last_tx: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind")]
enum WireNode {
    Dir {
        id: u64,
        entries: HashMap<String, u64>,
    },
    File {
        id: u64,
        size: u64,
        chunks: Vec<WireChunk>,
    },
}

#[derive(Serialize, Deserialize)]
struct WireChunk {
    offset: u64,
    length: u64,
    blob_path: String,
}

fn to_wire_state(state: &State) -> WireState {
    let nodes = state
        .nodes
        .values()
        .map(|n| match n {
            Node::Dir(d) => WireNode::Dir {
                id: d.id,
                entries: d.entries.clone(),
            },
            Node::File(f) => WireNode::File {
                id: f.id,
                size: f.size,
                chunks: f
                    .chunks
                    .iter()
                    .map(|c| WireChunk {
                        offset: c.offset,
                        length: c.length,
                        blob_path: c.blob_path.clone(),
                    })
                    .collect(),
            },
        })
        .collect();
    WireState {
        nodes,
        next_id: state.next_id,
        last_tx: state.last_tx,
    }
}

fn from_wire_state(wire: WireState) -> State {
    let mut nodes = HashMap::new();
    for wn in wire.nodes {
        let node = match wn {
            WireNode::Dir { id, entries } => Node::Dir(DirNode { id, entries }),
            WireNode::File { id, size, chunks } => Node::File(FileNode {
                id,
                size,
                chunks: chunks
                    .into_iter()
                    .map(|c| crate::chunk::FileChunk {
                        offset: c.offset,
                        length: c.length,
                        blob_path: c.blob_path,
                    })
                    .collect(),
            }),
        };
        nodes.insert(node.id(), node);
    }
    State {
        nodes,
        next_id: wire.next_id,
        last_tx: wire.last_tx,
        active_locks: HashMap::new(),
    }
}

/// Encode a snapshot as `json_len(8 LE) || frame(json(State minus active
/// locks))` — the same length-prefixed-envelope shape as a transaction log
/// record, since decrypting a frame envelope requires knowing the plaintext
/// length up front.
pub fn encode_snapshot(key: &FrameKey, state: &State) -> Result<Vec<u8>> {
    let wire = to_wire_state(state);
    let json = serde_json::to_vec(&wire).map_err(|e| Error::Internal(e.to_string()))?;
    let envelope = crate::frame::encrypt(key, &json)?;

    let mut out = Vec::with_capacity(8 + envelope.len());
    out.extend_from_slice(&(json.len() as u64).to_le_bytes());
    out.extend_from_slice(&envelope);
    Ok(out)
}

/// Decode a snapshot produced by [`encode_snapshot`]. Active locks are not
/// part of the snapshot; the returned `State` always has an empty lock
/// table, matching the boot-time rule that locks do not persist across
/// restarts.
pub fn decode_snapshot(key: &FrameKey, record: &[u8]) -> Result<State> {
    if record.len() < 8 {
        return Err(Error::Truncated {
            expected: 8,
            actual: record.len(),
        });
    }
    let json_len = u64::from_le_bytes(record[0..8].try_into().unwrap());
    let envelope = &record[8..];
    let json = crate::frame::decrypt(key, envelope, json_len)?;
    let wire: WireState =
        serde_json::from_slice(&json).map_err(|e| Error::Internal(e.to_string()))?;
    Ok(from_wire_state(wire))
}

/// In-memory `SnapshotIO`, shared across clones — used for tests that need
/// to reopen a database against the same durable state.
#[derive(Clone)]
pub struct InMemorySnapshotIO {
    state: Arc<Mutex<Option<State>>>,
}

impl InMemorySnapshotIO {
    #[must_use]
    pub fn new() -> Self {
        InMemorySnapshotIO {
            state: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for InMemorySnapshotIO {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotIO for InMemorySnapshotIO {
    fn load_snapshot(&self) -> Result<Option<State>> {
        Ok(self.state.lock().unwrap().clone())
    }

    fn save_snapshot(&self, state: &State) -> Result<()> {
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inodedb::ROOT_ID;

    #[test]
    fn save_then_load_round_trips() {
        let io = InMemorySnapshotIO::new();
        assert!(io.load_snapshot().unwrap().is_none());

        let state = State::default();
        io.save_snapshot(&state).unwrap();

        let loaded = io.load_snapshot().unwrap().unwrap();
        assert!(loaded.nodes.contains_key(&ROOT_ID));
    }

    #[test]
    fn encode_decode_round_trip_drops_active_locks() {
        use crate::inodedb::NodeLock;

        let key = FrameKey::new([9u8; 32]);
        let mut state = State::default();
        state.nodes.insert(
            2,
            Node::File(FileNode {
                id: 2,
                size: 99,
                chunks: vec![crate::chunk::FileChunk {
                    offset: 0,
                    length: 99,
                    blob_path: "blob-a".into(),
                }],
            }),
        );
        state
            .nodes
            .get_mut(&ROOT_ID)
            .unwrap()
            .as_dir_mut()
            .unwrap()
            .entries
            .insert("f".into(), 2);
        state.next_id = 3;
        state.last_tx = 7;
        state.active_locks.insert(2, NodeLock { ticket: 42 });

        let record = encode_snapshot(&key, &state).unwrap();
        let decoded = decode_snapshot(&key, &record).unwrap();

        assert_eq!(decoded.next_id, 3);
        assert_eq!(decoded.last_tx, 7);
        assert!(decoded.active_locks.is_empty());
        assert_eq!(decoded.nodes[&2].as_file().unwrap().size, 99);
        assert_eq!(
            decoded.nodes[&ROOT_ID].as_dir().unwrap().entries["f"],
            2
        );
    }
}
