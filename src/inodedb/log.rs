//! Transaction log collaborator interface and its wire encoding.
//!
//! A log record is `tx_id || enc_ops`, where `enc_ops` is the transaction's
//! operations JSON-encoded and then sealed with the frame codec — the same
//! encode-then-encrypt layering the batched Google Cloud Datastore-backed
//! log used, just over whatever storage the embedder provides. Batched
//! appends and periodic sync are the embedder's concern; this module only
//! defines the record shape and the boundary trait.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::FrameKey;

use super::{NodeKind, Op, Transaction};

/// Collaborator responsible for durably appending and later replaying
/// transactions. Implementations decide their own storage and batching
/// strategy; `append_transaction` must not return before the transaction
/// is durable, since `InodeDb::apply_transaction` treats a successful
/// return as "safe to apply in memory".
pub trait LogIO: Send + Sync {
    fn append_transaction(&self, tx: &Transaction) -> Result<()>;

    /// Return every transaction with `tx_id >= min_id`, in ascending order.
    fn query_transactions(&self, min_id: u64) -> Result<Vec<Transaction>>;

    /// Drop transactions older than `smaller_than`, typically called after
    /// a snapshot makes them redundant. Optional: the default is a no-op.
    fn delete_transactions(&self, _smaller_than: u64) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct WireOp {
    #[serde(flatten)]
    inner: WireOpInner,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "op")]
enum WireOpInner {
    CreateNode { id: u64, kind: String },
    HardLink { parent: u64, name: String, child: u64 },
    UpdateSize { id: u64, size: u64, ticket: u64 },
    UpdateChunks { id: u64, chunks: Vec<WireChunk>, ticket: u64 },
    Rename {
        src_dir: u64,
        src_name: String,
        dst_dir: u64,
        dst_name: String,
    },
    Remove { parent: u64, name: String },
}

#[derive(Serialize, Deserialize)]
struct WireChunk {
    offset: u64,
    length: u64,
    blob_path: String,
}

fn to_wire(op: &Op) -> WireOpInner {
    match op {
        Op::CreateNode { id, kind } => WireOpInner::CreateNode {
            id: *id,
            kind: match kind {
                NodeKind::Dir => "dir".to_string(),
                NodeKind::File => "file".to_string(),
            },
        },
        Op::HardLink { parent, name, child } => WireOpInner::HardLink {
            parent: *parent,
            name: name.clone(),
            child: *child,
        },
        Op::UpdateSize { id, size, ticket } => WireOpInner::UpdateSize {
            id: *id,
            size: *size,
            ticket: *ticket,
        },
        Op::UpdateChunks { id, chunks, ticket } => WireOpInner::UpdateChunks {
            id: *id,
            chunks: chunks
                .iter()
                .map(|c| WireChunk {
                    offset: c.offset,
                    length: c.length,
                    blob_path: c.blob_path.clone(),
                })
                .collect(),
            ticket: *ticket,
        },
        Op::Rename {
            src_dir,
            src_name,
            dst_dir,
            dst_name,
        } => WireOpInner::Rename {
            src_dir: *src_dir,
            src_name: src_name.clone(),
            dst_dir: *dst_dir,
            dst_name: dst_name.clone(),
        },
        Op::Remove { parent, name } => WireOpInner::Remove {
            parent: *parent,
            name: name.clone(),
        },
    }
}

fn from_wire(op: WireOpInner) -> Result<Op> {
    Ok(match op {
        WireOpInner::CreateNode { id, kind } => Op::CreateNode {
            id,
            kind: match kind.as_str() {
                "dir" => NodeKind::Dir,
                "file" => NodeKind::File,
                other => {
                    return Err(Error::CacheCorrupt {
                        path: String::new(),
                        reason: format!("unknown node kind {other} in log record"),
                    })
                }
            },
        },
        WireOpInner::HardLink { parent, name, child } => Op::HardLink { parent, name, child },
        WireOpInner::UpdateSize { id, size, ticket } => Op::UpdateSize { id, size, ticket },
        WireOpInner::UpdateChunks { id, chunks, ticket } => Op::UpdateChunks {
            id,
            chunks: chunks
                .into_iter()
                .map(|c| crate::chunk::FileChunk {
                    offset: c.offset,
                    length: c.length,
                    blob_path: c.blob_path,
                })
                .collect(),
            ticket,
        },
        WireOpInner::Rename {
            src_dir,
            src_name,
            dst_dir,
            dst_name,
        } => Op::Rename {
            src_dir,
            src_name,
            dst_dir,
            dst_name,
        },
        WireOpInner::Remove { parent, name } => Op::Remove { parent, name },
    })
}

/// Encode a transaction as `tx_id(8 LE) || frame(json(ops))`.
pub fn encode_transaction(key: &FrameKey, tx: &Transaction) -> Result<Vec<u8>> {
    let wire: Vec<WireOpInner> = tx.ops.iter().map(to_wire).collect();
    let json = serde_json::to_vec(&wire).map_err(|e| Error::Internal(e.to_string()))?;
    let envelope = crate::frame::encrypt(key, &json)?;

    let mut out = Vec::with_capacity(8 + 8 + envelope.len());
    out.extend_from_slice(&tx.tx_id.to_le_bytes());
    out.extend_from_slice(&(json.len() as u64).to_le_bytes());
    out.extend_from_slice(&envelope);
    Ok(out)
}

/// Decode a record produced by [`encode_transaction`].
pub fn decode_transaction(key: &FrameKey, record: &[u8]) -> Result<Transaction> {
    if record.len() < 16 {
        return Err(Error::Truncated {
            expected: 16,
            actual: record.len(),
        });
    }
    let tx_id = u64::from_le_bytes(record[0..8].try_into().unwrap());
    let json_len = u64::from_le_bytes(record[8..16].try_into().unwrap());
    let envelope = &record[16..];
    let json = crate::frame::decrypt(key, envelope, json_len)?;
    let wire: Vec<WireOpInner> =
        serde_json::from_slice(&json).map_err(|e| Error::Internal(e.to_string()))?;
    let ops = wire.into_iter().map(from_wire).collect::<Result<Vec<_>>>()?;
    Ok(Transaction { tx_id, ops })
}

/// In-memory `LogIO`, shared across clones via an `Arc<Mutex<_>>` — handy
/// for tests that boot a database twice against the same log.
#[derive(Clone)]
pub struct InMemoryLogIO {
    transactions: Arc<Mutex<Vec<Transaction>>>,
}

impl InMemoryLogIO {
    #[must_use]
    pub fn new() -> Self {
        InMemoryLogIO {
            transactions: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Default for InMemoryLogIO {
    fn default() -> Self {
        Self::new()
    }
}

impl LogIO for InMemoryLogIO {
    fn append_transaction(&self, tx: &Transaction) -> Result<()> {
        self.transactions.lock().unwrap().push(tx.clone());
        Ok(())
    }

    fn query_transactions(&self, min_id: u64) -> Result<Vec<Transaction>> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.tx_id >= min_id)
            .cloned()
            .collect())
    }

    fn delete_transactions(&self, smaller_than: u64) -> Result<()> {
        self.transactions
            .lock()
            .unwrap()
            .retain(|t| t.tx_id >= smaller_than);
        Ok(())
    }
}
