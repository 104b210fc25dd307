//! Chunk blob header: a small plaintext preamble identifying and
//! versioning the encrypted payload that follows it.

use crate::error::{Error, Result};

const MAGIC: [u8; 4] = *b"OC\0\0";
const FORMAT_VERSION: u16 = 1;
const MAX_ORIG_PATH_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub payload_len: u32,
    pub orig_path: String,
    pub chunk_version: u32,
}

impl ChunkHeader {
    #[must_use]
    pub fn new(payload_len: u32, orig_path: impl Into<String>, chunk_version: u32) -> Self {
        ChunkHeader {
            payload_len,
            orig_path: orig_path.into(),
            chunk_version,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let orig_path_bytes = self.orig_path.as_bytes();
        if orig_path_bytes.len() > MAX_ORIG_PATH_LEN {
            return Err(Error::Internal(format!(
                "orig_path too long: {} bytes, max {}",
                orig_path_bytes.len(),
                MAX_ORIG_PATH_LEN
            )));
        }

        let mut out = Vec::with_capacity(4 + 2 + 4 + 2 + orig_path_bytes.len() + 4);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&self.payload_len.to_le_bytes());
        out.extend_from_slice(&(orig_path_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(orig_path_bytes);
        out.extend_from_slice(&self.chunk_version.to_le_bytes());
        Ok(out)
    }

    /// Decode a header from the front of `buf`, returning it along with the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 4 + 2 + 4 + 2 {
            return Err(Error::Truncated {
                expected: 12,
                actual: buf.len(),
            });
        }
        if buf[0..4] != MAGIC {
            return Err(Error::CacheCorrupt {
                path: String::new(),
                reason: "bad chunk magic".into(),
            });
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != FORMAT_VERSION {
            return Err(Error::CacheCorrupt {
                path: String::new(),
                reason: format!("unsupported chunk header version {version}"),
            });
        }
        let payload_len = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let orig_path_len = u16::from_le_bytes([buf[10], buf[11]]) as usize;
        if orig_path_len > MAX_ORIG_PATH_LEN {
            return Err(Error::CacheCorrupt {
                path: String::new(),
                reason: format!("orig_path_len {orig_path_len} exceeds maximum"),
            });
        }
        let path_start = 12;
        let path_end = path_start + orig_path_len;
        if buf.len() < path_end + 4 {
            return Err(Error::Truncated {
                expected: path_end + 4,
                actual: buf.len(),
            });
        }
        let orig_path = String::from_utf8(buf[path_start..path_end].to_vec())
            .map_err(|_| Error::CacheCorrupt {
                path: String::new(),
                reason: "orig_path is not valid utf8".into(),
            })?;
        let chunk_version = u32::from_le_bytes([
            buf[path_end],
            buf[path_end + 1],
            buf[path_end + 2],
            buf[path_end + 3],
        ]);

        Ok((
            ChunkHeader {
                payload_len,
                orig_path,
                chunk_version,
            },
            path_end + 4,
        ))
    }
}
