//! Authenticated frame codec.
//!
//! Plaintext is split into frames of at most [`MAX_FRAME_PAYLOAD`] bytes.
//! Each frame is sealed independently with AES-256-GCM as
//! `nonce(12) || ciphertext || tag(16)`; there is no additional authenticated
//! data and no chaining between frames, so frames can be decrypted
//! out of order given their byte offset and the total plaintext length.
//!
//! [`FrameWriter`] and [`FrameReader`] buffer up to one frame's worth of
//! plaintext and know the total length up front, matching the semantics of
//! a single encrypted blob envelope: the writer refuses to close unless
//! every declared byte has been written, and the reader refuses to read past
//! the declared length.

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use tracing::trace;

use crate::error::{Error, Result};

/// Maximum plaintext payload carried by a single frame.
pub const MAX_FRAME_PAYLOAD: usize = 256 * 1024;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A 256-bit AES-GCM key, distinct from the higher-level [`crate::keys::VaultKey`]
/// wrapper: this type is the raw key material the codec actually seals with.
#[derive(Clone)]
pub struct FrameKey(Key<Aes256Gcm>);

impl FrameKey {
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        FrameKey(*Key::<Aes256Gcm>::from_slice(&bytes))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.0)
    }
}

/// Seal one frame of plaintext. `plaintext.len()` must not exceed
/// [`MAX_FRAME_PAYLOAD`].
pub fn seal_frame(key: &FrameKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    debug_assert!(plaintext.len() <= MAX_FRAME_PAYLOAD);
    let cipher = key.cipher();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .map_err(|_| Error::Internal("frame encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open one frame, returning its plaintext. `frame` must be the full
/// `nonce || ciphertext || tag` span.
pub fn open_frame(key: &FrameKey, frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::Truncated {
            expected: NONCE_LEN + TAG_LEN,
            actual: frame.len(),
        });
    }
    let (nonce_bytes, ciphertext) = frame.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    key.cipher()
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| Error::AuthFailed {
            what: "frame".into(),
        })
}

/// Size a sealed frame will occupy on the wire for a given plaintext size.
#[must_use]
pub fn sealed_len(plaintext_len: usize) -> usize {
    NONCE_LEN + plaintext_len + TAG_LEN
}

/// Streaming encryptor. Buffers plaintext until a full frame is available
/// (or the caller closes early), then seals and emits it.
///
/// Mirrors the original `BtnEncryptWriteCloser`: the total plaintext length
/// is known up front, and `close` errors unless exactly that many bytes were
/// written.
pub struct FrameWriter<W: std::io::Write> {
    key: FrameKey,
    sink: W,
    buf: Vec<u8>,
    len_total: u64,
    len_written: u64,
}

impl<W: std::io::Write> FrameWriter<W> {
    pub fn new(key: FrameKey, sink: W, len_total: u64) -> Self {
        FrameWriter {
            key,
            sink,
            buf: Vec::with_capacity(MAX_FRAME_PAYLOAD),
            len_total,
            len_written: 0,
        }
    }

    fn capacity_left(&self) -> usize {
        MAX_FRAME_PAYLOAD - self.buf.len()
    }

    fn flush_frame(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let frame = seal_frame(&self.key, &self.buf)?;
        self.sink
            .write_all(&frame)
            .map_err(|e| Error::io(e, "<frame sink>"))?;
        trace!(frame_len = frame.len(), "wrote frame");
        self.buf.clear();
        Ok(())
    }

    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let take = data.len().min(self.capacity_left());
            self.buf.extend_from_slice(&data[..take]);
            self.len_written += take as u64;
            data = &data[take..];
            if self.capacity_left() == 0 {
                self.flush_frame()?;
            }
        }
        Ok(())
    }

    /// Finish the stream. Requires that exactly `len_total` bytes were
    /// written; flushes the final, possibly partial, frame.
    pub fn close(mut self) -> Result<W> {
        if self.len_written != self.len_total {
            return Err(Error::LengthMismatch {
                declared: self.len_total,
                written: self.len_written,
            });
        }
        self.flush_frame()?;
        Ok(self.sink)
    }
}

/// Streaming decryptor over a source that knows the declared total
/// plaintext length. Mirrors `BtnDecryptReader`.
pub struct FrameReader<R: std::io::Read> {
    key: FrameKey,
    source: R,
    len_total: u64,
    len_read: u64,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<R: std::io::Read> FrameReader<R> {
    pub fn new(key: FrameKey, source: R, len_total: u64) -> Self {
        FrameReader {
            key,
            source,
            len_total,
            len_read: 0,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    fn decrypt_next_frame(&mut self) -> Result<()> {
        let remaining = self.len_total - self.len_read;
        let frame_plain_len = remaining.min(MAX_FRAME_PAYLOAD as u64) as usize;
        let encrypted_len = sealed_len(frame_plain_len);

        let mut encrypted = vec![0u8; encrypted_len];
        self.source
            .read_exact(&mut encrypted)
            .map_err(|e| Error::io(e, "<frame source>"))?;

        let plain = open_frame(&self.key, &encrypted)?;
        if plain.len() != frame_plain_len {
            return Err(Error::Truncated {
                expected: frame_plain_len,
                actual: plain.len(),
            });
        }
        self.pending = plain;
        self.pending_pos = 0;
        Ok(())
    }

    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.len_read >= self.len_total {
            return Ok(0);
        }
        if self.pending_pos >= self.pending.len() {
            self.decrypt_next_frame()?;
        }
        let avail = &self.pending[self.pending_pos..];
        let take = avail.len().min(out.len());
        out[..take].copy_from_slice(&avail[..take]);
        self.pending_pos += take;
        self.len_read += take as u64;
        Ok(take)
    }
}

/// Encrypt a complete in-memory plaintext in one call.
pub fn encrypt(key: &FrameKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut writer = FrameWriter::new(key.clone(), &mut out, plaintext.len() as u64);
    writer.write(plaintext)?;
    writer.close()?;
    Ok(out)
}

/// Decrypt a complete in-memory envelope in one call, given the declared
/// plaintext length.
pub fn decrypt(key: &FrameKey, envelope: &[u8], len_total: u64) -> Result<Vec<u8>> {
    let mut reader = FrameReader::new(key.clone(), envelope, len_total);
    let mut out = vec![0u8; len_total as usize];
    let mut pos = 0;
    while pos < out.len() {
        let n = reader.read(&mut out[pos..])?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    out.truncate(pos);
    Ok(out)
}
