//! Core engine for an encrypted, cloud-backed filesystem.
//!
//! This crate implements the storage internals only: an authenticated frame
//! codec, a blob store abstraction with a cached two-tier implementation,
//! chunked file I/O on top of the blob store, a write patch cache, and a
//! transactionally logged inode database. Credential sourcing, a concrete
//! remote object-store driver, the kernel filesystem binding, an HTTP
//! management surface, and CLI/config loading all live outside this crate.

pub mod blob;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod error;
pub mod fs;
pub mod frame;
pub mod inodedb;
pub mod keys;
pub mod patch;
pub mod scheduler;

pub use error::{Error, Result};
