//! File-backed [`BlobStore`] implementation: each blob is a regular file
//! under a root directory.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};

use super::{BlobHandle, BlobStore, OpenFlags};

pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(e, &root))?;
        Ok(FileBlobStore { root })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.contains("..") {
            return Err(Error::Internal(format!("unsafe blob path: {path}")));
        }
        Ok(self.root.join(path))
    }
}

impl BlobStore for FileBlobStore {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn BlobHandle>> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent))?;
        }

        let mut options = OpenOptions::new();
        options.read(true);
        match flags {
            OpenFlags::ReadOnly => {}
            OpenFlags::ReadWrite => {
                options.write(true);
            }
            OpenFlags::ReadWriteCreate => {
                options.write(true).create(true);
            }
            OpenFlags::ReadWriteCreateExclusive => {
                options.write(true).create_new(true);
            }
        }

        let file = options.open(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::AlreadyExists {
                    what: path.to_string(),
                }
            } else if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound {
                    what: path.to_string(),
                }
            } else {
                Error::io(e, &full)
            }
        })?;

        Ok(Box::new(FileBlobHandle { file, path: full }))
    }

    fn remove(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound {
                what: path.to_string(),
            }),
            Err(e) => Err(Error::io(e, &full)),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.root).into_iter() {
            let entry = entry.map_err(|e| Error::Internal(e.to_string()))?;
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    if let Some(rel_str) = rel.to_str() {
                        out.push(rel_str.replace(std::path::MAIN_SEPARATOR, "/"));
                    }
                }
            }
        }
        Ok(out)
    }
}

struct FileBlobHandle {
    file: std::fs::File,
    path: PathBuf,
}

impl FileBlobHandle {
    fn map_err(&self, e: std::io::Error) -> Error {
        Error::io(e, &self.path)
    }
}

impl BlobHandle for FileBlobHandle {
    fn pread(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.map_err(e))?;
        let mut total = 0;
        loop {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.map_err(e)),
            }
            if total == buf.len() {
                break;
            }
        }
        Ok(total)
    }

    fn pwrite(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.map_err(e))?;
        self.file.write_all(buf).map_err(|e| self.map_err(e))?;
        Ok(buf.len())
    }

    fn size(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| self.map_err(e))
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size).map_err(|e| self.map_err(e))
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();
        let mut handle = store.open("a/b", OpenFlags::ReadWriteCreate).unwrap();
        handle.pwrite(0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        handle.pread(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(handle.size().unwrap(), 5);
    }

    #[test]
    fn exclusive_create_fails_on_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();
        store
            .open("x", OpenFlags::ReadWriteCreateExclusive)
            .unwrap();
        let err = store
            .open("x", OpenFlags::ReadWriteCreateExclusive)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn truncate_shrinks_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();
        let mut handle = store.open("f", OpenFlags::ReadWriteCreate).unwrap();
        handle.pwrite(0, b"0123456789").unwrap();
        handle.truncate(4).unwrap();
        assert_eq!(handle.size().unwrap(), 4);
    }

    #[test]
    fn list_returns_all_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();
        store
            .open("one", OpenFlags::ReadWriteCreate)
            .unwrap()
            .close()
            .unwrap();
        store
            .open("nested/two", OpenFlags::ReadWriteCreate)
            .unwrap()
            .close()
            .unwrap();
        let mut list = store.list().unwrap();
        list.sort();
        assert_eq!(list, vec!["nested/two".to_string(), "one".to_string()]);
    }
}
