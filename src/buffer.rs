//! Managed data carriers for message bodies and stream chunks.
//!
//! A [`ManagedBuffer`] abstracts over where bytes live: an in-memory
//! region ([`MemoryBuffer`], a refcounted `Bytes`) or a bounded slice of a
//! file ([`FileSegmentBuffer`]). Retain maps to cloning the underlying
//! `Bytes` handle; release maps to `Drop`, so whoever drops the last
//! handle frees the backing resource.
//!
//! Once a buffer is handed to the outbound pipeline, ownership transfers
//! with the message: the write path drops the materialized bytes after
//! they are on the wire, success or failure.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::Result;

/// A polymorphic carrier of bytes.
pub trait ManagedBuffer: fmt::Debug + Send + Sync {
    /// Exact byte length of the data.
    fn size(&self) -> u64;

    /// Materialize the data to memory.
    ///
    /// Zero-copy for in-memory buffers; file segments perform a bounded
    /// read of their region.
    fn to_bytes(&self) -> Result<Bytes>;
}

/// An in-memory buffer backed by a refcounted `Bytes`.
#[derive(Debug, Clone)]
pub struct MemoryBuffer {
    data: Bytes,
}

impl MemoryBuffer {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// Borrow the underlying bytes without copying.
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }
}

impl From<Bytes> for MemoryBuffer {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl ManagedBuffer for MemoryBuffer {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn to_bytes(&self) -> Result<Bytes> {
        Ok(self.data.clone())
    }
}

/// A buffer backed by a region of a file.
///
/// The file is opened per materialization, so the segment holds no file
/// descriptor between reads; dropping the buffer releases everything.
#[derive(Debug, Clone)]
pub struct FileSegmentBuffer {
    path: PathBuf,
    offset: u64,
    length: u64,
}

impl FileSegmentBuffer {
    pub fn new(path: impl AsRef<Path>, offset: u64, length: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            offset,
            length,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl ManagedBuffer for FileSegmentBuffer {
    fn size(&self) -> u64 {
        self.length
    }

    fn to_bytes(&self) -> Result<Bytes> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut data = vec![0u8; self.length as usize];
        file.read_exact(&mut data)?;
        Ok(Bytes::from(data))
    }
}
