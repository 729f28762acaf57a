use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::TransferError;
use crate::planner::ChunkDescriptor;

/// A seekable byte source of known size.
///
/// Reads are positional, so workers can fetch chunks concurrently and in
/// any order.
pub trait ChunkSource: Send + Sync {
    /// Total size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads exactly the bytes covered by `desc`.
    fn read_chunk(&self, desc: &ChunkDescriptor) -> Result<Bytes, TransferError>;
}

fn check_range(desc: &ChunkDescriptor, len: u64) -> Result<(), TransferError> {
    if desc.start > desc.end || desc.end > len {
        return Err(TransferError::RangeOutOfBounds {
            start: desc.start,
            end: desc.end,
            len,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// An in-memory object. Chunks are zero-copy slices of the buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// The full buffer.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }
}

impl ChunkSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_chunk(&self, desc: &ChunkDescriptor) -> Result<Bytes, TransferError> {
        check_range(desc, self.len())?;
        Ok(self.data.slice(desc.start as usize..desc.end as usize))
    }
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// A file on disk, opened per read.
///
/// Each read opens its own handle, seeks and reads exactly the range, so
/// no handle is shared between workers.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Stats `path` and captures its size.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let len = std::fs::metadata(path)?.len();
        Ok(Self {
            path: path.to_path_buf(),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_chunk(&self, desc: &ChunkDescriptor) -> Result<Bytes, TransferError> {
        check_range(desc, self.len)?;
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(desc.start))?;
        let mut buf = vec![0u8; desc.len() as usize];
        // A file truncated since `open` surfaces as UnexpectedEof.
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}
