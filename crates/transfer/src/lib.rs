//! Chunked transfer building blocks.
//!
//! - [`ChunkPlan`] splits an object of known size into index-ordered ranges.
//! - [`ChunkSource`] reads the bytes of one range from memory or disk.
//! - [`ChunkStore`] stages received chunks on the server until assembly.
//! - [`ProgressTracker`] derives throughput and ETA from acked bytes.

mod planner;
mod progress;
mod source;
mod staging;
mod validation;

pub use planner::{ChunkDescriptor, ChunkIter, ChunkPlan};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use source::{ChunkSource, FileSource, MemorySource};
pub use staging::{ChunkStore, DiskChunkStore, MemoryChunkStore};
pub use validation::{detect_image_type, validate_file_name, validate_staging_key};

pub use imgstash_protocol::constants::DEFAULT_CHUNK_SIZE;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("too many chunks: {0}")]
    TooManyChunks(u64),

    #[error("range {start}..{end} outside source of {len} bytes")]
    RangeOutOfBounds { start: u64, end: u64, len: u64 },

    #[error("invalid name: {0}")]
    InvalidName(String),
}
