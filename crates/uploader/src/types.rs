//! Events and results of an upload.

use std::time::Duration;

use imgstash_protocol::types::PublishedLinks;
use imgstash_transfer::ProgressSnapshot;

/// Progress event emitted during an upload.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Upload accepted for sending.
    Started {
        file_name: String,
        total_bytes: u64,
        /// Zero for the single-request path.
        total_chunks: u32,
    },
    /// The server acknowledged a chunk.
    ChunkAcked { index: u32, len: u64 },
    /// A chunk failed and will be sent again after `delay`.
    ChunkRetry {
        index: u32,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// Snapshot after each acknowledged chunk.
    Progress(ProgressSnapshot),
    /// Upload published.
    Completed {
        file_name: String,
        links: PublishedLinks,
    },
    /// Upload failed.
    Failed { file_name: String, error: String },
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub file_name: String,
    pub links: PublishedLinks,
    pub bytes: u64,
    /// `None` when the object went through the single-request path.
    pub session_id: Option<String>,
    pub chunks: u32,
    pub elapsed: Duration,
}
