//! Client side of the imgstash upload protocol.
//!
//! [`Uploader`] drives one image at a time through a [`ChunkSink`]:
//! small objects go up in a single request, larger ones through a session
//! whose chunks are sent by a bounded [`ChunkTransport`] worker pool with
//! per-chunk retry.

pub mod error;
pub mod sink;
pub mod transport;
pub mod types;
pub mod uploader;

#[cfg(test)]
mod testing;

pub use error::UploadError;
pub use sink::ChunkSink;
pub use transport::{ChunkTransport, TransportConfig, TransportReport};
pub use types::{UploadEvent, UploadOutcome};
pub use uploader::{Uploader, UploaderConfig};
