//! Server connection trait.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use imgstash_protocol::messages::{
    ChunkAck, ChunkHeader, CreateSessionRequest, CreateSessionResponse, UploadRequest,
};
use imgstash_protocol::types::PublishedLinks;

use crate::error::UploadError;

/// Abstract connection to an upload server.
///
/// The app implements this on top of its transport. Keeping it a trait
/// keeps the upload logic transport-free and testable with mocks.
pub trait ChunkSink: Send + Sync {
    /// Opens a chunked upload session.
    fn create_session(
        &self,
        req: CreateSessionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CreateSessionResponse, UploadError>> + Send + '_>>;

    /// Sends one chunk.
    fn send_chunk(
        &self,
        header: ChunkHeader,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkAck, UploadError>> + Send + '_>>;

    /// Asks the server to assemble and publish.
    fn complete(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<PublishedLinks, UploadError>> + Send + '_>>;

    /// Abandons a session.
    fn cancel(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), UploadError>> + Send + '_>>;

    /// Uploads a small object in a single request.
    fn upload_whole(
        &self,
        req: UploadRequest,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<PublishedLinks, UploadError>> + Send + '_>>;
}
