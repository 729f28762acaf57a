//! Upload service: the request-level coordinator over the session store,
//! assembler, publisher and collaborators.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use imgstash_protocol::messages::{
    CancelResponse, ChunkAck, ChunkHeader, CreateSessionRequest, CreateSessionResponse,
    SessionStatusResponse, UploadRequest,
};
use imgstash_protocol::{ErrorBody, SessionStatus};
use imgstash_transfer::{ChunkPlan, ChunkStore, validate_file_name};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assembler::{AssembledObject, Assembler};
use crate::collaborators::{
    AccessPolicy, BuildReason, BuildTrigger, Caller, GuestPolicy, ImageRecord, MemoryMetadataStore,
    MetadataStore, NoopBuildTrigger,
};
use crate::content::VersionToken;
use crate::error::SessionError;
use crate::publisher::{ContentPublisher, PublishedImage};
use crate::state::SessionMeta;
use crate::store::{SessionConfig, SessionStore};

/// One image to delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEntry {
    pub path: String,
    pub version: VersionToken,
}

/// Per-entry outcome of a batch delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<DeleteFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFailure {
    pub path: String,
    pub error: ErrorBody,
}

/// Server-side entry point for the chunked upload protocol.
///
/// Store operations touch the staging backend, which may be disk-backed,
/// so they run on the blocking pool. Publishing and metadata writes run
/// with no session lock held.
pub struct UploadService {
    store: Arc<SessionStore>,
    publisher: ContentPublisher,
    metadata: Arc<dyn MetadataStore>,
    build: Arc<dyn BuildTrigger>,
    policy: Arc<dyn AccessPolicy>,
}

impl UploadService {
    /// Creates a service with in-memory metadata, no build trigger and a
    /// policy that admits guests.
    pub fn new(
        config: SessionConfig,
        chunks: Arc<dyn ChunkStore>,
        publisher: ContentPublisher,
    ) -> Self {
        Self {
            store: Arc::new(SessionStore::new(config, chunks)),
            publisher,
            metadata: Arc::new(MemoryMetadataStore::new()),
            build: Arc::new(NoopBuildTrigger),
            policy: Arc::new(GuestPolicy { allow_guests: true }),
        }
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_build_trigger(mut self, build: Arc<dyn BuildTrigger>) -> Self {
        self.build = build;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        self.store.config()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(&SessionStore) -> Result<T, SessionError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| SessionError::Internal(format!("store task failed: {e}")))?
    }

    fn authorize(&self, caller: &Caller) -> Result<(), SessionError> {
        if self.policy.may_create_session(caller) {
            Ok(())
        } else {
            warn!(caller = %caller, "upload denied by access policy");
            Err(SessionError::PermissionDenied(format!(
                "{caller} may not upload"
            )))
        }
    }

    /// Validates the fields shared by chunked and whole uploads.
    fn validate_object(
        &self,
        file_name: &str,
        file_size: u64,
        mime_type: &str,
    ) -> Result<String, SessionError> {
        validate_file_name(file_name).map_err(|e| SessionError::Validation(e.to_string()))?;

        let mime = mime_type.trim().to_ascii_lowercase();
        if !mime.starts_with("image/") || mime.len() == "image/".len() {
            return Err(SessionError::Validation(format!(
                "unsupported mime type: {mime_type}"
            )));
        }

        let max = self.config().max_file_size;
        if file_size == 0 {
            return Err(SessionError::Validation("fileSize must be positive".into()));
        }
        if file_size > max {
            return Err(SessionError::Validation(format!(
                "fileSize {file_size} exceeds limit of {max} bytes"
            )));
        }
        Ok(mime)
    }

    fn validate_create(&self, req: &CreateSessionRequest) -> Result<SessionMeta, SessionError> {
        let mime = self.validate_object(&req.file_name, req.file_size, &req.mime_type)?;

        let max_chunks = self.config().max_chunks;
        if req.total_chunks == 0 || req.total_chunks > max_chunks {
            return Err(SessionError::Validation(format!(
                "totalChunks must be between 1 and {max_chunks}"
            )));
        }
        if u64::from(req.total_chunks) > req.file_size {
            return Err(SessionError::Validation(format!(
                "totalChunks {} exceeds fileSize {}",
                req.total_chunks, req.file_size
            )));
        }
        if let Some(chunk_size) = req.chunk_size {
            let plan = ChunkPlan::new(req.file_size, chunk_size)
                .map_err(|e| SessionError::Validation(e.to_string()))?;
            if plan.total_chunks() != req.total_chunks {
                return Err(SessionError::Validation(format!(
                    "totalChunks {} does not match chunkSize {chunk_size} (expected {})",
                    req.total_chunks,
                    plan.total_chunks()
                )));
            }
        }

        Ok(SessionMeta {
            file_name: req.file_name.clone(),
            declared_size: req.file_size,
            mime_type: mime,
            total_chunks: req.total_chunks,
            chunk_size: req.chunk_size,
        })
    }

    /// Opens a chunked upload session.
    pub async fn create_session(
        &self,
        caller: &Caller,
        req: CreateSessionRequest,
    ) -> Result<CreateSessionResponse, SessionError> {
        self.authorize(caller)?;
        let meta = self.validate_create(&req)?;
        let session_id = self.blocking(move |s| s.create(meta)).await?;
        Ok(CreateSessionResponse {
            session_id,
            ttl_seconds: self.config().ttl.as_secs(),
        })
    }

    /// Stages and records one chunk.
    pub async fn upload_chunk(
        &self,
        header: ChunkHeader,
        data: Bytes,
    ) -> Result<ChunkAck, SessionError> {
        let receipt = self.blocking(move |s| s.record_chunk(&header, data)).await?;
        Ok(ChunkAck {
            chunk_index: receipt.index,
            received: true,
            progress_percent: receipt.progress_percent,
        })
    }

    /// Validates completeness, assembles, publishes and records the image.
    ///
    /// Any failure after the session entered `Completing` moves it to
    /// `Failed`; the client has to start over. So does dropping the
    /// returned future before it resolves.
    pub async fn complete(&self, session_id: &str) -> Result<PublishedImage, SessionError> {
        let id = session_id.to_string();
        let ticket = self.blocking(move |s| s.begin_completion(&id)).await?;
        let mut guard = CompletionGuard {
            store: Arc::clone(&self.store),
            id: session_id.to_string(),
            armed: true,
        };

        let assembled = {
            let ticket = ticket.clone();
            self.blocking(move |s| Assembler::new(s.chunk_store()).assemble(&ticket))
                .await
        };
        let outcome = match assembled {
            Ok(object) => self.publish_and_record(object).await,
            Err(e) => Err(e),
        };

        // The store call below runs to the end even if this future is dropped.
        guard.armed = false;
        let id = session_id.to_string();
        match outcome {
            Ok(image) => {
                if let Err(e) = self.blocking(move |s| s.finalize(&id)).await {
                    // Published already; the session was cancelled or expired meanwhile.
                    warn!(session = %session_id, error = %e, "could not finalize session");
                }
                self.spawn_build(BuildReason::Published {
                    path: image.path.clone(),
                });
                Ok(image)
            }
            Err(e) => {
                error!(session = %session_id, error = %e, "completion failed");
                let message = e.to_string();
                if let Err(fe) = self.blocking(move |s| s.fail(&id, &message)).await {
                    warn!(session = %session_id, error = %fe, "could not mark session failed");
                }
                Err(e)
            }
        }
    }

    /// Cancels a session and drops its staged chunks.
    pub async fn cancel(&self, session_id: &str) -> Result<CancelResponse, SessionError> {
        let id = session_id.to_string();
        self.blocking(move |s| s.cancel(&id)).await?;
        Ok(CancelResponse { success: true })
    }

    pub async fn status(&self, session_id: &str) -> Result<SessionStatusResponse, SessionError> {
        let id = session_id.to_string();
        self.blocking(move |s| s.status(&id)).await
    }

    /// Waits until the session reaches a terminal state.
    ///
    /// Returns `Ok(None)` when `cancel` fires first. A session that leaves
    /// the store without a terminal status reports `SessionNotFound`.
    pub async fn wait_for_outcome(
        &self,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<Option<SessionStatus>, SessionError> {
        let id = session_id.to_string();
        let mut rx = self.blocking(move |s| s.subscribe(&id)).await?;
        let sweep_every = self.config().ttl;

        loop {
            let current = *rx.borrow_and_update();
            if current.is_terminal() {
                return Ok(Some(current));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                changed = rx.changed() => {
                    if changed.is_err() {
                        let last = *rx.borrow();
                        return if last.is_terminal() {
                            Ok(Some(last))
                        } else {
                            Err(SessionError::SessionNotFound(session_id.to_string()))
                        };
                    }
                }
                // Expiry is lazy; a waiter counts as store access.
                _ = tokio::time::sleep(sweep_every) => {
                    self.blocking(|s| Ok(s.sweep())).await?;
                }
            }
        }
    }

    /// Single-request path for objects below the chunking threshold.
    pub async fn upload_whole(
        &self,
        caller: &Caller,
        req: UploadRequest,
        data: Bytes,
    ) -> Result<PublishedImage, SessionError> {
        self.authorize(caller)?;
        let mime_type = self.validate_object(&req.file_name, req.file_size, &req.mime_type)?;
        if data.len() as u64 != req.file_size {
            return Err(SessionError::Validation(format!(
                "body has {} bytes but fileSize is {}",
                data.len(),
                req.file_size
            )));
        }

        let image = self
            .publish_and_record(AssembledObject {
                file_name: req.file_name,
                mime_type,
                data,
            })
            .await?;
        self.spawn_build(BuildReason::Published {
            path: image.path.clone(),
        });
        Ok(image)
    }

    /// Deletes a batch of images, sending one build notification for the
    /// whole batch.
    pub async fn delete_images(&self, entries: Vec<DeleteEntry>) -> DeleteReport {
        let mut report = DeleteReport::default();
        let content = self.publisher.content_store();

        for entry in entries {
            match content.delete(&entry.path, &entry.version).await {
                Ok(()) => {
                    if let Err(e) = self.metadata.remove(&entry.path).await {
                        warn!(path = %entry.path, error = %e, "failed to remove image record");
                    }
                    info!(path = %entry.path, "image deleted");
                    report.deleted.push(entry.path);
                }
                Err(e) => {
                    let e = SessionError::from(e);
                    warn!(path = %entry.path, error = %e, "image delete failed");
                    report.failed.push(DeleteFailure {
                        path: entry.path,
                        error: e.to_body(),
                    });
                }
            }
        }

        if !report.deleted.is_empty() {
            self.spawn_build(BuildReason::Deleted {
                paths: report.deleted.clone(),
            });
        }
        report
    }

    /// Publishes, then records metadata. A metadata failure rolls the
    /// published object back.
    async fn publish_and_record(
        &self,
        object: AssembledObject,
    ) -> Result<PublishedImage, SessionError> {
        let file_name = object.file_name.clone();
        let image = self.publisher.publish(object).await?;

        let record = ImageRecord {
            file_name,
            path: image.path.clone(),
            size: image.size,
            mime_type: image.mime_type.clone(),
            version: image.version.clone(),
            uploaded_at: Utc::now(),
        };
        if let Err(e) = self.metadata.insert(record).await {
            let content = self.publisher.content_store();
            if let Err(de) = content.delete(&image.path, &image.version).await {
                warn!(path = %image.path, error = %de, "rollback of published image failed");
            }
            return Err(e.into());
        }
        Ok(image)
    }

    fn spawn_build(&self, reason: BuildReason) {
        let build = Arc::clone(&self.build);
        tokio::spawn(async move {
            if let Err(e) = build.notify(reason).await {
                warn!(error = %e, "build trigger failed");
            }
        });
    }
}

/// Fails a `Completing` session whose completion call went away before
/// settling it.
struct CompletionGuard {
    store: Arc<SessionStore>,
    id: String,
    armed: bool,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = Arc::clone(&self.store);
        let id = std::mem::take(&mut self.id);
        let abandon = move || {
            warn!(session = %id, "completion abandoned");
            if let Err(e) = store.fail(&id, "completion abandoned") {
                debug!(session = %id, error = %e, "abandoned session already settled");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(abandon);
            }
            Err(_) => abandon(),
        }
    }
}
