//! Upload orchestrator.
//!
//! Picks the single-request path for small objects and the chunked session
//! path for everything else, emits progress events, and abandons the
//! server session when anything goes wrong.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use imgstash_protocol::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_SMALL_OBJECT_THRESHOLD};
use imgstash_protocol::messages::{CreateSessionRequest, UploadRequest};
use imgstash_protocol::types::PublishedLinks;
use imgstash_transfer::{
    ChunkDescriptor, ChunkPlan, ChunkSource, FileSource, ProgressTracker, TransferError,
    detect_image_type, validate_file_name,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::UploadError;
use crate::sink::ChunkSink;
use crate::transport::{ChunkTransport, TransportConfig};
use crate::types::{UploadEvent, UploadOutcome};

/// Client upload settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploaderConfig {
    pub chunk_size: u64,
    /// Objects strictly smaller than this skip the session protocol.
    pub small_object_threshold: u64,
    pub transport: TransportConfig,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            small_object_threshold: DEFAULT_SMALL_OBJECT_THRESHOLD,
            transport: TransportConfig::default(),
        }
    }
}

/// Uploads images through a [`ChunkSink`].
pub struct Uploader {
    sink: Arc<dyn ChunkSink>,
    config: UploaderConfig,
    transport: ChunkTransport,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
    cancel: CancellationToken,
}

impl Uploader {
    pub fn new(sink: Arc<dyn ChunkSink>, config: UploaderConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            transport: ChunkTransport::new(Arc::clone(&sink), config.transport),
            sink,
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Token that aborts every upload started by this uploader.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uploads the file at `path`.
    ///
    /// `name` defaults to the file's own name and `mime_type` to the type
    /// implied by its extension.
    pub async fn upload_file(
        &self,
        path: &Path,
        name: Option<&str>,
        mime_type: Option<&str>,
    ) -> Result<UploadOutcome, UploadError> {
        let file_name = match name {
            Some(n) => n.to_string(),
            None => path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    TransferError::InvalidName(path.display().to_string())
                })?,
        };
        let mime_type = match mime_type {
            Some(m) => m.to_string(),
            None => detect_image_type(&file_name)
                .ok_or_else(|| UploadError::UnsupportedType(file_name.clone()))?
                .to_string(),
        };

        let owned = path.to_path_buf();
        let source = tokio::task::spawn_blocking(move || FileSource::open(&owned))
            .await
            .map_err(|e| UploadError::Worker(format!("open task failed: {e}")))??;
        debug!(path = %path.display(), size = source.len(), "opened upload source");

        self.upload(&file_name, &mime_type, Arc::new(source)).await
    }

    /// Uploads `source` as `file_name`.
    pub async fn upload(
        &self,
        file_name: &str,
        mime_type: &str,
        source: Arc<dyn ChunkSource>,
    ) -> Result<UploadOutcome, UploadError> {
        let result = self.upload_inner(file_name, mime_type, source).await;
        match &result {
            Ok(outcome) => {
                info!(
                    file = %file_name,
                    bytes = outcome.bytes,
                    chunks = outcome.chunks,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "upload completed"
                );
                self.emit(UploadEvent::Completed {
                    file_name: file_name.to_string(),
                    links: outcome.links.clone(),
                });
            }
            Err(e) => {
                error!(file = %file_name, error = %e, "upload failed");
                self.emit(UploadEvent::Failed {
                    file_name: file_name.to_string(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn upload_inner(
        &self,
        file_name: &str,
        mime_type: &str,
        source: Arc<dyn ChunkSource>,
    ) -> Result<UploadOutcome, UploadError> {
        validate_file_name(file_name)?;
        self.check_cancelled()?;

        let started = Instant::now();
        let total = source.len();
        if total < self.config.small_object_threshold {
            let links = self.upload_small(file_name, mime_type, source).await?;
            return Ok(UploadOutcome {
                file_name: file_name.to_string(),
                links,
                bytes: total,
                session_id: None,
                chunks: 0,
                elapsed: started.elapsed(),
            });
        }

        let plan = ChunkPlan::new(total, self.config.chunk_size)?;
        let created = self
            .sink
            .create_session(CreateSessionRequest {
                file_name: file_name.to_string(),
                file_size: total,
                total_chunks: plan.total_chunks(),
                mime_type: mime_type.to_string(),
                chunk_size: Some(plan.chunk_size()),
            })
            .await?;
        let session_id = created.session_id;
        info!(
            file = %file_name,
            session = %session_id,
            size = total,
            chunks = plan.total_chunks(),
            "upload session created"
        );
        self.emit(UploadEvent::Started {
            file_name: file_name.to_string(),
            total_bytes: total,
            total_chunks: plan.total_chunks(),
        });

        match self.send_and_complete(&session_id, plan, source).await {
            Ok(links) => Ok(UploadOutcome {
                file_name: file_name.to_string(),
                links,
                bytes: total,
                session_id: Some(session_id),
                chunks: plan.total_chunks(),
                elapsed: started.elapsed(),
            }),
            Err(e) => {
                self.abandon(&session_id).await;
                Err(e)
            }
        }
    }

    async fn send_and_complete(
        &self,
        session_id: &str,
        plan: ChunkPlan,
        source: Arc<dyn ChunkSource>,
    ) -> Result<PublishedLinks, UploadError> {
        let progress = Arc::new(ProgressTracker::new(plan.total_size()));
        let report = self
            .transport
            .run(
                session_id,
                plan,
                source,
                progress,
                Some(self.events_tx.clone()),
                &self.cancel,
            )
            .await?;
        if report.retries > 0 {
            debug!(session = %session_id, retries = report.retries, "chunks needed retries");
        }
        self.check_cancelled()?;
        self.sink.complete(session_id).await
    }

    async fn upload_small(
        &self,
        file_name: &str,
        mime_type: &str,
        source: Arc<dyn ChunkSource>,
    ) -> Result<PublishedLinks, UploadError> {
        let total = source.len();
        self.emit(UploadEvent::Started {
            file_name: file_name.to_string(),
            total_bytes: total,
            total_chunks: 0,
        });

        let whole = ChunkDescriptor {
            index: 0,
            start: 0,
            end: total,
        };
        let data: Bytes = tokio::task::spawn_blocking(move || source.read_chunk(&whole))
            .await
            .map_err(|e| UploadError::Worker(format!("read task failed: {e}")))??;

        let req = UploadRequest {
            file_name: file_name.to_string(),
            file_size: total,
            mime_type: mime_type.to_string(),
        };
        let progress = ProgressTracker::new(total);
        let links = tokio::select! {
            _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
            res = self.sink.upload_whole(req, data) => res?,
        };
        self.emit(UploadEvent::Progress(progress.record(total)));
        Ok(links)
    }

    /// Best-effort cancel so the server can drop staged chunks early.
    async fn abandon(&self, session_id: &str) {
        match tokio::time::timeout(CANCEL_TIMEOUT, self.sink.cancel(session_id)).await {
            Ok(Ok(())) => debug!(session = %session_id, "session abandoned"),
            Ok(Err(e)) => warn!(session = %session_id, error = %e, "failed to cancel session"),
            Err(_) => warn!(session = %session_id, "timed out cancelling session"),
        }
    }

    fn check_cancelled(&self) -> Result<(), UploadError> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events_tx.try_send(event);
    }
}

const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSink;
    use imgstash_transfer::MemorySource;

    fn config(chunk_size: u64, threshold: u64) -> UploaderConfig {
        UploaderConfig {
            chunk_size,
            small_object_threshold: threshold,
            transport: TransportConfig {
                max_concurrent: 2,
                max_retries: 3,
                retry_delay: Duration::from_millis(100),
            },
        }
    }

    fn source(len: usize) -> Arc<dyn ChunkSource> {
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        Arc::new(MemorySource::new(data))
    }

    fn drain(rx: &mut mpsc::Receiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn small_object_bypasses_sessions() {
        let sink = Arc::new(MockSink::new());
        let uploader = Uploader::new(sink.clone(), config(10, 100));

        let outcome = uploader.upload("tiny.png", "image/png", source(40)).await.unwrap();
        assert_eq!(outcome.session_id, None);
        assert_eq!(outcome.chunks, 0);
        assert_eq!(outcome.links.url, "https://img.test/tiny.png");

        assert!(sink.sessions.lock().unwrap().is_empty());
        let whole = sink.whole.lock().unwrap();
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].0.file_size, 40);
        assert_eq!(whole[0].1.len(), 40);
    }

    #[tokio::test]
    async fn threshold_is_exclusive() {
        let sink = Arc::new(MockSink::new());
        let uploader = Uploader::new(sink.clone(), config(10, 100));

        let outcome = uploader.upload("edge.png", "image/png", source(100)).await.unwrap();
        assert_eq!(outcome.session_id.as_deref(), Some("s1"));
        assert_eq!(outcome.chunks, 10);
        assert!(sink.whole.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunked_upload_happy_path() {
        let sink = Arc::new(MockSink::new());
        let mut uploader = Uploader::new(sink.clone(), config(10, 20));
        let mut rx = uploader.take_events().unwrap();
        assert!(uploader.take_events().is_none());

        let src = source(35);
        let outcome = uploader.upload("cat.png", "image/png", src.clone()).await.unwrap();
        assert_eq!(outcome.bytes, 35);
        assert_eq!(outcome.chunks, 4);

        let req = sink.sessions.lock().unwrap()[0].clone();
        assert_eq!(req.total_chunks, 4);
        assert_eq!(req.file_size, 35);
        assert_eq!(req.chunk_size, Some(10));
        assert_eq!(*sink.completed.lock().unwrap(), vec!["s1".to_string()]);
        assert!(sink.cancelled.lock().unwrap().is_empty());

        let expected = src
            .read_chunk(&ChunkDescriptor {
                index: 0,
                start: 0,
                end: 35,
            })
            .unwrap();
        assert_eq!(sink.assembled(), expected.to_vec());

        let events = drain(&mut rx);
        assert!(matches!(
            events.first(),
            Some(UploadEvent::Started {
                total_chunks: 4,
                ..
            })
        ));
        let acked = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::ChunkAcked { .. }))
            .count();
        assert_eq!(acked, 4);
        assert!(matches!(events.last(), Some(UploadEvent::Completed { .. })));
        let last_progress = events.iter().rev().find_map(|e| match e {
            UploadEvent::Progress(p) => Some(*p),
            _ => None,
        });
        assert_eq!(last_progress.map(|p| p.bytes_transferred), Some(35));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_cancels_session() {
        let sink = Arc::new(MockSink::new());
        sink.reject_chunk(2);
        let mut uploader = Uploader::new(sink.clone(), config(10, 0));
        let mut rx = uploader.take_events().unwrap();

        let err = uploader
            .upload("cat.png", "image/png", source(50))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Rejected { status: 404, .. }));
        assert_eq!(*sink.cancelled.lock().unwrap(), vec!["s1".to_string()]);
        assert!(sink.completed.lock().unwrap().is_empty());

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(UploadEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn complete_failure_cancels_session() {
        let sink = Arc::new(MockSink::new());
        sink.fail_complete();
        let uploader = Uploader::new(sink.clone(), config(10, 0));

        let err = uploader
            .upload("cat.png", "image/png", source(25))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Rejected { status: 409, .. }));
        assert_eq!(sink.cancelled.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_recover() {
        let sink = Arc::new(MockSink::new());
        sink.fail_chunk(1, 2);
        let uploader = Uploader::new(sink.clone(), config(10, 0));

        let outcome = uploader.upload("cat.png", "image/png", source(30)).await.unwrap();
        assert_eq!(outcome.chunks, 3);
        assert_eq!(sink.attempts(1), 3);
        assert!(sink.cancelled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_uploader_sends_nothing() {
        let sink = Arc::new(MockSink::new());
        let uploader = Uploader::new(sink.clone(), config(10, 0));
        uploader.cancel_token().cancel();

        let err = uploader
            .upload("cat.png", "image/png", source(30))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
        assert!(sink.sessions.lock().unwrap().is_empty());
        assert_eq!(sink.total_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_upload_abandons_session() {
        let sink = Arc::new(MockSink::new().with_latency(Duration::from_millis(10)));
        let uploader = Uploader::new(sink.clone(), config(10, 0));
        sink.cancel_after(2, uploader.cancel_token());

        let err = uploader
            .upload("cat.png", "image/png", source(100))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
        assert_eq!(sink.cancelled.lock().unwrap().len(), 1);
        assert!(sink.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_bad_names_before_contacting_server() {
        let sink = Arc::new(MockSink::new());
        let uploader = Uploader::new(sink.clone(), config(10, 0));

        let err = uploader
            .upload("../cat.png", "image/png", source(30))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Transfer(TransferError::InvalidName(_))));
        assert!(sink.sessions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_file_detects_name_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.JPG");
        std::fs::write(&path, vec![7u8; 25]).unwrap();

        let sink = Arc::new(MockSink::new());
        let uploader = Uploader::new(sink.clone(), config(10, 0));
        let outcome = uploader.upload_file(&path, None, None).await.unwrap();
        assert_eq!(outcome.file_name, "photo.JPG");
        assert_eq!(outcome.chunks, 3);

        let req = sink.sessions.lock().unwrap()[0].clone();
        assert_eq!(req.mime_type, "image/jpeg");
        assert_eq!(sink.assembled(), vec![7u8; 25]);
    }

    #[tokio::test]
    async fn upload_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"abc").unwrap();

        let sink = Arc::new(MockSink::new());
        let uploader = Uploader::new(sink.clone(), config(10, 100));

        let err = uploader.upload_file(&path, None, None).await.unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedType(_)));

        let outcome = uploader
            .upload_file(&path, Some("renamed.png"), Some("image/png"))
            .await
            .unwrap();
        assert_eq!(outcome.file_name, "renamed.png");
        assert_eq!(sink.whole.lock().unwrap()[0].0.mime_type, "image/png");
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MockSink::new());
        let uploader = Uploader::new(sink, UploaderConfig::default());
        let err = uploader
            .upload_file(&dir.path().join("nope.png"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Transfer(TransferError::Io(_))));
    }
}
