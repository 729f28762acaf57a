//! In-process [`ChunkSink`] backed by an [`UploadService`].

use std::sync::Arc;

use bytes::Bytes;
use imgstash_protocol::messages::{
    ChunkAck, ChunkHeader, CreateSessionRequest, CreateSessionResponse, UploadRequest,
};
use imgstash_protocol::types::PublishedLinks;
use imgstash_session::{BoxFuture, Caller, SessionError, UploadService};
use imgstash_uploader::{ChunkSink, UploadError};

/// Server errors reach the client the way they would over the wire.
fn to_upload_error(e: SessionError) -> UploadError {
    UploadError::from_body(e.to_body())
}

/// Routes client calls straight into a local upload service.
pub struct LocalSink {
    service: Arc<UploadService>,
    caller: Caller,
}

impl LocalSink {
    pub fn new(service: Arc<UploadService>, caller: Caller) -> Self {
        Self { service, caller }
    }
}

impl ChunkSink for LocalSink {
    fn create_session(
        &self,
        req: CreateSessionRequest,
    ) -> BoxFuture<'_, Result<CreateSessionResponse, UploadError>> {
        Box::pin(async move {
            self.service
                .create_session(&self.caller, req)
                .await
                .map_err(to_upload_error)
        })
    }

    fn send_chunk(
        &self,
        header: ChunkHeader,
        data: Bytes,
    ) -> BoxFuture<'_, Result<ChunkAck, UploadError>> {
        Box::pin(async move {
            self.service
                .upload_chunk(header, data)
                .await
                .map_err(to_upload_error)
        })
    }

    fn complete(&self, session_id: &str) -> BoxFuture<'_, Result<PublishedLinks, UploadError>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            self.service
                .complete(&session_id)
                .await
                .map(|image| image.links)
                .map_err(to_upload_error)
        })
    }

    fn cancel(&self, session_id: &str) -> BoxFuture<'_, Result<(), UploadError>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            self.service
                .cancel(&session_id)
                .await
                .map(|_| ())
                .map_err(to_upload_error)
        })
    }

    fn upload_whole(
        &self,
        req: UploadRequest,
        data: Bytes,
    ) -> BoxFuture<'_, Result<PublishedLinks, UploadError>> {
        Box::pin(async move {
            self.service
                .upload_whole(&self.caller, req, data)
                .await
                .map(|image| image.links)
                .map_err(to_upload_error)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use imgstash_protocol::ErrorKind;
    use imgstash_session::{ContentPublisher, GuestPolicy, MemoryContentStore, SessionConfig};
    use imgstash_transfer::{ChunkSource, MemoryChunkStore, MemorySource};
    use imgstash_uploader::{TransportConfig, Uploader, UploaderConfig};

    const MB: u64 = 1024 * 1024;

    struct Harness {
        service: Arc<UploadService>,
        content: Arc<MemoryContentStore>,
    }

    fn harness(ttl: Duration) -> Harness {
        let content = Arc::new(MemoryContentStore::new());
        let publisher = ContentPublisher::new(content.clone(), "https://img.example.com");
        let config = SessionConfig {
            ttl,
            ..SessionConfig::default()
        };
        let service = Arc::new(UploadService::new(
            config,
            Arc::new(MemoryChunkStore::new()),
            publisher,
        ));
        Harness { service, content }
    }

    fn uploader_config(chunk_size: u64) -> UploaderConfig {
        UploaderConfig {
            chunk_size,
            small_object_threshold: 1024,
            transport: TransportConfig {
                max_concurrent: 3,
                max_retries: 3,
                retry_delay: Duration::from_millis(100),
            },
        }
    }

    fn pattern(len: u64) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    /// Fails chosen chunks transiently before letting them through.
    struct FlakySink {
        inner: LocalSink,
        failures: Mutex<HashMap<u32, u32>>,
    }

    impl ChunkSink for FlakySink {
        fn create_session(
            &self,
            req: CreateSessionRequest,
        ) -> BoxFuture<'_, Result<CreateSessionResponse, UploadError>> {
            self.inner.create_session(req)
        }

        fn send_chunk(
            &self,
            header: ChunkHeader,
            data: Bytes,
        ) -> BoxFuture<'_, Result<ChunkAck, UploadError>> {
            let fail = match self.failures.lock().unwrap().get_mut(&header.chunk_index) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            if fail {
                return Box::pin(async { Err(UploadError::Transient("connection reset".into())) });
            }
            self.inner.send_chunk(header, data)
        }

        fn complete(&self, session_id: &str) -> BoxFuture<'_, Result<PublishedLinks, UploadError>> {
            self.inner.complete(session_id)
        }

        fn cancel(&self, session_id: &str) -> BoxFuture<'_, Result<(), UploadError>> {
            self.inner.cancel(session_id)
        }

        fn upload_whole(
            &self,
            req: UploadRequest,
            data: Bytes,
        ) -> BoxFuture<'_, Result<PublishedLinks, UploadError>> {
            self.inner.upload_whole(req, data)
        }
    }

    #[tokio::test]
    async fn twelve_megabytes_in_five_megabyte_chunks() {
        let h = harness(Duration::from_secs(600));
        let sink = Arc::new(LocalSink::new(h.service.clone(), Caller::Guest));
        let uploader = Uploader::new(sink, uploader_config(5 * MB));

        let data = pattern(12 * MB);
        let source: Arc<dyn ChunkSource> = Arc::new(MemorySource::new(data.clone()));
        let outcome = uploader.upload("big.png", "image/png", source).await.unwrap();

        assert_eq!(outcome.chunks, 3);
        assert_eq!(outcome.links.url, "https://img.example.com/big.png");
        let stored = h.content.get("big.png").unwrap();
        assert_eq!(stored.len() as u64, 12 * MB);
        assert_eq!(&stored[..], &data[..]);
        // Completed sessions linger only for the grace window.
        assert!(h.service.store().len() <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_chunk_failures_recover_end_to_end() {
        let h = harness(Duration::from_secs(600));
        let sink = Arc::new(FlakySink {
            inner: LocalSink::new(h.service.clone(), Caller::Guest),
            failures: Mutex::new(HashMap::from([(1, 2)])),
        });
        let uploader = Uploader::new(sink.clone(), uploader_config(4096));

        let data = pattern(10_000);
        let source: Arc<dyn ChunkSource> = Arc::new(MemorySource::new(data.clone()));
        let outcome = uploader.upload("flaky.png", "image/png", source).await.unwrap();

        assert_eq!(outcome.chunks, 3);
        assert_eq!(sink.failures.lock().unwrap()[&1], 0);
        assert_eq!(&h.content.get("flaky.png").unwrap()[..], &data[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_expires() {
        let h = harness(Duration::from_secs(60));
        let sink = LocalSink::new(h.service.clone(), Caller::Guest);

        let created = sink
            .create_session(CreateSessionRequest {
                file_name: "slow.png".into(),
                file_size: 20,
                total_chunks: 2,
                mime_type: "image/png".into(),
                chunk_size: Some(10),
            })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        let err = sink
            .send_chunk(
                ChunkHeader {
                    session_id: created.session_id,
                    chunk_index: 0,
                    total_chunks: 2,
                },
                Bytes::from(vec![0u8; 10]),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Rejected {
                kind: ErrorKind::NotFound,
                status: 404,
                ..
            }
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn incomplete_session_reports_counts() {
        let h = harness(Duration::from_secs(600));
        let sink = LocalSink::new(h.service.clone(), Caller::Guest);

        let created = sink
            .create_session(CreateSessionRequest {
                file_name: "partial.png".into(),
                file_size: 30,
                total_chunks: 3,
                mime_type: "image/png".into(),
                chunk_size: Some(10),
            })
            .await
            .unwrap();
        for index in [0, 2] {
            sink.send_chunk(
                ChunkHeader {
                    session_id: created.session_id.clone(),
                    chunk_index: index,
                    total_chunks: 3,
                },
                Bytes::from(vec![1u8; 10]),
            )
            .await
            .unwrap();
        }

        let err = sink.complete(&created.session_id).await.unwrap_err();
        match err {
            UploadError::Rejected {
                status, message, ..
            } => {
                assert_eq!(status, 400);
                assert!(message.contains("received=2, expected=3"), "{message}");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(h.content.is_empty());
    }

    #[tokio::test]
    async fn small_image_takes_single_request() {
        let h = harness(Duration::from_secs(600));
        let sink = Arc::new(LocalSink::new(h.service.clone(), Caller::Guest));
        let uploader = Uploader::new(sink, uploader_config(4096));

        let source: Arc<dyn ChunkSource> = Arc::new(MemorySource::new(pattern(100)));
        let outcome = uploader.upload("icon.png", "image/png", source).await.unwrap();
        assert_eq!(outcome.session_id, None);
        assert_eq!(h.content.get("icon.png").unwrap().len(), 100);
        assert!(h.service.store().is_empty());
    }

    #[tokio::test]
    async fn name_conflict_is_terminal() {
        let h = harness(Duration::from_secs(600));
        let sink = Arc::new(LocalSink::new(h.service.clone(), Caller::Guest));
        let uploader = Uploader::new(sink, uploader_config(4096));

        let first: Arc<dyn ChunkSource> = Arc::new(MemorySource::new(pattern(10_000)));
        uploader.upload("dup.png", "image/png", first).await.unwrap();

        let second: Arc<dyn ChunkSource> = Arc::new(MemorySource::new(vec![9u8; 10_000]));
        let err = uploader
            .upload("dup.png", "image/png", second)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Rejected {
                kind: ErrorKind::Conflict,
                status: 409,
                ..
            }
        ));
        assert_eq!(&h.content.get("dup.png").unwrap()[..], &pattern(10_000)[..]);
    }

    #[tokio::test]
    async fn guests_denied_by_policy() {
        let content = Arc::new(MemoryContentStore::new());
        let service = Arc::new(
            UploadService::new(
                SessionConfig::default(),
                Arc::new(MemoryChunkStore::new()),
                ContentPublisher::new(content, "https://img.example.com"),
            )
            .with_policy(Arc::new(GuestPolicy {
                allow_guests: false,
            })),
        );

        let guest = Uploader::new(
            Arc::new(LocalSink::new(service.clone(), Caller::Guest)),
            uploader_config(4096),
        );
        let source: Arc<dyn ChunkSource> = Arc::new(MemorySource::new(pattern(10_000)));
        let err = guest
            .upload("nope.png", "image/png", source.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Rejected { status: 403, .. }));

        let user = Uploader::new(
            Arc::new(LocalSink::new(service, Caller::User("ana".into()))),
            uploader_config(4096),
        );
        user.upload("yes.png", "image/png", source).await.unwrap();
    }
}
