//! Scriptable in-memory sink shared by the crate's tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use imgstash_protocol::ErrorKind;
use imgstash_protocol::messages::{
    ChunkAck, ChunkHeader, CreateSessionRequest, CreateSessionResponse, UploadRequest,
};
use imgstash_protocol::types::PublishedLinks;
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;
use crate::sink::ChunkSink;

type Fut<'a, T> = Pin<Box<dyn Future<Output = Result<T, UploadError>> + Send + 'a>>;

pub(crate) fn links(name: &str) -> PublishedLinks {
    let url = format!("https://img.test/{name}");
    PublishedLinks {
        markdown: format!("![{name}]({url})"),
        html: format!("<img src=\"{url}\" alt=\"{name}\">"),
        bbcode: format!("[img]{url}[/img]"),
        url,
    }
}

#[derive(Default)]
pub(crate) struct MockSink {
    latency: Duration,
    fail_times: Mutex<HashMap<u32, u32>>,
    reject: Mutex<HashSet<u32>>,
    fail_complete: Mutex<bool>,
    attempts: Mutex<HashMap<u32, u32>>,
    chunks: Mutex<BTreeMap<u32, Bytes>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancel_after: Mutex<Option<(u32, CancellationToken)>>,
    pub sessions: Mutex<Vec<CreateSessionRequest>>,
    pub completed: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<String>>,
    pub whole: Mutex<Vec<(UploadRequest, Bytes)>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Chunk `index` fails transiently `times` times before succeeding.
    pub fn fail_chunk(&self, index: u32, times: u32) {
        self.fail_times.lock().unwrap().insert(index, times);
    }

    /// Chunk `index` is refused with a 404.
    pub fn reject_chunk(&self, index: u32) {
        self.reject.lock().unwrap().insert(index);
    }

    pub fn fail_complete(&self) {
        *self.fail_complete.lock().unwrap() = true;
    }

    /// Fires `token` once `sends` chunk sends have started.
    pub fn cancel_after(&self, sends: u32, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((sends, token));
    }

    pub fn attempts(&self, index: u32) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Accepted chunks concatenated in index order.
    pub fn assembled(&self) -> Vec<u8> {
        let chunks = self.chunks.lock().unwrap();
        chunks.values().flat_map(|c| c.iter().copied()).collect()
    }
}

impl ChunkSink for MockSink {
    fn create_session(&self, req: CreateSessionRequest) -> Fut<'_, CreateSessionResponse> {
        Box::pin(async move {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.push(req);
            Ok(CreateSessionResponse {
                session_id: format!("s{}", sessions.len()),
                ttl_seconds: 600,
            })
        })
    }

    fn send_chunk(&self, header: ChunkHeader, data: Bytes) -> Fut<'_, ChunkAck> {
        Box::pin(async move {
            let index = header.chunk_index;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let started = {
                let mut attempts = self.attempts.lock().unwrap();
                *attempts.entry(index).or_insert(0) += 1;
                attempts.values().sum::<u32>()
            };
            let trigger = match &*self.cancel_after.lock().unwrap() {
                Some((sends, token)) if started >= *sends => Some(token.clone()),
                _ => None,
            };
            if let Some(token) = trigger {
                token.cancel();
            }

            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.reject.lock().unwrap().contains(&index) {
                return Err(UploadError::Rejected {
                    kind: ErrorKind::NotFound,
                    status: 404,
                    message: "session not found".into(),
                });
            }
            let transient = match self.fail_times.lock().unwrap().get_mut(&index) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            if transient {
                return Err(UploadError::Transient("connection reset".into()));
            }

            self.chunks.lock().unwrap().insert(index, data);
            Ok(ChunkAck {
                chunk_index: index,
                received: true,
                progress_percent: 0.0,
            })
        })
    }

    fn complete(&self, session_id: &str) -> Fut<'_, PublishedLinks> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            if *self.fail_complete.lock().unwrap() {
                return Err(UploadError::Rejected {
                    kind: ErrorKind::Conflict,
                    status: 409,
                    message: "already exists".into(),
                });
            }
            let name = self
                .sessions
                .lock()
                .unwrap()
                .last()
                .map(|s| s.file_name.clone())
                .unwrap_or_default();
            self.completed.lock().unwrap().push(session_id);
            Ok(links(&name))
        })
    }

    fn cancel(&self, session_id: &str) -> Fut<'_, ()> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            self.cancelled.lock().unwrap().push(session_id);
            Ok(())
        })
    }

    fn upload_whole(&self, req: UploadRequest, data: Bytes) -> Fut<'_, PublishedLinks> {
        Box::pin(async move {
            let links = links(&req.file_name);
            self.whole.lock().unwrap().push((req, data));
            Ok(links)
        })
    }
}
