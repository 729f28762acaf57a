//! Bounded-concurrency chunk transport with retry and cooperative
//! cancellation.
//!
//! A fixed pool of workers shares one queue of pending chunk indices.
//! Each worker pulls an index, sends the chunk and either marks it done or
//! requeues it after a linear backoff. Chunks complete in any order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use imgstash_protocol::constants::{DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};
use imgstash_protocol::messages::ChunkHeader;
use imgstash_transfer::{ChunkDescriptor, ChunkPlan, ChunkSource, ProgressTracker};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::UploadError;
use crate::sink::ChunkSink;
use crate::types::UploadEvent;

/// Worker pool and retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Maximum chunks in flight at once.
    pub max_concurrent: usize,
    /// Retries allowed per chunk before the upload fails.
    pub max_retries: u32,
    /// Base backoff; retry `n` waits `n × retry_delay`.
    pub retry_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Summary of a finished transport run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportReport {
    pub chunks: u32,
    /// Total retries across all chunks.
    pub retries: u32,
}

struct Queue {
    pending: VecDeque<u32>,
    retries: HashMap<u32, u32>,
    /// Chunks not yet acknowledged: queued, in flight or backing off.
    outstanding: usize,
    fatal: Option<UploadError>,
}

struct Shared {
    queue: Mutex<Queue>,
    notify: Notify,
    /// Fires on caller cancellation or on the first fatal error.
    abort: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the first fatal error and stops all dispatching.
    fn fail(&self, err: UploadError) {
        {
            let mut q = self.lock();
            if q.fatal.is_none() {
                q.fatal = Some(err);
            }
        }
        self.abort.cancel();
        self.notify.notify_waiters();
    }

    /// Waits for the next pending index. `None` means stop: everything is
    /// acknowledged or the run was aborted.
    async fn next(&self) -> Option<u32> {
        loop {
            // Register before checking so a wakeup between the check and
            // the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut q = self.lock();
                if self.abort.is_cancelled() || q.outstanding == 0 {
                    return None;
                }
                if let Some(index) = q.pending.pop_front() {
                    return Some(index);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.abort.cancelled() => return None,
            }
        }
    }
}

/// Uploads the chunks of one session through a [`ChunkSink`].
pub struct ChunkTransport {
    sink: Arc<dyn ChunkSink>,
    config: TransportConfig,
}

impl ChunkTransport {
    pub fn new(sink: Arc<dyn ChunkSink>, config: TransportConfig) -> Self {
        Self { sink, config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Sends every chunk of `plan` for `session_id`.
    ///
    /// Returns when all chunks are acknowledged, a chunk exhausts its
    /// retries, the server rejects a chunk, or `cancel` fires. In-flight
    /// sends are never interrupted; cancellation only stops new dispatches.
    pub async fn run(
        &self,
        session_id: &str,
        plan: ChunkPlan,
        source: Arc<dyn ChunkSource>,
        progress: Arc<ProgressTracker>,
        events: Option<mpsc::Sender<UploadEvent>>,
        cancel: &CancellationToken,
    ) -> Result<TransportReport, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        let total = plan.total_chunks();
        if total == 0 {
            return Ok(TransportReport {
                chunks: 0,
                retries: 0,
            });
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                pending: (0..total).collect(),
                retries: HashMap::new(),
                outstanding: total as usize,
                fatal: None,
            }),
            notify: Notify::new(),
            abort: cancel.child_token(),
        });

        let workers = self.config.max_concurrent.clamp(1, total as usize);
        debug!(session = %session_id, chunks = total, workers, "starting chunk transport");

        let mut set = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                session_id: session_id.to_string(),
                plan,
                sink: Arc::clone(&self.sink),
                source: Arc::clone(&source),
                shared: Arc::clone(&shared),
                progress: Arc::clone(&progress),
                events: events.clone(),
                config: self.config,
            };
            set.spawn(worker.run());
        }
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                shared.fail(UploadError::Worker(e.to_string()));
            }
        }

        let mut q = shared.lock();
        if let Some(err) = q.fatal.take() {
            return Err(err);
        }
        if q.outstanding > 0 {
            debug!(session = %session_id, left = q.outstanding, "chunk transport cancelled");
            return Err(UploadError::Cancelled);
        }
        Ok(TransportReport {
            chunks: total,
            retries: q.retries.values().sum(),
        })
    }
}

struct Worker {
    id: usize,
    session_id: String,
    plan: ChunkPlan,
    sink: Arc<dyn ChunkSink>,
    source: Arc<dyn ChunkSource>,
    shared: Arc<Shared>,
    progress: Arc<ProgressTracker>,
    events: Option<mpsc::Sender<UploadEvent>>,
    config: TransportConfig,
}

impl Worker {
    async fn run(self) {
        while let Some(index) = self.shared.next().await {
            self.dispatch(index).await;
        }
        debug!(worker = self.id, "worker done");
    }

    async fn dispatch(&self, index: u32) {
        let Some(desc) = self.plan.descriptor(index) else {
            self.shared
                .fail(UploadError::Worker(format!("no chunk {index} in plan")));
            return;
        };
        let data = match self.read(desc).await {
            Ok(data) => data,
            Err(e) => {
                error!(session = %self.session_id, index, error = %e, "failed to read chunk");
                self.shared.fail(e);
                return;
            }
        };

        let header = ChunkHeader {
            session_id: self.session_id.clone(),
            chunk_index: index,
            total_chunks: self.plan.total_chunks(),
        };
        match self.sink.send_chunk(header, data).await {
            Ok(_) => self.acked(desc),
            Err(e) => self.retry_or_fail(index, e).await,
        }
    }

    /// Sources may hit the disk, so reads go to the blocking pool.
    async fn read(&self, desc: ChunkDescriptor) -> Result<Bytes, UploadError> {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || source.read_chunk(&desc))
            .await
            .map_err(|e| UploadError::Worker(format!("read task failed: {e}")))?
            .map_err(UploadError::from)
    }

    fn acked(&self, desc: ChunkDescriptor) {
        let done = {
            let mut q = self.shared.lock();
            q.outstanding -= 1;
            q.outstanding == 0
        };
        let snapshot = self.progress.record(desc.len());
        debug!(
            session = %self.session_id,
            worker = self.id,
            index = desc.index,
            percent = format_args!("{:.1}", snapshot.percent()),
            "chunk acknowledged"
        );
        self.emit(UploadEvent::ChunkAcked {
            index: desc.index,
            len: desc.len(),
        });
        self.emit(UploadEvent::Progress(snapshot));
        if done {
            self.shared.notify.notify_waiters();
        }
    }

    async fn retry_or_fail(&self, index: u32, err: UploadError) {
        if !err.is_retryable() {
            error!(session = %self.session_id, index, error = %err, "chunk rejected");
            self.shared.fail(err);
            return;
        }

        let attempt = {
            let mut q = self.shared.lock();
            let count = q.retries.entry(index).or_insert(0);
            *count += 1;
            *count
        };
        if attempt > self.config.max_retries {
            error!(session = %self.session_id, index, attempts = attempt, error = %err, "chunk retries exhausted");
            self.shared.fail(UploadError::RetriesExhausted {
                index,
                attempts: attempt,
                last_error: err.to_string(),
            });
            return;
        }

        let delay = self.config.retry_delay * attempt;
        warn!(
            session = %self.session_id,
            index,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "chunk failed, retrying"
        );
        self.emit(UploadEvent::ChunkRetry {
            index,
            attempt,
            delay,
            error: err.to_string(),
        });

        tokio::select! {
            _ = self.shared.abort.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        self.shared.lock().pending.push_back(index);
        self.shared.notify.notify_one();
    }

    fn emit(&self, event: UploadEvent) {
        if let Some(tx) = &self.events {
            // Events are advisory; a slow consumer never stalls the upload.
            let _ = tx.try_send(event);
        }
    }
}
