//! Per-upload session record and its state machine.

use std::collections::BTreeMap;
use std::time::Duration;

use imgstash_protocol::SessionStatus;
use imgstash_protocol::messages::SessionStatusResponse;
use imgstash_transfer::ChunkPlan;
use rand::Rng;
use tokio::time::Instant;

use crate::error::SessionError;

/// Session id length in bytes (produces 32 hex characters).
const SESSION_ID_BYTES: usize = 16;

/// Generates an unguessable session id as a 32-character lowercase hex string.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// What the client declared when opening the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub file_name: String,
    pub declared_size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    /// Optional fixed chunk size; when set every chunk length is checked
    /// against the plan.
    pub chunk_size: Option<u64>,
}

/// Outcome of one accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkReceipt {
    pub index: u32,
    /// `false` when the index had already been received.
    pub fresh: bool,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub progress_percent: f64,
}

/// Server-side record of one chunked upload.
///
/// Transition methods are pure with respect to the outside world: they
/// validate, mutate the record and report. Staging and publishing are the
/// caller's job.
#[derive(Debug)]
pub struct UploadSession {
    id: String,
    meta: SessionMeta,
    plan: Option<ChunkPlan>,
    received: BTreeMap<u32, u64>,
    status: SessionStatus,
    ttl: Duration,
    created_at: Instant,
    last_activity_at: Instant,
    finished_at: Option<Instant>,
    error: Option<String>,
}

impl UploadSession {
    pub fn new(id: String, meta: SessionMeta, ttl: Duration, now: Instant) -> Self {
        let plan = meta
            .chunk_size
            .and_then(|size| ChunkPlan::new(meta.declared_size, size).ok());
        Self {
            id,
            meta,
            plan,
            received: BTreeMap::new(),
            status: SessionStatus::Created,
            ttl,
            created_at: now,
            last_activity_at: now,
            finished_at: None,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    /// `last_activity_at + ttl`.
    pub fn expires_at(&self) -> Instant {
        self.last_activity_at + self.ttl
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    /// When the session reached `Completed` or `Failed`.
    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn received_bytes(&self) -> u64 {
        self.received.values().sum()
    }

    /// Recorded length for `index`, if received.
    pub fn chunk_len(&self, index: u32) -> Option<u64> {
        self.received.get(&index).copied()
    }

    /// Recorded lengths in index order. Only meaningful once complete.
    pub fn chunk_lengths(&self) -> Vec<u64> {
        self.received.values().copied().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.meta.total_chunks
    }

    /// Byte-based progress in `[0, 100]`.
    pub fn progress_percent(&self) -> f64 {
        if self.meta.declared_size == 0 {
            return 100.0;
        }
        (self.received_bytes() as f64 / self.meta.declared_size as f64 * 100.0).min(100.0)
    }

    /// Checks whether a chunk would be accepted, without recording it.
    pub fn check_chunk(&self, index: u32, len: u64) -> Result<(), SessionError> {
        if !self.status.accepts_chunks() {
            return Err(self.invalid_state());
        }
        if index >= self.meta.total_chunks {
            return Err(SessionError::ChunkIndexOutOfRange {
                index,
                total: self.meta.total_chunks,
            });
        }
        // A re-send must match what was recorded first.
        let expected = self
            .plan
            .and_then(|p| p.expected_len(index))
            .or_else(|| self.received.get(&index).copied());
        if let Some(expected) = expected.filter(|e| *e != len) {
            return Err(SessionError::ChunkLengthMismatch {
                index,
                expected,
                received: len,
            });
        }
        Ok(())
    }

    /// Records `len` bytes for `index`.
    ///
    /// Re-sending an index with the same length is a no-op apart from the
    /// activity bump. The first chunk moves the session to `Uploading`.
    pub fn record_chunk(
        &mut self,
        index: u32,
        len: u64,
        now: Instant,
    ) -> Result<ChunkReceipt, SessionError> {
        self.check_chunk(index, len)?;

        let fresh = self.received.insert(index, len).is_none();
        self.last_activity_at = now;
        if self.status == SessionStatus::Created {
            self.status = SessionStatus::Uploading;
        }

        Ok(ChunkReceipt {
            index,
            fresh,
            received_chunks: self.received_count(),
            total_chunks: self.meta.total_chunks,
            progress_percent: self.progress_percent(),
        })
    }

    /// Moves to `Completing`. Requires every index to be present.
    pub fn begin_completion(&mut self, now: Instant) -> Result<(), SessionError> {
        if !self.status.can_transition_to(SessionStatus::Completing) {
            return Err(self.invalid_state());
        }
        if !self.is_complete() {
            return Err(SessionError::IncompleteUpload {
                received: self.received_count(),
                expected: self.meta.total_chunks,
            });
        }
        self.status = SessionStatus::Completing;
        self.last_activity_at = now;
        Ok(())
    }

    /// Moves to `Completed` after a successful publish.
    pub fn finalize(&mut self, now: Instant) -> Result<(), SessionError> {
        if !self.status.can_transition_to(SessionStatus::Completed) {
            return Err(self.invalid_state());
        }
        if !self.is_complete() {
            return Err(SessionError::IncompleteUpload {
                received: self.received_count(),
                expected: self.meta.total_chunks,
            });
        }
        self.status = SessionStatus::Completed;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Moves to `Failed`, keeping `message` for status queries.
    pub fn fail(&mut self, message: impl Into<String>, now: Instant) -> Result<(), SessionError> {
        if !self.status.can_transition_to(SessionStatus::Failed) {
            return Err(self.invalid_state());
        }
        self.status = SessionStatus::Failed;
        self.error = Some(message.into());
        self.finished_at = Some(now);
        Ok(())
    }

    /// Moves to `Cancelled`. Returns `false` if already terminal.
    pub fn cancel(&mut self) -> bool {
        self.absorb(SessionStatus::Cancelled)
    }

    /// Moves to `Expired`. Returns `false` if already terminal.
    pub fn expire(&mut self) -> bool {
        self.absorb(SessionStatus::Expired)
    }

    fn absorb(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    fn invalid_state(&self) -> SessionError {
        SessionError::InvalidState {
            id: self.id.clone(),
            status: self.status,
        }
    }

    /// Wire snapshot for status queries.
    pub fn to_status(&self) -> SessionStatusResponse {
        SessionStatusResponse {
            session_id: self.id.clone(),
            status: self.status,
            received_chunks: self.received_count(),
            total_chunks: self.meta.total_chunks,
            received_bytes: self.received_bytes(),
            error: self.error.clone(),
        }
    }
}
