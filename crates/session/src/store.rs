//! Process-scoped registry of in-flight upload sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use bytes::Bytes;
use imgstash_protocol::SessionStatus;
use imgstash_protocol::constants::{
    DEFAULT_MAX_CHUNKS, DEFAULT_MAX_FILE_SIZE, DEFAULT_SESSION_TTL, DEFAULT_TERMINAL_GRACE,
};
use imgstash_protocol::messages::{ChunkHeader, SessionStatusResponse};
use imgstash_transfer::ChunkStore;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assembler::CompletionTicket;
use crate::error::SessionError;
use crate::state::{ChunkReceipt, SessionMeta, UploadSession, generate_session_id};

/// Session server limits and timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Inactivity window after which a session expires.
    pub ttl: Duration,
    /// How long `Completed`/`Failed` sessions stay visible to status queries.
    pub terminal_grace: Duration,
    pub max_file_size: u64,
    pub max_chunks: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SESSION_TTL,
            terminal_grace: DEFAULT_TERMINAL_GRACE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

/// One registered session: the record behind its own lock, plus the
/// channel that pushes status changes to waiters.
struct SessionSlot {
    session: Mutex<UploadSession>,
    status_tx: watch::Sender<SessionStatus>,
}

impl SessionSlot {
    fn lock(&self) -> MutexGuard<'_, UploadSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `None` while another caller holds the session.
    fn try_lock(&self) -> Option<MutexGuard<'_, UploadSession>> {
        match self.session.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn publish(&self, status: SessionStatus) {
        self.status_tx.send_replace(status);
    }
}

/// Registry of upload sessions with lazy TTL eviction.
///
/// The map lock only guards membership. Each session has its own lock, so
/// concurrent chunks for one session serialize while different sessions
/// proceed independently. The sweep may take the map lock while holding a
/// session lock; nothing ever waits on a session lock while holding the
/// map lock.
///
/// Staged chunk bytes live in the owned [`ChunkStore`] and are discarded
/// whenever their session leaves the store or reaches a terminal state.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
    chunks: Arc<dyn ChunkStore>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig, chunks: Arc<dyn ChunkStore>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            chunks,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Staging backend shared with the assembler.
    pub fn chunk_store(&self) -> &dyn ChunkStore {
        self.chunks.as_ref()
    }

    /// Number of registered sessions, terminal ones in their grace window
    /// included.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sweeps, then looks up `id`.
    fn slot(&self, id: &str) -> Result<Arc<SessionSlot>, SessionError> {
        self.sweep();
        self.map()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))
    }

    /// Allocates a session in `Created` state and returns its id.
    pub fn create(&self, meta: SessionMeta) -> Result<String, SessionError> {
        self.sweep();
        let now = Instant::now();
        let mut map = self.map();

        let mut id = generate_session_id();
        while map.contains_key(&id) {
            id = generate_session_id();
        }

        let (status_tx, _) = watch::channel(SessionStatus::Created);
        let session = UploadSession::new(id.clone(), meta, self.config.ttl, now);
        info!(
            session = %id,
            file = %session.meta().file_name,
            size = session.meta().declared_size,
            chunks = session.meta().total_chunks,
            "session created"
        );
        map.insert(
            id.clone(),
            Arc::new(SessionSlot {
                session: Mutex::new(session),
                status_tx,
            }),
        );
        Ok(id)
    }

    /// Stages one chunk and records it in the session.
    ///
    /// The session lock is held across staging so the recorded length and
    /// the staged bytes can never disagree.
    pub fn record_chunk(
        &self,
        header: &ChunkHeader,
        data: Bytes,
    ) -> Result<ChunkReceipt, SessionError> {
        let slot = self.slot(&header.session_id)?;
        let mut session = slot.lock();
        let now = Instant::now();
        if session.is_expired(now) && session.status().accepts_chunks() {
            return Err(SessionError::SessionNotFound(header.session_id.clone()));
        }

        let total = session.meta().total_chunks;
        if header.total_chunks != total {
            return Err(SessionError::Validation(format!(
                "totalChunks {} does not match session ({total})",
                header.total_chunks
            )));
        }

        let len = data.len() as u64;
        session.check_chunk(header.chunk_index, len)?;
        let before = session.status();
        self.chunks.put(&header.session_id, header.chunk_index, data)?;
        let receipt = session.record_chunk(header.chunk_index, len, now)?;

        debug!(
            session = %header.session_id,
            index = header.chunk_index,
            len,
            fresh = receipt.fresh,
            received = receipt.received_chunks,
            total,
            "chunk recorded"
        );
        if session.status() != before {
            slot.publish(session.status());
        }
        Ok(receipt)
    }

    /// Moves the session to `Completing` and hands back what the assembler
    /// needs.
    pub fn begin_completion(&self, id: &str) -> Result<CompletionTicket, SessionError> {
        let slot = self.slot(id)?;
        let mut session = slot.lock();
        session.begin_completion(Instant::now())?;
        slot.publish(session.status());
        debug!(session = %id, "completion started");

        let meta = session.meta();
        Ok(CompletionTicket {
            session_id: id.to_string(),
            file_name: meta.file_name.clone(),
            mime_type: meta.mime_type.clone(),
            declared_size: meta.declared_size,
            chunk_lengths: session.chunk_lengths(),
        })
    }

    /// Marks the session `Completed` and drops its staged chunks.
    pub fn finalize(&self, id: &str) -> Result<(), SessionError> {
        let slot = self.slot(id)?;
        {
            let mut session = slot.lock();
            session.finalize(Instant::now())?;
            slot.publish(session.status());
        }
        info!(session = %id, "session completed");
        self.retire(id);
        Ok(())
    }

    /// Marks the session `Failed` and drops its staged chunks.
    pub fn fail(&self, id: &str, message: &str) -> Result<(), SessionError> {
        let slot = self.slot(id)?;
        {
            let mut session = slot.lock();
            session.fail(message, Instant::now())?;
            slot.publish(session.status());
        }
        warn!(session = %id, error = %message, "session failed");
        self.retire(id);
        Ok(())
    }

    /// Removes the session immediately, whatever its state.
    pub fn cancel(&self, id: &str) -> Result<(), SessionError> {
        self.sweep();
        let slot = self
            .map()
            .remove(id)
            .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))?;
        {
            let mut session = slot.lock();
            if session.cancel() {
                slot.publish(session.status());
            }
        }
        self.discard_chunks(id);
        info!(session = %id, "session cancelled");
        Ok(())
    }

    /// Current status snapshot.
    pub fn status(&self, id: &str) -> Result<SessionStatusResponse, SessionError> {
        let slot = self.slot(id)?;
        let session = slot.lock();
        Ok(session.to_status())
    }

    /// Subscribes to status changes of one session.
    ///
    /// The sender is dropped when the session leaves the store, after the
    /// final status has been published.
    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<SessionStatus>, SessionError> {
        let slot = self.slot(id)?;
        Ok(slot.status_tx.subscribe())
    }

    /// Evicts expired sessions and terminal sessions past their grace
    /// window. Returns the number evicted.
    ///
    /// Sessions locked by another caller are in use and skipped, so a slow
    /// chunk write never holds up the rest of the store.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let slots: Vec<(String, Arc<SessionSlot>)> = self
            .map()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut evicted = Vec::new();
        for (id, slot) in slots {
            let Some(mut session) = slot.try_lock() else {
                continue;
            };
            if !self.is_evictable(&session, now) {
                continue;
            }
            {
                let mut map = self.map();
                if !map.get(&id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                    continue;
                }
                map.remove(&id);
            }

            if session.expire() {
                slot.publish(session.status());
                warn!(session = %id, "session expired");
            } else {
                debug!(session = %id, status = %session.status(), "session evicted");
            }
            drop(session);
            evicted.push(id);
        }

        for id in &evicted {
            self.discard_chunks(id);
        }
        evicted.len()
    }

    fn is_evictable(&self, session: &UploadSession, now: Instant) -> bool {
        match session.status() {
            SessionStatus::Created | SessionStatus::Uploading | SessionStatus::Completing => {
                session.is_expired(now)
            }
            _ => session
                .finished_at()
                .is_none_or(|at| now >= at + self.config.terminal_grace),
        }
    }

    /// Drops staged bytes of a finished session; removes the session now
    /// when there is no grace window.
    fn retire(&self, id: &str) {
        self.discard_chunks(id);
        if self.config.terminal_grace.is_zero() {
            self.map().remove(id);
        }
    }

    fn discard_chunks(&self, id: &str) {
        if let Err(e) = self.chunks.discard(id) {
            warn!(session = %id, error = %e, "failed to discard staged chunks");
        }
    }
}
