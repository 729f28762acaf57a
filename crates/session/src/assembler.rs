//! Reassembly of staged chunks into one contiguous object.

use bytes::{Bytes, BytesMut};
use imgstash_transfer::ChunkStore;
use tracing::debug;

use crate::error::SessionError;

/// Snapshot taken when a session enters `Completing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionTicket {
    pub session_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub declared_size: u64,
    /// Recorded byte length per index, in index order.
    pub chunk_lengths: Vec<u64>,
}

/// An assembled object ready for publishing.
#[derive(Debug, Clone)]
pub struct AssembledObject {
    pub file_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

/// Concatenates staged chunks in index order.
pub struct Assembler<'a> {
    chunks: &'a dyn ChunkStore,
}

impl<'a> Assembler<'a> {
    pub fn new(chunks: &'a dyn ChunkStore) -> Self {
        Self { chunks }
    }

    /// Reads chunks `0..n` from staging into one buffer.
    ///
    /// Every staged chunk must have exactly its recorded length, and the
    /// total must equal the declared size.
    pub fn assemble(&self, ticket: &CompletionTicket) -> Result<AssembledObject, SessionError> {
        let total: u64 = ticket.chunk_lengths.iter().sum();
        let mut buf = BytesMut::with_capacity(total as usize);

        for (index, &recorded) in ticket.chunk_lengths.iter().enumerate() {
            let index = index as u32;
            let chunk = self
                .chunks
                .get(&ticket.session_id, index)?
                .ok_or(SessionError::AssemblyMismatch {
                    index,
                    recorded,
                    buffered: 0,
                })?;
            if chunk.len() as u64 != recorded {
                return Err(SessionError::AssemblyMismatch {
                    index,
                    recorded,
                    buffered: chunk.len() as u64,
                });
            }
            buf.extend_from_slice(&chunk);
        }

        if buf.len() as u64 != ticket.declared_size {
            return Err(SessionError::SizeMismatch {
                declared: ticket.declared_size,
                assembled: buf.len() as u64,
            });
        }

        debug!(
            session = %ticket.session_id,
            chunks = ticket.chunk_lengths.len(),
            size = buf.len(),
            "assembled"
        );
        Ok(AssembledObject {
            file_name: ticket.file_name.clone(),
            mime_type: ticket.mime_type.clone(),
            data: buf.freeze(),
        })
    }
}
