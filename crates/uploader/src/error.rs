//! Client-side upload error types.

use imgstash_protocol::{ErrorBody, ErrorKind};
use imgstash_transfer::TransferError;

/// Errors produced while uploading.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Retryable failure of a single request.
    #[error("transient error: {0}")]
    Transient(String),

    /// The server refused the request; retrying will not help.
    #[error("rejected ({status}): {message}")]
    Rejected {
        kind: ErrorKind,
        status: u16,
        message: String,
    },

    #[error("chunk {index} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        index: u32,
        attempts: u32,
        last_error: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("unsupported image type: {0}")]
    UnsupportedType(String),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("worker failed: {0}")]
    Worker(String),
}

impl UploadError {
    /// Whether the failed request may be sent again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Rejected { kind, .. } => *kind == ErrorKind::TransientNetwork,
            _ => false,
        }
    }

    /// Builds the client error for a server error payload.
    pub fn from_body(body: ErrorBody) -> Self {
        if body.kind == ErrorKind::TransientNetwork {
            return Self::Transient(body.message);
        }
        Self::Rejected {
            kind: body.kind,
            status: body.status,
            message: body.message,
        }
    }
}

impl From<ErrorBody> for UploadError {
    fn from(body: ErrorBody) -> Self {
        Self::from_body(body)
    }
}
