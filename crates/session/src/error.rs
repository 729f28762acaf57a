//! Session and collaborator error types.

use imgstash_protocol::{ErrorBody, ErrorKind, SessionStatus};
use imgstash_transfer::TransferError;

/// Errors reported by content, metadata and build collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("version mismatch for {0}")]
    VersionMismatch(String),

    /// A remote backend rejected the call.
    #[error("backend error ({status}): {message}")]
    Backend { status: u16, message: String },
}

/// Errors produced by the session server.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("session not found or expired: {0}")]
    SessionNotFound(String),

    #[error("chunk index {index} out of range (total {total})")]
    ChunkIndexOutOfRange { index: u32, total: u32 },

    #[error("chunk {index} length mismatch: expected {expected} bytes, got {received}")]
    ChunkLengthMismatch {
        index: u32,
        expected: u64,
        received: u64,
    },

    #[error("incomplete upload: received={received}, expected={expected}")]
    IncompleteUpload { received: u32, expected: u32 },

    #[error("session {id} is {status}")]
    InvalidState { id: String, status: SessionStatus },

    #[error("chunk {index} recorded {recorded} bytes but {buffered} are staged")]
    AssemblyMismatch {
        index: u32,
        recorded: u64,
        buffered: u64,
    },

    #[error("assembled {assembled} bytes but {declared} were declared")]
    SizeMismatch { declared: u64, assembled: u64 },

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Classifies the error for the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::ChunkIndexOutOfRange { .. }
            | Self::ChunkLengthMismatch { .. }
            | Self::IncompleteUpload { .. }
            | Self::InvalidState { .. } => ErrorKind::Validation,
            Self::PermissionDenied(_) => ErrorKind::Permission,
            Self::SessionNotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Store(StoreError::AlreadyExists(_)) => ErrorKind::Conflict,
            Self::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            Self::Store(StoreError::InvalidPath(_)) => ErrorKind::Validation,
            Self::Store(StoreError::Backend { status, .. }) => match ErrorKind::from_status(*status) {
                ErrorKind::TransientNetwork => ErrorKind::TransientNetwork,
                _ => ErrorKind::Internal,
            },
            Self::Transfer(TransferError::InvalidName(_)) => ErrorKind::Validation,
            Self::Store(_)
            | Self::Transfer(_)
            | Self::AssemblyMismatch { .. }
            | Self::SizeMismatch { .. }
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status for the error.
    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    /// User-facing payload, with chunk counts for incomplete uploads.
    pub fn to_body(&self) -> ErrorBody {
        let body = ErrorBody::new(self.kind(), self.to_string());
        match self {
            Self::IncompleteUpload { received, expected } => body.with_counts(*received, *expected),
            _ => body,
        }
    }
}

impl From<&SessionError> for ErrorBody {
    fn from(e: &SessionError) -> Self {
        e.to_body()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_upload_carries_counts() {
        let err = SessionError::IncompleteUpload {
            received: 2,
            expected: 3,
        };
        assert!(err.to_string().contains("received=2, expected=3"));

        let body = err.to_body();
        assert_eq!(body.status, 400);
        assert_eq!(body.received, Some(2));
        assert_eq!(body.expected, Some(3));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(SessionError::SessionNotFound("x".into()).status_code(), 404);
        assert_eq!(SessionError::Conflict("a.png".into()).status_code(), 409);
        assert_eq!(
            SessionError::Store(StoreError::AlreadyExists("a.png".into())).status_code(),
            409
        );
        assert_eq!(SessionError::PermissionDenied("guest".into()).status_code(), 403);
        assert_eq!(
            SessionError::SizeMismatch {
                declared: 1,
                assembled: 2
            }
            .status_code(),
            500
        );
        assert_eq!(
            SessionError::Transfer(TransferError::InvalidName("..".into())).status_code(),
            400
        );
    }

    #[test]
    fn backend_status_is_preserved_in_message() {
        let err = SessionError::Store(StoreError::Backend {
            status: 502,
            message: "bad gateway".into(),
        });
        assert_eq!(err.kind(), ErrorKind::TransientNetwork);
        assert!(err.to_body().message.contains("502"));

        let err = SessionError::Store(StoreError::Backend {
            status: 422,
            message: "sha mismatch".into(),
        });
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
