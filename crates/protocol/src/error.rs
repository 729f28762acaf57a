use serde::{Deserialize, Serialize};

/// Error taxonomy shared by both ends of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or missing request fields.
    Validation,
    /// Unknown or expired session.
    NotFound,
    /// Destination name already exists.
    Conflict,
    /// Retryable chunk-level failure.
    TransientNetwork,
    /// Auth or guest policy denial.
    Permission,
    /// Unexpected collaborator failure.
    Internal,
}

impl ErrorKind {
    /// HTTP status code reported for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Permission => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Internal => 500,
            Self::TransientNetwork => 503,
        }
    }

    /// Maps an HTTP status back to a kind (client side).
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 413 | 422 => Self::Validation,
            401 | 403 => Self::Permission,
            404 | 410 => Self::NotFound,
            409 => Self::Conflict,
            408 | 429 | 502 | 503 | 504 => Self::TransientNetwork,
            _ => Self::Internal,
        }
    }
}

/// User-facing error payload. Never carries internal stack traces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
    /// Chunks received so far, for incomplete-upload errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<u32>,
    /// Chunks expected, for incomplete-upload errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u32>,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: kind.status_code(),
            message: message.into(),
            received: None,
            expected: None,
        }
    }

    /// Attaches received/expected chunk counts.
    pub fn with_counts(mut self, received: u32, expected: u32) -> Self {
        self.received = Some(received);
        self.expected = Some(expected);
        self
    }
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}
