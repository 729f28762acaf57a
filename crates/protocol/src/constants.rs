use std::time::Duration;

/// Default chunk size: 4 MiB.
///
/// Stays under the per-request body limits of common hosting platforms
/// while keeping the request count for large images low.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Objects smaller than this are sent as a single request.
pub const DEFAULT_SMALL_OBJECT_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Inactivity window after which a session expires.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(10 * 60);

/// How long a completed or failed session stays queryable.
pub const DEFAULT_TERMINAL_GRACE: Duration = Duration::from_secs(30);

/// Chunks in flight per upload.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Retries per chunk before the upload fails.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay of the linear retry backoff.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Largest accepted object: 100 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Upper bound on chunks per session.
pub const DEFAULT_MAX_CHUNKS: u32 = 10_000;
