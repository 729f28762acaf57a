//! Metadata, build trigger and access policy collaborators.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{BoxFuture, VersionToken};
use crate::error::StoreError;

/// Durable record of one published image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub file_name: String,
    pub path: String,
    pub size: u64,
    pub mime_type: String,
    pub version: VersionToken,
    pub uploaded_at: DateTime<Utc>,
}

/// Durable image metadata store.
pub trait MetadataStore: Send + Sync {
    fn insert(&self, record: ImageRecord) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Removes the record for `path`. Missing records are not an error.
    fn remove(&self, path: &str) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Keeps image records in memory.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: Mutex<Vec<ImageRecord>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records, oldest first.
    pub fn records(&self) -> Vec<ImageRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn insert(&self, record: ImageRecord) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            if records.iter().any(|r| r.path == record.path) {
                return Err(StoreError::AlreadyExists(record.path));
            }
            records.push(record);
            Ok(())
        })
    }

    fn remove(&self, path: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let path = path.to_string();
        Box::pin(async move {
            self.records
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|r| r.path != path);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Build trigger
// ---------------------------------------------------------------------------

/// Why a site rebuild is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildReason {
    Published { path: String },
    Deleted { paths: Vec<String> },
}

/// Fire-and-forget notification that published content changed.
pub trait BuildTrigger: Send + Sync {
    fn notify(&self, reason: BuildReason) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Build trigger that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBuildTrigger;

impl BuildTrigger for NoopBuildTrigger {
    fn notify(&self, _reason: BuildReason) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async { Ok(()) })
    }
}

// ---------------------------------------------------------------------------
// Access policy
// ---------------------------------------------------------------------------

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    User(String),
    Guest,
}

impl std::fmt::Display for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(name) => write!(f, "user:{name}"),
            Self::Guest => f.write_str("guest"),
        }
    }
}

/// Gate checked before a session is created or a whole upload accepted.
pub trait AccessPolicy: Send + Sync {
    fn may_create_session(&self, caller: &Caller) -> bool;
}

/// Authenticated users may always upload; guests only when allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestPolicy {
    pub allow_guests: bool,
}

impl AccessPolicy for GuestPolicy {
    fn may_create_session(&self, caller: &Caller) -> bool {
        match caller {
            Caller::User(_) => true,
            Caller::Guest => self.allow_guests,
        }
    }
}
