//! Content store collaborator: where published images end up.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StoreError;

/// Boxed future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opaque identifier of one stored version of an object.
///
/// Required to delete the object later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct VersionToken(pub String);

impl VersionToken {
    /// SHA-256 hex digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object store that refuses silent overwrites.
pub trait ContentStore: Send + Sync {
    /// Whether an object exists at `path`.
    fn exists(&self, path: &str) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Stores `data` at `path`. Fails with [`StoreError::AlreadyExists`]
    /// if the path is taken.
    fn create(&self, path: &str, data: Bytes) -> BoxFuture<'_, Result<VersionToken, StoreError>>;

    /// Deletes the object at `path` if its version still matches.
    fn delete(&self, path: &str, version: &VersionToken) -> BoxFuture<'_, Result<(), StoreError>>;
}

// ---------------------------------------------------------------------------
// MemoryContentStore
// ---------------------------------------------------------------------------

/// In-memory content store.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    objects: Mutex<HashMap<String, (Bytes, VersionToken)>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored bytes at `path`.
    pub fn get(&self, path: &str) -> Option<Bytes> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.get(path).map(|(data, _)| data.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for MemoryContentStore {
    fn exists(&self, path: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let found = self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path);
        Box::pin(async move { Ok(found) })
    }

    fn create(&self, path: &str, data: Bytes) -> BoxFuture<'_, Result<VersionToken, StoreError>> {
        let path = path.to_string();
        Box::pin(async move {
            let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
            if objects.contains_key(&path) {
                return Err(StoreError::AlreadyExists(path));
            }
            let version = VersionToken::of(&data);
            objects.insert(path, (data, version.clone()));
            Ok(version)
        })
    }

    fn delete(&self, path: &str, version: &VersionToken) -> BoxFuture<'_, Result<(), StoreError>> {
        let path = path.to_string();
        let version = version.clone();
        Box::pin(async move {
            let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
            match objects.get(&path) {
                None => Err(StoreError::NotFound(path)),
                Some((_, current)) if *current != version => {
                    Err(StoreError::VersionMismatch(path))
                }
                Some(_) => {
                    objects.remove(&path);
                    Ok(())
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// FsContentStore
// ---------------------------------------------------------------------------

/// Stores objects as files under a root directory.
///
/// Object paths are single file names; anything that could escape the root
/// is rejected.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    /// Creates the store, creating `root` if needed.
    pub fn new(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        imgstash_transfer::validate_file_name(path)
            .map_err(|e| StoreError::InvalidPath(e.to_string()))?;
        Ok(self.root.join(path))
    }
}

impl ContentStore for FsContentStore {
    fn exists(&self, path: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let resolved = self.resolve(path);
        Box::pin(async move { Ok(tokio::fs::try_exists(resolved?).await?) })
    }

    fn create(&self, path: &str, data: Bytes) -> BoxFuture<'_, Result<VersionToken, StoreError>> {
        let name = path.to_string();
        let resolved = self.resolve(path);
        Box::pin(async move {
            let full = resolved?;
            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&full)
                .await
            {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(StoreError::AlreadyExists(name));
                }
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = async {
                file.write_all(&data).await?;
                file.sync_all().await
            }
            .await
            {
                // Never leave a truncated object behind.
                let _ = tokio::fs::remove_file(&full).await;
                return Err(e.into());
            }

            let version = VersionToken::of(&data);
            debug!(path = %full.display(), size = data.len(), "object stored");
            Ok(version)
        })
    }

    fn delete(&self, path: &str, version: &VersionToken) -> BoxFuture<'_, Result<(), StoreError>> {
        let name = path.to_string();
        let resolved = self.resolve(path);
        let version = version.clone();
        Box::pin(async move {
            let full = resolved?;
            let current = match tokio::fs::read(&full).await {
                Ok(data) => VersionToken::of(&data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::NotFound(name));
                }
                Err(e) => return Err(e.into()),
            };
            if current != version {
                return Err(StoreError::VersionMismatch(name));
            }
            tokio::fs::remove_file(&full).await?;
            Ok(())
        })
    }
}
