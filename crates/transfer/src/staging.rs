use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;

use crate::TransferError;
use crate::validation::validate_staging_key;

/// Server-side buffer for chunks awaiting assembly.
///
/// Keyed by session id and chunk index. A second `put` for the same key
/// replaces the previous bytes.
pub trait ChunkStore: Send + Sync {
    /// Stages `data` as chunk `index` of `session`.
    fn put(&self, session: &str, index: u32, data: Bytes) -> Result<(), TransferError>;

    /// Returns the staged bytes, or `None` if nothing is staged.
    fn get(&self, session: &str, index: u32) -> Result<Option<Bytes>, TransferError>;

    /// Drops everything staged for `session`.
    fn discard(&self, session: &str) -> Result<(), TransferError>;

    /// Number of chunks currently staged for `session`.
    fn staged_count(&self, session: &str) -> usize;
}

// ---------------------------------------------------------------------------
// MemoryChunkStore
// ---------------------------------------------------------------------------

/// Keeps staged chunks in process memory.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<HashMap<String, BTreeMap<u32, Bytes>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put(&self, session: &str, index: u32, data: Bytes) -> Result<(), TransferError> {
        let mut chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        chunks
            .entry(session.to_string())
            .or_default()
            .insert(index, data);
        Ok(())
    }

    fn get(&self, session: &str, index: u32) -> Result<Option<Bytes>, TransferError> {
        let chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(chunks.get(session).and_then(|c| c.get(&index)).cloned())
    }

    fn discard(&self, session: &str) -> Result<(), TransferError> {
        let mut chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        chunks.remove(session);
        Ok(())
    }

    fn staged_count(&self, session: &str) -> usize {
        let chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        chunks.get(session).map_or(0, BTreeMap::len)
    }
}

// ---------------------------------------------------------------------------
// DiskChunkStore
// ---------------------------------------------------------------------------

/// Writes each chunk to `<base>/<session>/<index>.part`.
///
/// Keeps large uploads out of process memory until assembly.
#[derive(Debug)]
pub struct DiskChunkStore {
    base_path: PathBuf,
}

impl DiskChunkStore {
    /// Creates a store rooted at `base_path`, creating the directory.
    pub fn new(base_path: &Path) -> Result<Self, TransferError> {
        std::fs::create_dir_all(base_path)?;
        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Returns the staging root.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn session_dir(&self, session: &str) -> Result<PathBuf, TransferError> {
        // Validate before joining to prevent directory traversal.
        validate_staging_key(session)?;
        Ok(self.base_path.join(session))
    }

    fn chunk_path(&self, session: &str, index: u32) -> Result<PathBuf, TransferError> {
        Ok(self.session_dir(session)?.join(format!("{index:06}.part")))
    }
}

impl ChunkStore for DiskChunkStore {
    fn put(&self, session: &str, index: u32, data: Bytes) -> Result<(), TransferError> {
        let path = self.chunk_path(session, index)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crashed write never leaves a short chunk
        // under the final name.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, session: &str, index: u32) -> Result<Option<Bytes>, TransferError> {
        let path = self.chunk_path(session, index)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn discard(&self, session: &str) -> Result<(), TransferError> {
        let dir = self.session_dir(session)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(session, dir = %dir.display(), "staged chunks discarded");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn staged_count(&self, session: &str) -> usize {
        let Ok(dir) = self.session_dir(session) else {
            return 0;
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        entries
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "part"))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn ChunkStore) {
        store.put("s1", 1, Bytes::from_static(b"world")).unwrap();
        store.put("s1", 0, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(store.staged_count("s1"), 2);
        assert_eq!(store.get("s1", 0).unwrap().unwrap(), &b"hello"[..]);
        assert_eq!(store.get("s1", 1).unwrap().unwrap(), &b"world"[..]);
        assert!(store.get("s1", 2).unwrap().is_none());
        assert!(store.get("other", 0).unwrap().is_none());

        // Re-put replaces.
        store.put("s1", 0, Bytes::from_static(b"HELLO")).unwrap();
        assert_eq!(store.staged_count("s1"), 2);
        assert_eq!(store.get("s1", 0).unwrap().unwrap(), &b"HELLO"[..]);

        store.discard("s1").unwrap();
        assert_eq!(store.staged_count("s1"), 0);
        assert!(store.get("s1", 0).unwrap().is_none());

        // Discarding an unknown session is a no-op.
        store.discard("never-seen").unwrap();
    }

    #[test]
    fn memory_store_roundtrip() {
        exercise(&MemoryChunkStore::new());
    }

    #[test]
    fn disk_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = DiskChunkStore::new(&dir.path().join("staging")).unwrap();
        exercise(&store);
    }

    #[test]
    fn disk_store_layout() {
        let dir = TempDir::new().unwrap();
        let store = DiskChunkStore::new(dir.path()).unwrap();
        store.put("abc123", 7, Bytes::from_static(b"x")).unwrap();
        assert!(dir.path().join("abc123").join("000007.part").exists());
    }

    #[test]
    fn disk_store_rejects_traversal_keys() {
        let dir = TempDir::new().unwrap();
        let store = DiskChunkStore::new(dir.path()).unwrap();
        for key in ["../escape", "a/b", "/tmp/evil", ""] {
            let result = store.put(key, 0, Bytes::from_static(b"evil"));
            assert!(
                matches!(result, Err(TransferError::InvalidName(_))),
                "{key:?} accepted"
            );
        }
    }
}
