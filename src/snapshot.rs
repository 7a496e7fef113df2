//! Backup destination storage
//!
//! A snapshot is a directory tree of JSON documents and file content,
//! addressed by `/`-separated logical paths such as
//! `mail/{user}/messages/{id}.json`. Large objects are written range by
//! range into a `.partial` file and renamed into place once complete.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{MigrationError, Result};
use crate::transfer::{ByteRange, ChunkSink};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const TOMBSTONES_FILE: &str = "tombstones.jsonl";

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store a JSON document
    async fn put_document(&self, path: &str, document: &Value) -> Result<()>;

    /// Store small content in one write
    async fn put_object(&self, path: &str, content: Bytes) -> Result<()>;

    /// Start a ranged write of `total_size` bytes
    async fn begin_object(&self, path: &str, total_size: u64) -> Result<()>;

    async fn write_range(&self, path: &str, range: ByteRange, chunk: Bytes) -> Result<()>;

    /// Publish a ranged write under its final path
    async fn finish_object(&self, path: &str) -> Result<()>;

    /// Record that an item was deleted at the source since the base snapshot
    async fn record_tombstone(&self, path: &str) -> Result<()>;
}

/// Snapshot stored as plain files under one directory
#[derive(Debug)]
pub struct FsSnapshotStore {
    root: PathBuf,
    tombstones: Mutex<()>,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tombstones: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a logical path to a file below the root
    ///
    /// Segments that could escape the root are replaced.
    pub fn resolve(&self, logical: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in logical.split('/').filter(|s| !s.is_empty()) {
            let cleaned: String = segment
                .chars()
                .map(|c| if c == '\\' || c == '\0' { '_' } else { c })
                .collect();
            let safe = match Path::new(&cleaned).components().next() {
                Some(Component::Normal(_)) if cleaned != "." && cleaned != ".." => cleaned,
                _ => "_".to_string(),
            };
            path.push(safe);
        }
        path
    }

    fn partial_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".partial");
        PathBuf::from(name)
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn put_document(&self, path: &str, document: &Value) -> Result<()> {
        let target = self.resolve(path);
        Self::ensure_parent(&target).await?;
        tokio::fs::write(&target, serde_json::to_vec_pretty(document)?).await?;
        Ok(())
    }

    async fn put_object(&self, path: &str, content: Bytes) -> Result<()> {
        let target = self.resolve(path);
        Self::ensure_parent(&target).await?;
        tokio::fs::write(&target, &content).await?;
        Ok(())
    }

    async fn begin_object(&self, path: &str, total_size: u64) -> Result<()> {
        let partial = Self::partial_path(&self.resolve(path));
        Self::ensure_parent(&partial).await?;
        let file = tokio::fs::File::create(&partial).await?;
        file.set_len(total_size).await?;
        debug!("Reserved {} bytes for {}", total_size, path);
        Ok(())
    }

    async fn write_range(&self, path: &str, range: ByteRange, chunk: Bytes) -> Result<()> {
        if chunk.len() as u64 != range.len() {
            return Err(MigrationError::StorageError(format!(
                "Chunk of {} bytes does not fill range {}-{}",
                chunk.len(),
                range.start,
                range.end
            )));
        }

        let partial = Self::partial_path(&self.resolve(path));
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&partial)
            .await
            .map_err(|e| MigrationError::StorageError(format!("{} not started: {}", path, e)))?;
        file.seek(SeekFrom::Start(range.start)).await?;
        file.write_all(&chunk).await?;
        file.flush().await?;
        Ok(())
    }

    async fn finish_object(&self, path: &str) -> Result<()> {
        let target = self.resolve(path);
        tokio::fs::rename(Self::partial_path(&target), &target).await?;
        Ok(())
    }

    async fn record_tombstone(&self, path: &str) -> Result<()> {
        let line = json!({ "path": path, "deleted_at": Utc::now() }).to_string();

        // One writer at a time keeps lines whole
        let _guard = self.tombstones.lock().await;
        tokio::fs::create_dir_all(&self.root).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(TOMBSTONES_FILE))
            .await?;
        file.write_all(format!("{}\n", line).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Writes transferred content into a snapshot
pub struct SnapshotSink {
    store: Arc<dyn SnapshotStore>,
    path: String,
}

impl SnapshotSink {
    pub fn new(store: Arc<dyn SnapshotStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }
}

#[async_trait]
impl ChunkSink for SnapshotSink {
    async fn put_small(&mut self, content: Bytes) -> Result<()> {
        self.store.put_object(&self.path, content).await
    }

    async fn begin(&mut self, total_size: u64) -> Result<()> {
        self.store.begin_object(&self.path, total_size).await
    }

    async fn put_chunk(&mut self, range: ByteRange, _total_size: u64, chunk: Bytes) -> Result<()> {
        self.store.write_range(&self.path, range, chunk).await
    }

    async fn finish(&mut self) -> Result<()> {
        self.store.finish_object(&self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{ChunkSource, ChunkedTransfer};
    use tempfile::TempDir;

    struct Pattern(u64);

    #[async_trait]
    impl ChunkSource for Pattern {
        fn total_size(&self) -> u64 {
            self.0
        }

        async fn read(&self, range: Option<ByteRange>) -> Result<Bytes> {
            let range = range.unwrap_or(ByteRange::new(0, self.0 - 1));
            Ok((range.start..=range.end).map(|i| (i % 251) as u8).collect())
        }
    }

    #[test]
    fn test_resolve_stays_under_root() {
        let store = FsSnapshotStore::new("/snap");
        assert_eq!(
            store.resolve("mail/user@contoso.com/messages/1.json"),
            PathBuf::from("/snap/mail/user@contoso.com/messages/1.json")
        );
        assert_eq!(store.resolve("../../etc/passwd"), PathBuf::from("/snap/_/_/etc/passwd"));
        assert_eq!(store.resolve("a\\..\\b"), PathBuf::from("/snap/a_.._b"));
    }

    #[tokio::test]
    async fn test_documents_and_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(dir.path());

        store
            .put_document("mail/u1/messages/m1.json", &json!({"subject": "hello"}))
            .await
            .unwrap();
        store.record_tombstone("files/d1/old.txt").await.unwrap();
        store.record_tombstone("files/d1/older.txt").await.unwrap();

        let doc = tokio::fs::read_to_string(dir.path().join("mail/u1/messages/m1.json"))
            .await
            .unwrap();
        assert!(doc.contains("hello"));

        let tombstones = tokio::fs::read_to_string(dir.path().join(TOMBSTONES_FILE))
            .await
            .unwrap();
        assert_eq!(tombstones.lines().count(), 2);
        assert!(tombstones.contains("files/d1/old.txt"));
    }

    #[tokio::test]
    async fn test_chunked_content_lands_intact() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn SnapshotStore> = Arc::new(FsSnapshotStore::new(dir.path()));
        let transfer = ChunkedTransfer {
            small_upload_limit: 1000,
            chunk_size: 1024,
        };

        let mut sink = SnapshotSink::new(store, "files/d1/big.bin");
        let written = transfer.transfer(&Pattern(5000), &mut sink).await.unwrap();
        assert_eq!(written, 5000);

        let content = tokio::fs::read(dir.path().join("files/d1/big.bin")).await.unwrap();
        assert_eq!(content.len(), 5000);
        assert!(content.iter().enumerate().all(|(i, b)| *b == (i as u64 % 251) as u8));
        assert!(!dir.path().join("files/d1/big.bin.partial").exists());
    }

    #[tokio::test]
    async fn test_manifest_written_at_root() {
        let dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(dir.path());
        store.put_document(MANIFEST_FILE, &json!({"job_id": "b1"})).await.unwrap();
        assert!(dir.path().join(MANIFEST_FILE).exists());
    }
}
