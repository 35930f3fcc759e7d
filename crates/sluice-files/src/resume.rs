//! Resumable upload records
//!
//! An [`UploadRecord`] remembers which chunks of a content id were already
//! delivered, so an interrupted upload restarts with only the missing ones.
//! Records are kept behind the [`TaskStore`] trait:
//! - [`JsonTaskStore`] writes one pretty-printed JSON file per content id
//! - [`MemoryTaskStore`] keeps records in process, for tests and one-shot runs

use crate::content_id::ContentId;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Upload progress of one content id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Content id of the uploaded bytes
    pub content_id: ContentId,

    /// Display name of the source
    pub file_name: String,

    /// Source path, if file-backed
    pub file_path: Option<PathBuf>,

    /// Source size in bytes
    pub file_size: u64,

    /// Chunk size used for this upload
    pub chunk_size: u64,

    /// Total number of chunks
    pub total_chunks: usize,

    /// Delivered chunks (chunk indices)
    pub completed_chunks: BTreeSet<usize>,

    /// Last active timestamp (seconds since epoch)
    pub last_active: u64,

    /// Record creation timestamp
    pub created_at: u64,
}

impl UploadRecord {
    /// Create a record with no delivered chunks
    pub fn new(
        content_id: ContentId,
        file_name: impl Into<String>,
        file_path: Option<PathBuf>,
        file_size: u64,
        chunk_size: u64,
    ) -> Self {
        let total_chunks = file_size.div_ceil(chunk_size.max(1)) as usize;
        let now = unix_now();

        Self {
            content_id,
            file_name: file_name.into(),
            file_path,
            file_size,
            chunk_size,
            total_chunks,
            completed_chunks: BTreeSet::new(),
            last_active: now,
            created_at: now,
        }
    }

    /// Mark a chunk as delivered
    pub fn mark_chunk_complete(&mut self, chunk_index: usize) {
        if chunk_index < self.total_chunks {
            self.completed_chunks.insert(chunk_index);
        }
        self.update_last_active();
    }

    /// Mark multiple chunks as delivered
    pub fn mark_chunks_complete(&mut self, chunk_indices: &[usize]) {
        for &index in chunk_indices {
            if index < self.total_chunks {
                self.completed_chunks.insert(index);
            }
        }
        self.update_last_active();
    }

    /// Check if a chunk was delivered
    pub fn is_chunk_complete(&self, chunk_index: usize) -> bool {
        self.completed_chunks.contains(&chunk_index)
    }

    /// Chunks still to deliver, in index order
    pub fn missing_chunks(&self) -> Vec<usize> {
        (0..self.total_chunks)
            .filter(|i| !self.completed_chunks.contains(i))
            .collect()
    }

    /// Progress percentage
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.completed_chunks.len() as f64 / self.total_chunks as f64) * 100.0
    }

    /// Check if every chunk was delivered
    pub fn is_complete(&self) -> bool {
        self.completed_chunks.len() == self.total_chunks
    }

    /// Update last active timestamp
    pub fn update_last_active(&mut self) {
        self.last_active = unix_now();
    }

    /// Delivered chunks as a bitmap (bit `i % 8` of byte `i / 8`)
    pub fn chunk_bitmap(&self) -> Vec<u8> {
        let mut bitmap = vec![0u8; self.total_chunks.div_ceil(8)];
        for &chunk_index in &self.completed_chunks {
            bitmap[chunk_index / 8] |= 1 << (chunk_index % 8);
        }
        bitmap
    }

    /// Replace the delivered set from a bitmap, ignoring bits past the end
    pub fn restore_bitmap(&mut self, bitmap: &[u8]) {
        self.completed_chunks.clear();

        for (byte_index, &byte) in bitmap.iter().enumerate() {
            for bit_index in 0..8 {
                let chunk_index = byte_index * 8 + bit_index;
                if byte & (1 << bit_index) != 0 && chunk_index < self.total_chunks {
                    self.completed_chunks.insert(chunk_index);
                }
            }
        }
    }
}

/// Persistence for upload records
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace a record
    async fn save(&self, record: &UploadRecord) -> Result<()>;

    /// Load the record of a content id
    async fn load(&self, content_id: &ContentId) -> Result<Option<UploadRecord>>;

    /// All stored records
    async fn list(&self) -> Result<Vec<UploadRecord>>;

    /// Delete the record of a content id (no-op if absent)
    async fn delete(&self, content_id: &ContentId) -> Result<()>;
}

/// In-process record store
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    records: RwLock<HashMap<ContentId, UploadRecord>>,
}

impl MemoryTaskStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save(&self, record: &UploadRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.content_id, record.clone());
        Ok(())
    }

    async fn load(&self, content_id: &ContentId) -> Result<Option<UploadRecord>> {
        Ok(self.records.read().await.get(content_id).cloned())
    }

    async fn list(&self) -> Result<Vec<UploadRecord>> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn delete(&self, content_id: &ContentId) -> Result<()> {
        self.records.write().await.remove(content_id);
        Ok(())
    }
}

/// JSON-file record store, one `<content-id>.json` per record
pub struct JsonTaskStore {
    /// State directory
    state_dir: PathBuf,

    /// In-memory record cache
    cache: RwLock<HashMap<ContentId, UploadRecord>>,

    /// Maximum age of record files (in seconds)
    max_age: u64,
}

impl JsonTaskStore {
    /// Create a store rooted at `state_dir`
    pub fn new(state_dir: PathBuf, max_age_days: u64) -> Self {
        Self {
            state_dir,
            cache: RwLock::new(HashMap::new()),
            max_age: max_age_days.saturating_mul(24 * 60 * 60),
        }
    }

    /// Create the state directory
    ///
    /// # Errors
    ///
    /// Returns [`crate::FilesError::Io`] if the directory cannot be created.
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        Ok(())
    }

    /// State directory
    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    /// Remove records that were not active for longer than the maximum age
    ///
    /// Returns the number of removed records.
    ///
    /// # Errors
    ///
    /// Returns [`crate::FilesError::Io`] if the directory cannot be read or a
    /// stale file cannot be removed.
    pub async fn cleanup_stale(&self) -> Result<usize> {
        let now = unix_now();
        let mut removed = Vec::new();

        for (path, record) in self.read_all().await? {
            if now.saturating_sub(record.last_active) > self.max_age {
                fs::remove_file(&path).await?;
                removed.push(record.content_id);
            }
        }

        if !removed.is_empty() {
            let mut cache = self.cache.write().await;
            for content_id in &removed {
                cache.remove(content_id);
            }
            info!("Removed {} stale upload records", removed.len());
        }

        Ok(removed.len())
    }

    async fn read_all(&self) -> Result<Vec<(PathBuf, UploadRecord)>> {
        let mut records = Vec::new();
        let mut entries = match fs::read_dir(&self.state_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            let parsed = fs::read_to_string(&path)
                .await
                .map_err(crate::FilesError::from)
                .and_then(|json| serde_json::from_str::<UploadRecord>(&json).map_err(Into::into));
            match parsed {
                Ok(record) => records.push((path, record)),
                Err(e) => warn!("Skipping unreadable upload record {}: {}", path.display(), e),
            }
        }

        Ok(records)
    }

    fn record_path(&self, content_id: &ContentId) -> PathBuf {
        self.state_dir.join(format!("{}.json", content_id))
    }
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn save(&self, record: &UploadRecord) -> Result<()> {
        self.cache
            .write()
            .await
            .insert(record.content_id, record.clone());

        let json = serde_json::to_string_pretty(record)?;
        fs::write(self.record_path(&record.content_id), json).await?;

        debug!(
            "Saved upload record {} ({}/{} chunks)",
            record.content_id,
            record.completed_chunks.len(),
            record.total_chunks
        );
        Ok(())
    }

    async fn load(&self, content_id: &ContentId) -> Result<Option<UploadRecord>> {
        if let Some(record) = self.cache.read().await.get(content_id) {
            return Ok(Some(record.clone()));
        }

        let json = match fs::read_to_string(self.record_path(content_id)).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: UploadRecord = serde_json::from_str(&json)?;

        self.cache.write().await.insert(*content_id, record.clone());
        Ok(Some(record))
    }

    async fn list(&self) -> Result<Vec<UploadRecord>> {
        let mut records: Vec<_> = self.read_all().await?.into_iter().map(|(_, r)| r).collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn delete(&self, content_id: &ContentId) -> Result<()> {
        self.cache.write().await.remove(content_id);

        match fs::remove_file(self.record_path(content_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
