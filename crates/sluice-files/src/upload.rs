//! Resumable chunked uploads.
//!
//! [`UploadSession::prepare`] plans and hashes a source, looks up the upload
//! record of the resulting content id and builds a [`Scheduler`] over the
//! chunks that were not delivered yet. [`UploadSession::run`] pushes those
//! chunks through a [`Transport`], recording every delivered chunk as it
//! lands. A fully delivered upload has its record deleted.
//!
//! ```text
//!   source ──► plan + hash ──► content id ──► store.load(id)
//!                                                  │
//!                                      missing chunks only
//!                                                  ▼
//!                  Scheduler ──► slice ──► Transport::send ──► record.mark
//! ```

use crate::chunker::Chunk;
use crate::content_id::ContentId;
use crate::digest::Digest;
use crate::error::{FilesError, Result};
use crate::hasher::{ContentHash, ParallelHasher};
use crate::resume::{TaskStore, UploadRecord};
use crate::source::ByteSource;
use async_trait::async_trait;
use sluice_core::{CancelSignal, RunReport, Scheduler, SchedulerConfig, Task, TaskError};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What a transport needs to know about a chunk besides its bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    /// Content id of the whole upload
    pub content_id: ContentId,
    /// Chunk index
    pub index: usize,
    /// Byte offset in the source
    pub offset: u64,
    /// Total number of chunks
    pub total_chunks: usize,
    /// Total size of the source
    pub total_size: u64,
    /// Display name of the source
    pub file_name: String,
}

/// Delivers chunk bytes somewhere
///
/// Implementations should watch `cancel` and return
/// [`TaskError::Cancelled`] once it fires. Transient failures are
/// [`TaskError::Failed`] (retried), permanent ones [`TaskError::Fatal`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one chunk
    async fn send(
        &self,
        bytes: Vec<u8>,
        meta: ChunkMeta,
        cancel: CancelSignal,
    ) -> std::result::Result<(), TaskError>;
}

/// Result of an upload run
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Content id of the upload
    pub content_id: ContentId,
    /// Chunks delivered by this session, in index order
    pub delivered: Vec<usize>,
    /// Chunks that exhausted their retries
    pub failed: Vec<Task<Chunk>>,
    /// Chunks already delivered by an earlier session
    pub resumed: usize,
    /// True once every chunk of the source was delivered
    pub complete: bool,
}

/// One resumable upload of one source
pub struct UploadSession {
    hash: ContentHash,
    file_name: String,
    resumed: usize,
    source: Arc<dyn ByteSource>,
    store: Arc<dyn TaskStore>,
    record: Arc<Mutex<UploadRecord>>,
    scheduler: Scheduler<Chunk, usize>,
}

impl UploadSession {
    /// Hash `source`, consult `store` and queue the chunks still missing
    ///
    /// Hashing runs on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// - [`FilesError::EmptyInput`] for an empty source
    /// - hashing errors, see [`ParallelHasher::hash_source`]
    /// - record store errors
    pub async fn prepare<D: Digest>(
        source: Arc<dyn ByteSource>,
        file_name: impl Into<String>,
        hasher: Arc<ParallelHasher<D>>,
        store: Arc<dyn TaskStore>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let file_name = file_name.into();
        config.validate()?;

        let hash = {
            let source = Arc::clone(&source);
            tokio::task::spawn_blocking(move || hasher.hash_source(source.as_ref()))
                .await
                .map_err(|e| FilesError::WorkerPool(e.to_string().into()))??
        };

        let record = match store.load(&hash.content_id).await? {
            Some(record)
                if record.file_size == hash.total_size
                    && record.chunk_size == hash.chunk_size
                    && record.total_chunks == hash.chunks.len() =>
            {
                info!(
                    "Resuming upload {} ({}/{} chunks already delivered)",
                    hash.content_id,
                    record.completed_chunks.len(),
                    record.total_chunks
                );
                record
            }
            existing => {
                if existing.is_some() {
                    warn!(
                        "Upload record {} does not match the source layout, starting over",
                        hash.content_id
                    );
                }
                UploadRecord::new(
                    hash.content_id,
                    file_name.clone(),
                    source.path().map(|p| p.to_path_buf()),
                    hash.total_size,
                    hash.chunk_size,
                )
            }
        };
        store.save(&record).await?;

        let resumed = record.completed_chunks.len();
        let missing: Vec<Chunk> = hash
            .chunks
            .iter()
            .filter(|c| !record.is_chunk_complete(c.index))
            .copied()
            .collect();

        debug!(
            "Upload {} queued {} of {} chunks",
            hash.content_id,
            missing.len(),
            hash.chunks.len()
        );

        Ok(Self {
            scheduler: Scheduler::new(missing, config),
            hash,
            file_name,
            resumed,
            source,
            store,
            record: Arc::new(Mutex::new(record)),
        })
    }

    /// Content id of the source
    pub fn content_id(&self) -> ContentId {
        self.hash.content_id
    }

    /// Hash of the source
    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    /// Scheduler driving the chunk uploads, for pause/resume/clear and progress
    pub fn scheduler(&self) -> &Scheduler<Chunk, usize> {
        &self.scheduler
    }

    /// Chunks queued by this session
    pub fn pending_chunks(&self) -> usize {
        self.scheduler.total()
    }

    /// Chunks delivered by earlier sessions
    pub fn resumed_chunks(&self) -> usize {
        self.resumed
    }

    /// Snapshot of the upload record
    pub async fn record(&self) -> UploadRecord {
        self.record.lock().await.clone()
    }

    /// Persist the current record, e.g. after pausing
    ///
    /// # Errors
    ///
    /// Returns the record store error.
    pub async fn save_progress(&self) -> Result<()> {
        let record = self.record.lock().await;
        self.store.save(&record).await
    }

    /// Upload all queued chunks through `transport`
    ///
    /// # Errors
    ///
    /// Scheduler errors ([`sluice_core::SchedulerError::Cleared`],
    /// [`sluice_core::SchedulerError::ErrorBudgetExceeded`]) and record
    /// store errors. Chunks that exhausted their retries are reported in
    /// [`UploadOutcome::failed`], not as an error.
    pub async fn run(&self, transport: Arc<dyn Transport>) -> Result<UploadOutcome> {
        info!(
            "Uploading {} ({} chunks, {} already delivered)",
            self.hash.content_id,
            self.pending_chunks(),
            self.resumed
        );

        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);
        let record = Arc::clone(&self.record);
        let content_id = self.hash.content_id;
        let total_chunks = self.hash.chunks.len();
        let total_size = self.hash.total_size;
        let file_name = self.file_name.clone();

        let report = self
            .scheduler
            .run(move |chunk: Chunk, cancel: CancelSignal| {
                let source = Arc::clone(&source);
                let store = Arc::clone(&store);
                let record = Arc::clone(&record);
                let transport = Arc::clone(&transport);
                let meta = ChunkMeta {
                    content_id,
                    index: chunk.index,
                    offset: chunk.offset,
                    total_chunks,
                    total_size,
                    file_name: file_name.clone(),
                };

                async move {
                    if cancel.is_cancelled() {
                        return Err(TaskError::Cancelled);
                    }

                    let bytes = tokio::task::spawn_blocking(move || source.slice(chunk.range()))
                        .await
                        .map_err(|e| TaskError::failed(e.to_string()))??;

                    transport.send(bytes, meta, cancel).await?;

                    let mut record = record.lock().await;
                    record.mark_chunk_complete(chunk.index);
                    if let Err(e) = store.save(&record).await {
                        warn!("Failed to save upload record {}: {}", content_id, e);
                    }

                    Ok(chunk.index)
                }
            })
            .await?;

        self.finish(report).await
    }

    /// Re-submit chunks that failed in a previous run
    ///
    /// # Errors
    ///
    /// The errors of [`UploadSession::run`].
    pub async fn retry(&self, failed: Vec<Task<Chunk>>) -> Result<UploadOutcome> {
        info!("Retrying {} chunks of {}", failed.len(), self.hash.content_id);
        let report = self.scheduler.retry_tasks(failed).await?;
        self.finish(report).await
    }

    async fn finish(&self, report: RunReport<Chunk, usize>) -> Result<UploadOutcome> {
        let delivered: Vec<usize> = report.results.iter().filter_map(|r| r.clone().ok()).collect();

        let record = self.record.lock().await;
        let complete = record.is_complete();
        if complete {
            self.store.delete(&record.content_id).await?;
            info!("Upload {} complete", record.content_id);
        } else {
            self.store.save(&record).await?;
            warn!(
                "Upload {} incomplete: {} chunks failed, {}/{} delivered",
                record.content_id,
                report.error_tasks.len(),
                record.completed_chunks.len(),
                record.total_chunks
            );
        }

        Ok(UploadOutcome {
            content_id: record.content_id,
            delivered,
            failed: report.error_tasks,
            resumed: self.resumed,
            complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkSizePolicy, SIZE_UNIT};
    use crate::digest::Blake3;
    use crate::hasher::HasherConfig;
    use crate::resume::MemoryTaskStore;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Collects chunks in memory, optionally failing some indices
    #[derive(Default)]
    struct MemoryTransport {
        received: StdMutex<BTreeMap<usize, Vec<u8>>>,
        failing: StdMutex<HashSet<usize>>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(
            &self,
            bytes: Vec<u8>,
            meta: ChunkMeta,
            _cancel: CancelSignal,
        ) -> std::result::Result<(), TaskError> {
            if self.failing.lock().unwrap().contains(&meta.index) {
                return Err(TaskError::failed("503 Service Unavailable"));
            }
            self.received.lock().unwrap().insert(meta.index, bytes);
            Ok(())
        }
    }

    fn sample(len: usize) -> Arc<dyn ByteSource> {
        Arc::new((0..len).map(|i| (i % 253) as u8).collect::<Vec<u8>>())
    }

    fn hasher() -> Arc<ParallelHasher<Blake3>> {
        Arc::new(
            ParallelHasher::new(HasherConfig {
                workers: 2,
                chunk_policy: ChunkSizePolicy::Custom(1.0),
            })
            .unwrap(),
        )
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_max_concurrent_tasks(3)
            .with_max_retries(1)
            .with_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_full_upload() {
        let source = sample(3 * SIZE_UNIT as usize + 10);
        let store = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(MemoryTransport::default());

        let session = UploadSession::prepare(source.clone(), "blob", hasher(), store.clone(), config())
            .await
            .unwrap();
        assert_eq!(session.pending_chunks(), 4);

        let outcome = session.run(transport.clone()).await.unwrap();
        assert!(outcome.complete);
        assert_eq!(outcome.delivered, vec![0, 1, 2, 3]);
        assert!(outcome.failed.is_empty());

        let received = transport.received.lock().unwrap();
        let joined: Vec<u8> = received.values().flatten().copied().collect();
        assert_eq!(joined, source.slice(0..source.len()).unwrap());

        // Completed uploads leave no record behind
        assert!(store.load(&outcome.content_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_uploads_only_missing_chunks() {
        let source = sample(4 * SIZE_UNIT as usize);
        let store = Arc::new(MemoryTaskStore::new());

        let flaky = Arc::new(MemoryTransport::default());
        flaky.failing.lock().unwrap().extend([1, 3]);

        let first = UploadSession::prepare(source.clone(), "blob", hasher(), store.clone(), config())
            .await
            .unwrap();
        let outcome = first.run(flaky.clone()).await.unwrap();

        assert!(!outcome.complete);
        assert_eq!(outcome.delivered, vec![0, 2]);
        let mut failed: Vec<usize> = outcome.failed.iter().map(|t| t.data.index).collect();
        failed.sort_unstable();
        assert_eq!(failed, vec![1, 3]);

        let record = store.load(&outcome.content_id).await.unwrap().unwrap();
        assert_eq!(record.missing_chunks(), vec![1, 3]);

        // A new session over the same bytes picks up the record
        let healthy = Arc::new(MemoryTransport::default());
        let second = UploadSession::prepare(source, "blob", hasher(), store.clone(), config())
            .await
            .unwrap();
        assert_eq!(second.content_id(), first.content_id());
        assert_eq!(second.pending_chunks(), 2);
        assert_eq!(second.resumed_chunks(), 2);

        let outcome = second.run(healthy.clone()).await.unwrap();
        assert!(outcome.complete);
        assert_eq!(outcome.resumed, 2);
        assert_eq!(
            healthy.received.lock().unwrap().keys().copied().collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[tokio::test]
    async fn test_retry_failed_chunks() {
        let source = sample(2 * SIZE_UNIT as usize);
        let store = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(MemoryTransport::default());
        transport.failing.lock().unwrap().insert(0);

        let session = UploadSession::prepare(source, "blob", hasher(), store, config())
            .await
            .unwrap();
        let outcome = session.run(transport.clone()).await.unwrap();
        assert_eq!(outcome.failed.len(), 1);

        transport.failing.lock().unwrap().clear();
        let outcome = session.retry(outcome.failed).await.unwrap();

        assert!(outcome.complete);
        assert_eq!(outcome.delivered, vec![0, 1]);
        assert!(session.record().await.is_complete());
    }

    #[tokio::test]
    async fn test_empty_source_rejected() {
        let result = UploadSession::prepare(
            sample(0),
            "empty",
            hasher(),
            Arc::new(MemoryTaskStore::new()),
            config(),
        )
        .await;

        assert!(matches!(result, Err(FilesError::EmptyInput)));
    }
}
