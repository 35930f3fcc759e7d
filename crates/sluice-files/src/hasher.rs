//! Parallel content hashing.
//!
//! The chunk sequence of a source is split into `W` contiguous partitions,
//! one per hash worker. Worker `w` of `W` over `n` chunks covers
//! `[w*n/W, (w+1)*n/W)`; assignment depends on nothing but those three
//! numbers. Each worker emits one partial digest; the partials are ordered by
//! worker index, concatenated as raw bytes and hashed once more. The first 16
//! bytes of that digest become the [`ContentId`].
//!
//! ```text
//! chunks:   [0][1][2][3][4][5][6][7][8][9]
//!            └──w0──┘└──w1──┘└─w2─┘└─w3─┘      W = 4
//!               │       │      │     │
//!              d0      d1     d2    d3         partial digests
//!               └───────┴──┬───┴─────┘
//!                   H(d0‖d1‖d2‖d3)             combination
//!                          │
//!              xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx
//! ```
//!
//! The id is stable for identical bytes, chunk policy and worker count. A
//! different worker count changes the partitioning and therefore the id.
//!
//! # Example
//!
//! ```no_run
//! use sluice_files::hasher::{HasherConfig, ParallelHasher};
//!
//! let hasher: ParallelHasher = ParallelHasher::new(HasherConfig::default()).unwrap();
//! let hash = hasher.hash_file("/var/backups/archive.tar").unwrap();
//! println!("{} ({} chunks)", hash.content_id, hash.chunks.len());
//! ```

use crate::chunker::{Chunk, ChunkSizePolicy, FileChunker, plan_chunks};
use crate::content_id::ContentId;
use crate::digest::{Blake3, Digest};
use crate::error::{FilesError, Result};
use crate::source::{ByteSource, FileSource};
use crate::worker::{HashWorkerPool, MAX_HASH_WORKERS, PartialDigest, PartitionInput, WorkerState};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Hasher configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HasherConfig {
    /// Number of hash workers (clamped to `1..=MAX_HASH_WORKERS`)
    pub workers: usize,
    /// Chunk size policy
    pub chunk_policy: ChunkSizePolicy,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().clamp(1, MAX_HASH_WORKERS),
            chunk_policy: ChunkSizePolicy::Auto,
        }
    }
}

/// Result of hashing one source
#[derive(Debug, Clone)]
pub struct ContentHash {
    /// Content id derived from `digest`
    pub content_id: ContentId,
    /// Combined digest
    pub digest: Vec<u8>,
    /// Partial digests, ordered by worker index
    pub partials: Vec<PartialDigest>,
    /// Chunk plan the digest was computed over
    pub chunks: Vec<Chunk>,
    /// Chunk size in bytes
    pub chunk_size: u64,
    /// Total size in bytes
    pub total_size: u64,
}

impl ContentHash {
    /// Number of partitions (and workers) that took part
    pub fn workers(&self) -> usize {
        self.partials.len()
    }
}

/// Number of partitions for `chunk_count` chunks and `workers` workers
///
/// Never more partitions than chunks, so no partition is empty.
#[must_use]
pub fn effective_workers(chunk_count: usize, workers: usize) -> usize {
    workers.clamp(1, MAX_HASH_WORKERS).min(chunk_count).max(1)
}

/// Contiguous chunk index ranges, one per worker
///
/// Returns an empty list for zero chunks.
#[must_use]
pub fn partition_ranges(chunk_count: usize, workers: usize) -> Vec<Range<usize>> {
    if chunk_count == 0 {
        return Vec::new();
    }

    let w = effective_workers(chunk_count, workers);
    (0..w)
        .map(|i| (i * chunk_count / w)..((i + 1) * chunk_count / w))
        .collect()
}

/// Worker that owns `chunk_index`
#[must_use]
pub fn partition_of(chunk_index: usize, chunk_count: usize, workers: usize) -> usize {
    let w = effective_workers(chunk_count, workers);
    ((chunk_index + 1) * w - 1) / chunk_count.max(1)
}

/// Combine partial digests into the content digest
///
/// Sorted by worker index first; arrival order never matters.
///
/// # Errors
///
/// Returns [`FilesError::EmptyInput`] if there are no partials, or
/// [`FilesError::WorkerPool`] if worker indices are not exactly `0..n`.
pub fn combine<D: Digest>(mut partials: Vec<PartialDigest>) -> Result<(Vec<u8>, Vec<PartialDigest>)> {
    if partials.is_empty() {
        return Err(FilesError::EmptyInput);
    }

    partials.sort_by_key(|p| p.worker_index);
    if partials.iter().enumerate().any(|(i, p)| p.worker_index != i) {
        return Err(FilesError::worker_pool("partial digests are not contiguous"));
    }

    let mut state = D::default();
    for partial in &partials {
        state.update(&partial.digest);
    }

    Ok((state.finalize(), partials))
}

/// Multi-threaded content hasher
///
/// Owns its worker pool; the pool is shut down when the hasher is dropped.
/// Hash calls are serialized on the pool.
pub struct ParallelHasher<D: Digest = Blake3> {
    config: HasherConfig,
    pool: Mutex<HashWorkerPool<D>>,
}

impl<D: Digest> ParallelHasher<D> {
    /// Create a hasher and spawn its workers
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] if a worker thread cannot be spawned.
    pub fn new(config: HasherConfig) -> Result<Self> {
        Ok(Self {
            pool: Mutex::new(HashWorkerPool::new(config.workers)?),
            config,
        })
    }

    /// Create a hasher with `workers` workers and the auto chunk policy
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] if a worker thread cannot be spawned.
    pub fn with_workers(workers: usize) -> Result<Self> {
        Self::new(HasherConfig {
            workers,
            chunk_policy: ChunkSizePolicy::Auto,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &HasherConfig {
        &self.config
    }

    /// Protocol state of every worker
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.pool().worker_states()
    }

    fn pool(&self) -> MutexGuard<'_, HashWorkerPool<D>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hash a pre-chunked sequence of buffers
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::EmptyInput`] if there are no chunks or any chunk
    /// is empty, or [`FilesError::HashWorker`] if any worker fails.
    pub fn hash_chunks(&self, chunks: Vec<Vec<u8>>) -> Result<ContentHash> {
        if chunks.is_empty() || chunks.iter().any(Vec::is_empty) {
            return Err(FilesError::EmptyInput);
        }
        let total_size: u64 = chunks.iter().map(|c| c.len() as u64).sum();

        let mut plan = Vec::with_capacity(chunks.len());
        let mut offset = 0;
        for (index, chunk) in chunks.iter().enumerate() {
            plan.push(Chunk {
                index,
                offset,
                len: chunk.len() as u64,
            });
            offset += chunk.len() as u64;
        }
        let chunk_size = plan.iter().map(|c| c.len).max().unwrap_or(0);

        let ranges = partition_ranges(chunks.len(), self.config.workers);
        let mut chunks = chunks.into_iter();
        let partitions = ranges
            .iter()
            .map(|r| PartitionInput::Buffers(chunks.by_ref().take(r.len()).collect()))
            .collect();

        self.finish(partitions, plan, chunk_size, total_size)
    }

    /// Hash an in-memory buffer using the configured chunk policy
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::EmptyInput`] for an empty buffer, or
    /// [`FilesError::HashWorker`] if any worker fails.
    pub fn hash_bytes(&self, bytes: &[u8]) -> Result<ContentHash> {
        let total_size = bytes.len() as u64;
        let chunks = plan_chunks(total_size, self.config.chunk_policy)?;
        let chunk_size = self.config.chunk_policy.chunk_size(total_size);

        let partitions = partition_ranges(chunks.len(), self.config.workers)
            .into_iter()
            .map(|r| {
                PartitionInput::Buffers(
                    chunks[r]
                        .iter()
                        .map(|c| bytes[c.offset as usize..c.end() as usize].to_vec())
                        .collect(),
                )
            })
            .collect();

        self.finish(partitions, chunks, chunk_size, total_size)
    }

    /// Hash any byte source using the configured chunk policy
    ///
    /// File-backed sources are read by the workers themselves.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::EmptyInput`] for an empty source,
    /// [`FilesError::Io`] if slicing an in-memory source fails, or
    /// [`FilesError::HashWorker`] if any worker fails.
    pub fn hash_source(&self, source: &dyn ByteSource) -> Result<ContentHash> {
        let total_size = source.len();
        let chunker = FileChunker::for_source(total_size, self.config.chunk_policy);
        let chunks = chunker.chunks(total_size)?;

        let ranges = partition_ranges(chunks.len(), self.config.workers);
        let partitions = match source.path() {
            Some(path) => ranges
                .into_iter()
                .map(|r| PartitionInput::File {
                    path: path.to_path_buf(),
                    ranges: chunks[r].iter().map(Chunk::range).collect(),
                })
                .collect(),
            None => ranges
                .into_iter()
                .map(|r| {
                    chunks[r]
                        .iter()
                        .map(|c| source.slice(c.range()))
                        .collect::<std::io::Result<Vec<_>>>()
                        .map(PartitionInput::Buffers)
                })
                .collect::<std::io::Result<Vec<_>>>()?,
        };

        self.finish(partitions, chunks, chunker.chunk_size(), total_size)
    }

    /// Hash a file on disk using the configured chunk policy
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] if the file cannot be opened, plus the
    /// errors of [`ParallelHasher::hash_source`].
    pub fn hash_file<P: AsRef<Path>>(&self, path: P) -> Result<ContentHash> {
        let source = FileSource::open(path)?;
        self.hash_source(&source)
    }

    /// Hash a file on the blocking thread pool
    ///
    /// # Errors
    ///
    /// The errors of [`ParallelHasher::hash_file`], or
    /// [`FilesError::WorkerPool`] if the blocking task was aborted.
    pub async fn hash_file_async(self: Arc<Self>, path: PathBuf) -> Result<ContentHash> {
        tokio::task::spawn_blocking(move || self.hash_file(&path))
            .await
            .map_err(|e| FilesError::WorkerPool(e.to_string().into()))?
    }

    fn finish(
        &self,
        partitions: Vec<PartitionInput>,
        chunks: Vec<Chunk>,
        chunk_size: u64,
        total_size: u64,
    ) -> Result<ContentHash> {
        debug!(
            "Hashing {} bytes as {} chunks across {} {} workers",
            total_size,
            chunks.len(),
            partitions.len(),
            D::NAME
        );

        let partials = self.pool().hash_partitions(partitions)?;
        let (digest, partials) = combine::<D>(partials)?;
        let content_id = ContentId::from_digest(&digest)?;

        info!(
            "Computed content id {} ({} bytes, {} chunks, {} workers)",
            content_id,
            total_size,
            chunks.len(),
            partials.len()
        );

        Ok(ContentHash {
            content_id,
            digest,
            partials,
            chunks,
            chunk_size,
            total_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::SIZE_UNIT;
    use std::io::Write;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_partition_ranges() {
        assert_eq!(partition_ranges(10, 4), vec![0..2, 2..5, 5..7, 7..10]);
        assert_eq!(partition_ranges(3, 8), vec![0..1, 1..2, 2..3]);
        assert_eq!(partition_ranges(5, 1), vec![0..5]);
        assert!(partition_ranges(0, 4).is_empty());
    }

    #[test]
    fn test_partition_of_matches_ranges() {
        for n in 1..40 {
            for w in 1..20 {
                for (worker, range) in partition_ranges(n, w).into_iter().enumerate() {
                    for chunk in range {
                        assert_eq!(partition_of(chunk, n, w), worker, "n={n} w={w}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_combine_ignores_arrival_order() {
        let partials = vec![
            PartialDigest {
                worker_index: 1,
                digest: vec![2; 32],
            },
            PartialDigest {
                worker_index: 0,
                digest: vec![1; 32],
            },
        ];
        let mut reversed = partials.clone();
        reversed.reverse();

        let (a, _) = combine::<Blake3>(partials).unwrap();
        let (b, ordered) = combine::<Blake3>(reversed).unwrap();

        assert_eq!(a, b);
        assert_eq!(ordered[0].worker_index, 0);

        let mut concat = vec![1u8; 32];
        concat.extend_from_slice(&[2u8; 32]);
        assert_eq!(a, Blake3::digest(&concat));
    }

    #[test]
    fn test_combine_rejects_gaps() {
        let partials = vec![PartialDigest {
            worker_index: 1,
            digest: vec![0; 32],
        }];
        assert!(combine::<Blake3>(partials).is_err());
        assert!(matches!(
            combine::<Blake3>(Vec::new()),
            Err(FilesError::EmptyInput)
        ));
    }

    #[test]
    fn test_single_worker_hashes_its_digest() {
        let hasher = ParallelHasher::<Blake3>::with_workers(1).unwrap();
        let hash = hasher.hash_chunks(vec![b"abc".to_vec(), b"def".to_vec()]).unwrap();

        let partial = Blake3::digest(b"abcdef");
        assert_eq!(hash.partials[0].digest, partial);
        assert_eq!(hash.digest, Blake3::digest(&partial));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = ParallelHasher::<Blake3>::new(HasherConfig {
            workers: 4,
            chunk_policy: ChunkSizePolicy::Custom(1.0),
        })
        .unwrap();
        let data = sample(3 * SIZE_UNIT as usize + 123);

        let first = hasher.hash_bytes(&data).unwrap();
        let second = hasher.hash_bytes(&data).unwrap();

        assert_eq!(first.content_id, second.content_id);
        assert_eq!(first.chunks.len(), 4);
        assert_eq!(first.workers(), 4);
    }

    #[test]
    fn test_worker_count_changes_id() {
        let data = sample(4 * SIZE_UNIT as usize);
        let two = ParallelHasher::<Blake3>::with_workers(2).unwrap();
        let four = ParallelHasher::<Blake3>::with_workers(4).unwrap();

        assert_ne!(
            two.hash_bytes(&data).unwrap().content_id,
            four.hash_bytes(&data).unwrap().content_id
        );
    }

    #[test]
    fn test_workers_clamped_to_chunk_count() {
        let hasher = ParallelHasher::<Blake3>::with_workers(8).unwrap();
        let hash = hasher.hash_bytes(&sample(10)).unwrap();
        assert_eq!(hash.chunks.len(), 1);
        assert_eq!(hash.workers(), 1);
    }

    #[test]
    fn test_sources_agree() {
        let data = sample(2 * SIZE_UNIT as usize + 17);
        let hasher = ParallelHasher::<Blake3>::with_workers(3).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let from_bytes = hasher.hash_bytes(&data).unwrap();
        let from_vec = hasher.hash_source(&data).unwrap();
        let from_file = hasher.hash_file(file.path()).unwrap();

        assert_eq!(from_bytes.content_id, from_vec.content_id);
        assert_eq!(from_bytes.content_id, from_file.content_id);

        let chunks: Vec<Vec<u8>> = data.chunks(SIZE_UNIT as usize).map(<[u8]>::to_vec).collect();
        assert_eq!(hasher.hash_chunks(chunks).unwrap().content_id, from_bytes.content_id);
    }

    #[test]
    fn test_empty_input_rejected() {
        let hasher = ParallelHasher::<Blake3>::with_workers(2).unwrap();
        assert!(matches!(hasher.hash_bytes(&[]), Err(FilesError::EmptyInput)));
        assert!(matches!(hasher.hash_chunks(vec![]), Err(FilesError::EmptyInput)));
        assert!(matches!(
            hasher.hash_chunks(vec![Vec::new()]),
            Err(FilesError::EmptyInput)
        ));

        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            hasher.hash_file(file.path()),
            Err(FilesError::EmptyInput)
        ));
    }

    #[test]
    fn test_empty_chunk_rejected() {
        let hasher = ParallelHasher::<Blake3>::with_workers(2).unwrap();
        assert!(matches!(
            hasher.hash_chunks(vec![b"ab".to_vec(), Vec::new()]),
            Err(FilesError::EmptyInput)
        ));
        assert!(matches!(
            hasher.hash_chunks(vec![Vec::new(), b"cd".to_vec(), b"ef".to_vec()]),
            Err(FilesError::EmptyInput)
        ));
    }

    #[test]
    fn test_missing_file() {
        let hasher = ParallelHasher::<Blake3>::with_workers(1).unwrap();
        assert!(matches!(
            hasher.hash_file("/nonexistent/sluice/input.bin"),
            Err(FilesError::Io(_))
        ));
    }

    #[test]
    fn test_worker_states_after_hash() {
        let hasher = ParallelHasher::<Blake3>::with_workers(2).unwrap();
        assert!(hasher.worker_states().iter().all(|s| *s == WorkerState::Idle));

        hasher.hash_chunks(vec![vec![1; 10], vec![2; 10]]).unwrap();
        assert_eq!(hasher.worker_states(), vec![WorkerState::Done; 2]);
    }

    #[tokio::test]
    async fn test_hash_file_async() {
        let data = sample(1000);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let hasher = Arc::new(ParallelHasher::<Blake3>::with_workers(2).unwrap());
        let expected = hasher.hash_bytes(&data).unwrap();
        let hash = Arc::clone(&hasher)
            .hash_file_async(file.path().to_path_buf())
            .await
            .unwrap();

        assert_eq!(hash.content_id, expected.content_id);
        assert_eq!(hash.total_size, 1000);
    }
}
