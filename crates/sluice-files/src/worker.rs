//! Hash worker pool.
//!
//! A fixed set of named OS threads, each owning one running hash state per
//! job. Workers share no memory with each other or with the caller: input goes
//! in by value through a per-worker command channel and partial digests come
//! back through a shared reply channel.
//!
//! Message protocol per worker:
//!
//! ```text
//!   Init(partition) ──► Idle → Hashing ──┬──► Done(PartialDigest)
//!                                        └──► Error(message)
//! ```
//!
//! Every job carries an id. Replies from an aborted job that arrive late are
//! dropped, so one failed job never leaks into the next.

use crate::digest::Digest;
use crate::error::{FilesError, Result};
use crate::source::read_range;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::fs::File;
use std::marker::PhantomData;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Upper bound on hash workers
pub const MAX_HASH_WORKERS: usize = 16;

/// Bytes a worker hashes, in order
#[derive(Debug, Clone)]
pub enum PartitionInput {
    /// In-memory chunks
    Buffers(Vec<Vec<u8>>),
    /// Byte ranges of a file, read by the worker itself
    File {
        /// File to read
        path: PathBuf,
        /// Ranges to hash, in order
        ranges: Vec<Range<u64>>,
    },
}

impl PartitionInput {
    /// Total number of bytes in the partition
    pub fn byte_len(&self) -> u64 {
        match self {
            PartitionInput::Buffers(buffers) => buffers.iter().map(|b| b.len() as u64).sum(),
            PartitionInput::File { ranges, .. } => ranges.iter().map(|r| r.end - r.start).sum(),
        }
    }
}

/// Digest of one worker's partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialDigest {
    /// Index of the worker (and of its partition)
    pub worker_index: usize,
    /// Raw digest bytes
    pub digest: Vec<u8>,
}

impl PartialDigest {
    /// Lowercase hex rendering of the digest
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

/// Protocol state of a hash worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Waiting for a partition
    Idle = 0,
    /// Hashing a partition
    Hashing = 1,
    /// Last partition hashed successfully
    Done = 2,
    /// Last partition failed
    Error = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Hashing,
            2 => WorkerState::Done,
            3 => WorkerState::Error,
            _ => WorkerState::Idle,
        }
    }
}

enum Command {
    Init {
        job_id: u64,
        worker_index: usize,
        input: PartitionInput,
    },
    Shutdown,
}

enum Reply {
    Done {
        job_id: u64,
        partial: PartialDigest,
    },
    Error {
        job_id: u64,
        worker_index: usize,
        message: String,
    },
}

/// Pool of hash worker threads
pub struct HashWorkerPool<D: Digest> {
    workers: Vec<Worker>,
    reply_tx: Sender<Reply>,
    reply_rx: Receiver<Reply>,
    next_job: u64,
    _digest: PhantomData<fn() -> D>,
}

impl<D: Digest> HashWorkerPool<D> {
    /// Spawn a pool of `workers` threads (clamped to `1..=MAX_HASH_WORKERS`)
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] if a thread cannot be spawned.
    pub fn new(workers: usize) -> Result<Self> {
        let count = workers.clamp(1, MAX_HASH_WORKERS);
        info!("Creating hash worker pool with {} {} workers", count, D::NAME);

        let (reply_tx, reply_rx) = unbounded();
        let mut pool = Self {
            workers: Vec::with_capacity(count),
            reply_tx,
            reply_rx,
            next_job: 0,
            _digest: PhantomData,
        };

        for id in 0..count {
            let worker = Worker::spawn::<D>(id, pool.reply_tx.clone())?;
            pool.workers.push(worker);
        }

        Ok(pool)
    }

    /// Get the number of workers in the pool
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Current protocol state of every worker, by worker index
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers
            .iter()
            .map(|w| WorkerState::from_u8(w.state.load(Ordering::Acquire)))
            .collect()
    }

    /// Hash `partitions[i]` on worker `i` and wait for every partial digest
    ///
    /// Blocks the calling thread. The returned digests are in arrival order;
    /// callers sort by `worker_index`.
    ///
    /// # Errors
    ///
    /// - [`FilesError::HashWorker`] as soon as any worker fails; the other
    ///   partial digests of the job are discarded
    /// - [`FilesError::WorkerPool`] if there are more partitions than workers
    ///   or a worker is gone
    pub fn hash_partitions(&mut self, partitions: Vec<PartitionInput>) -> Result<Vec<PartialDigest>> {
        if partitions.len() > self.workers.len() {
            return Err(FilesError::worker_pool("more partitions than hash workers"));
        }

        let job_id = self.next_job;
        self.next_job += 1;
        let expected = partitions.len();

        debug!("Hash job {} dispatching {} partitions", job_id, expected);

        for (worker_index, input) in partitions.into_iter().enumerate() {
            self.workers[worker_index]
                .command_tx
                .send(Command::Init {
                    job_id,
                    worker_index,
                    input,
                })
                .map_err(|_| FilesError::worker_pool("hash worker is gone"))?;
        }

        let mut partials = Vec::with_capacity(expected);
        while partials.len() < expected {
            let reply = self
                .reply_rx
                .recv()
                .map_err(|_| FilesError::worker_pool("hash reply channel closed"))?;

            match reply {
                Reply::Done { job_id: id, partial } if id == job_id => partials.push(partial),
                Reply::Error {
                    job_id: id,
                    worker_index,
                    message,
                } if id == job_id => {
                    error!("Hash worker {} failed: {}", worker_index, message);
                    return Err(FilesError::HashWorker {
                        worker_index,
                        message,
                    });
                }
                _ => debug!("Dropping reply from aborted hash job"),
            }
        }

        Ok(partials)
    }

    /// Shut down all workers and wait for them to finish
    pub fn shutdown(self) {
        drop(self);
    }
}

impl<D: Digest> Drop for HashWorkerPool<D> {
    fn drop(&mut self) {
        info!(
            "Shutting down hash worker pool with {} workers",
            self.workers.len()
        );

        for worker in &self.workers {
            let _ = worker.command_tx.send(Command::Shutdown);
        }

        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if let Err(e) = handle.join() {
                    error!("Hash worker {} failed to join: {:?}", worker.id, e);
                }
            }
        }
    }
}

/// Individual worker thread
struct Worker {
    id: usize,
    command_tx: Sender<Command>,
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn<D: Digest>(id: usize, reply_tx: Sender<Reply>) -> Result<Self> {
        let (command_tx, command_rx) = unbounded::<Command>();
        let state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));
        let worker_state = Arc::clone(&state);

        let handle = thread::Builder::new()
            .name(format!("sluice-hash-{}", id))
            .spawn(move || {
                debug!("Hash worker {} starting", id);

                while let Ok(command) = command_rx.recv() {
                    let Command::Init {
                        job_id,
                        worker_index,
                        input,
                    } = command
                    else {
                        debug!("Hash worker {} received shutdown signal", id);
                        break;
                    };

                    worker_state.store(WorkerState::Hashing as u8, Ordering::Release);

                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| hash_input::<D>(input)))
                        .unwrap_or_else(|_| Err("hash worker panicked".to_string()));

                    let reply = match outcome {
                        Ok(digest) => {
                            worker_state.store(WorkerState::Done as u8, Ordering::Release);
                            Reply::Done {
                                job_id,
                                partial: PartialDigest {
                                    worker_index,
                                    digest,
                                },
                            }
                        }
                        Err(message) => {
                            worker_state.store(WorkerState::Error as u8, Ordering::Release);
                            Reply::Error {
                                job_id,
                                worker_index,
                                message,
                            }
                        }
                    };

                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }

                debug!("Hash worker {} stopped", id);
            })?;

        Ok(Self {
            id,
            command_tx,
            state,
            handle: Some(handle),
        })
    }
}

/// Feed one partition through a fresh hash state, in order
fn hash_input<D: Digest>(input: PartitionInput) -> std::result::Result<Vec<u8>, String> {
    let mut state = D::default();

    match input {
        PartitionInput::Buffers(buffers) => {
            for buffer in &buffers {
                state.update(buffer);
            }
        }
        PartitionInput::File { path, ranges } => {
            let mut file =
                File::open(&path).map_err(|e| format!("open {}: {}", path.display(), e))?;
            for range in ranges {
                let bytes = read_range(&mut file, range.clone()).map_err(|e| {
                    format!(
                        "read {}..{} of {}: {}",
                        range.start,
                        range.end,
                        path.display(),
                        e
                    )
                })?;
                state.update(&bytes);
            }
        }
    }

    Ok(state.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Blake3;
    use std::io::Write;

    #[test]
    fn test_pool_creation() {
        let pool = HashWorkerPool::<Blake3>::new(3).unwrap();
        assert_eq!(pool.num_workers(), 3);
        assert_eq!(pool.worker_states(), vec![WorkerState::Idle; 3]);
    }

    #[test]
    fn test_worker_count_clamped() {
        let pool = HashWorkerPool::<Blake3>::new(0).unwrap();
        assert_eq!(pool.num_workers(), 1);

        let pool = HashWorkerPool::<Blake3>::new(1000).unwrap();
        assert_eq!(pool.num_workers(), MAX_HASH_WORKERS);
    }

    #[test]
    fn test_partials_match_sequential_hash() {
        let mut pool = HashWorkerPool::<Blake3>::new(2).unwrap();
        let partitions = vec![
            PartitionInput::Buffers(vec![b"ab".to_vec(), b"cd".to_vec()]),
            PartitionInput::Buffers(vec![b"ef".to_vec()]),
        ];

        let mut partials = pool.hash_partitions(partitions).unwrap();
        partials.sort_by_key(|p| p.worker_index);

        assert_eq!(partials.len(), 2);
        assert_eq!(partials[0].digest, Blake3::digest(b"abcd"));
        assert_eq!(partials[1].digest, Blake3::digest(b"ef"));
        assert_eq!(pool.worker_states(), vec![WorkerState::Done; 2]);
    }

    #[test]
    fn test_file_partition() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let mut pool = HashWorkerPool::<Blake3>::new(1).unwrap();
        let partials = pool
            .hash_partitions(vec![PartitionInput::File {
                path: file.path().to_path_buf(),
                ranges: vec![0..4, 4..10],
            }])
            .unwrap();

        assert_eq!(partials[0].digest, Blake3::digest(b"0123456789"));
    }

    #[test]
    fn test_worker_error_fails_job() {
        let mut pool = HashWorkerPool::<Blake3>::new(2).unwrap();
        let partitions = vec![
            PartitionInput::Buffers(vec![b"fine".to_vec()]),
            PartitionInput::File {
                path: PathBuf::from("/nonexistent/sluice/chunk.bin"),
                ranges: vec![0..1],
            },
        ];

        let err = pool.hash_partitions(partitions).unwrap_err();
        assert!(matches!(err, FilesError::HashWorker { worker_index: 1, .. }));

        // A failed job does not poison the next one
        let partials = pool
            .hash_partitions(vec![PartitionInput::Buffers(vec![b"again".to_vec()])])
            .unwrap();
        assert_eq!(partials.len(), 1);
        assert_eq!(partials[0].digest, Blake3::digest(b"again"));
    }

    #[test]
    fn test_too_many_partitions() {
        let mut pool = HashWorkerPool::<Blake3>::new(1).unwrap();
        let partitions = vec![
            PartitionInput::Buffers(vec![b"a".to_vec()]),
            PartitionInput::Buffers(vec![b"b".to_vec()]),
        ];

        assert!(matches!(
            pool.hash_partitions(partitions),
            Err(FilesError::WorkerPool(_))
        ));
    }

    #[test]
    fn test_partition_byte_len() {
        let input = PartitionInput::Buffers(vec![vec![0; 3], vec![0; 5]]);
        assert_eq!(input.byte_len(), 8);

        let input = PartitionInput::File {
            path: PathBuf::from("unused"),
            ranges: vec![0..10, 10..15],
        };
        assert_eq!(input.byte_len(), 15);
    }
}
