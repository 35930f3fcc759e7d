//! # Sluice Files
//!
//! File pipeline for Sluice.
//!
//! This crate provides:
//! - Chunk planning with a size-tiered chunk policy
//! - Byte sources for in-memory buffers and files
//! - A hash worker pool and the parallel content hasher
//! - UUID-shaped content ids derived from content
//! - Resumable upload records and the chunked upload session

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod content_id;
pub mod digest;
pub mod error;
pub mod hasher;
pub mod resume;
pub mod source;
pub mod upload;
pub mod worker;

pub use chunker::{Chunk, ChunkSizePolicy, FileChunker, SIZE_UNIT, plan_chunks};
pub use content_id::ContentId;
pub use digest::{Blake3, Digest};
pub use error::{FilesError, Result};
pub use hasher::{ContentHash, HasherConfig, ParallelHasher};
pub use resume::{JsonTaskStore, MemoryTaskStore, TaskStore, UploadRecord};
pub use source::{ByteSource, FileSource};
pub use upload::{ChunkMeta, Transport, UploadOutcome, UploadSession};
pub use worker::{MAX_HASH_WORKERS, PartialDigest, WorkerState};
