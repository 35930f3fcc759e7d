//! Chunk planning.
//!
//! A source of known length is split into disjoint, contiguous, ordered
//! chunks. Only the last chunk may be shorter than the chunk size.
//!
//! Chunk size policy (unit = 1 MiB):
//!
//! | Policy            | Source size      | Chunk size        |
//! |-------------------|------------------|-------------------|
//! | `Custom(c)`, c>=1 | any              | `floor(c)` MiB    |
//! | `Custom(c)`, else | any              | 4 MiB             |
//! | `Auto`            | < 100 MiB        | 1 MiB             |
//! | `Auto`            | < 1 GiB          | 5 MiB             |
//! | `Auto`            | >= 1 GiB         | 10 MiB            |

use crate::error::{FilesError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Chunk size unit (1 MiB)
pub const SIZE_UNIT: u64 = 1024 * 1024;

/// Chunk size used when a custom size is present but unusable (4 MiB)
pub const FALLBACK_CHUNK_SIZE: u64 = 4 * SIZE_UNIT;

/// Sources below this size get 1 MiB chunks under `Auto`
pub const SMALL_SOURCE_LIMIT: u64 = 100 * SIZE_UNIT;

/// Sources below this size get 5 MiB chunks under `Auto`
pub const MEDIUM_SOURCE_LIMIT: u64 = 1024 * SIZE_UNIT;

/// How the chunk size is chosen
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum ChunkSizePolicy {
    /// Tiered by source size
    #[default]
    Auto,
    /// Custom size in units of [`SIZE_UNIT`]
    Custom(f64),
}

impl ChunkSizePolicy {
    /// Chunk size in bytes for a source of `total_size` bytes
    #[must_use]
    pub fn chunk_size(&self, total_size: u64) -> u64 {
        match *self {
            ChunkSizePolicy::Custom(units) if units.is_finite() && units >= 1.0 => {
                (units.floor() as u64).saturating_mul(SIZE_UNIT)
            }
            ChunkSizePolicy::Custom(_) => FALLBACK_CHUNK_SIZE,
            ChunkSizePolicy::Auto if total_size < SMALL_SOURCE_LIMIT => SIZE_UNIT,
            ChunkSizePolicy::Auto if total_size < MEDIUM_SOURCE_LIMIT => 5 * SIZE_UNIT,
            ChunkSizePolicy::Auto => 10 * SIZE_UNIT,
        }
    }
}

/// One contiguous byte range of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    /// Position in the chunk sequence
    pub index: usize,
    /// Byte offset in the source
    pub offset: u64,
    /// Length in bytes (never zero)
    pub len: u64,
}

impl Chunk {
    /// Byte range `[offset, offset + len)`
    #[must_use]
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.len
    }

    /// One past the last byte
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Chunk a source into fixed-size pieces
#[derive(Debug, Clone, Copy)]
pub struct FileChunker {
    chunk_size: u64,
}

impl FileChunker {
    /// Create a chunker with an explicit chunk size in bytes (at least 1)
    pub fn with_chunk_size(size: u64) -> Self {
        Self {
            chunk_size: size.max(1),
        }
    }

    /// Create a chunker for a source of `total_size` bytes
    pub fn for_source(total_size: u64, policy: ChunkSizePolicy) -> Self {
        Self::with_chunk_size(policy.chunk_size(total_size))
    }

    /// Get chunk size
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Calculate number of chunks for a source
    pub fn chunk_count(&self, total_size: u64) -> u64 {
        total_size.div_ceil(self.chunk_size)
    }

    /// Chunk `index` of a source, or `None` past the end
    pub fn chunk(&self, index: usize, total_size: u64) -> Option<Chunk> {
        let offset = (index as u64).checked_mul(self.chunk_size)?;
        if offset >= total_size {
            return None;
        }

        Some(Chunk {
            index,
            offset,
            len: self.chunk_size.min(total_size - offset),
        })
    }

    /// All chunks of a source, in order
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::EmptyInput`] if `total_size` is zero.
    pub fn chunks(&self, total_size: u64) -> Result<Vec<Chunk>> {
        if total_size == 0 {
            return Err(FilesError::EmptyInput);
        }

        let count = self.chunk_count(total_size) as usize;
        Ok((0..count)
            .filter_map(|index| self.chunk(index, total_size))
            .collect())
    }
}

/// Plan the chunks of a source under `policy`
///
/// # Errors
///
/// Returns [`FilesError::EmptyInput`] if `total_size` is zero.
pub fn plan_chunks(total_size: u64, policy: ChunkSizePolicy) -> Result<Vec<Chunk>> {
    FileChunker::for_source(total_size, policy).chunks(total_size)
}
