//! Directory-backed chunk transport.
//!
//! Each chunk lands in `<root>/<content-id>/<index>.part`. Writes go to a
//! temporary name first and are renamed into place, so a `.part` file is
//! either complete or absent.

use async_trait::async_trait;
use sluice_core::{CancelSignal, TaskError};
use sluice_files::upload::{ChunkMeta, Transport};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Writes chunks below a root directory
pub struct DirTransport {
    root: PathBuf,
}

impl DirTransport {
    /// Create a transport rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Final path of a chunk
    pub fn chunk_path(&self, meta: &ChunkMeta) -> PathBuf {
        self.root
            .join(meta.content_id.to_string())
            .join(format!("{}.part", meta.index))
    }

    async fn write(&self, bytes: &[u8], meta: &ChunkMeta) -> std::io::Result<()> {
        let target = self.chunk_path(meta);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let staging = target.with_extension("part.tmp");
        fs::write(&staging, bytes).await?;
        fs::rename(&staging, &target).await
    }
}

#[async_trait]
impl Transport for DirTransport {
    async fn send(
        &self,
        bytes: Vec<u8>,
        meta: ChunkMeta,
        cancel: CancelSignal,
    ) -> Result<(), TaskError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
            result = self.write(&bytes, &meta) => result.map_err(TaskError::from),
        }
    }
}
