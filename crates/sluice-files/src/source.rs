//! Byte sources.
//!
//! A [`ByteSource`] is anything of known length that can hand out copies of
//! byte ranges: an in-memory buffer or a file on disk. Chunks are sliced on
//! demand, so a file source never has to be loaded as a whole.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Random-access source of bytes with a known length
pub trait ByteSource: Send + Sync {
    /// Total length in bytes
    fn len(&self) -> u64;

    /// Returns true if the source holds no bytes
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the bytes in `range`
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the range is out of bounds, or the error of
    /// the underlying read.
    fn slice(&self, range: Range<u64>) -> io::Result<Vec<u8>>;

    /// Backing file, if any
    ///
    /// File-backed sources let hash workers open the file themselves instead
    /// of receiving copies of every chunk.
    fn path(&self) -> Option<&Path> {
        None
    }
}

fn check_range(range: &Range<u64>, len: u64) -> io::Result<()> {
    if range.start > range.end || range.end > len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "range {}..{} out of bounds for source of {} bytes",
                range.start, range.end, len
            ),
        ));
    }
    Ok(())
}

fn slice_bytes(bytes: &[u8], range: Range<u64>) -> io::Result<Vec<u8>> {
    check_range(&range, bytes.len() as u64)?;
    Ok(bytes[range.start as usize..range.end as usize].to_vec())
}

impl ByteSource for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn slice(&self, range: Range<u64>) -> io::Result<Vec<u8>> {
        slice_bytes(self, range)
    }
}

impl ByteSource for Arc<[u8]> {
    fn len(&self) -> u64 {
        self.as_ref().len() as u64
    }

    fn slice(&self, range: Range<u64>) -> io::Result<Vec<u8>> {
        slice_bytes(self, range)
    }
}

/// File on disk, sliced with positioned reads
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Open a file source
    ///
    /// The length is captured once; the file should not change while in use.
    ///
    /// # Examples
    /// ```no_run
    /// use sluice_files::source::{ByteSource, FileSource};
    ///
    /// let source = FileSource::open("/var/backups/archive.tar").unwrap();
    /// let header = source.slice(0..512).unwrap();
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        Ok(Self {
            path,
            len: metadata.len(),
        })
    }

    /// File name, or the full path if it has none
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn slice(&self, range: Range<u64>) -> io::Result<Vec<u8>> {
        check_range(&range, self.len)?;
        read_range(&mut File::open(&self.path)?, range)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Read exactly `range` from an open file
pub(crate) fn read_range(file: &mut File, range: Range<u64>) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; (range.end - range.start) as usize];
    file.seek(SeekFrom::Start(range.start))?;
    file.read_exact(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_vec_source() {
        let source: Vec<u8> = (0..=255u8).collect();
        assert_eq!(ByteSource::len(&source), 256);
        assert_eq!(source.slice(10..14).unwrap(), vec![10, 11, 12, 13]);
        assert!(source.path().is_none());
    }

    #[test]
    fn test_arc_source() {
        let source: Arc<[u8]> = Arc::from(vec![1u8, 2, 3].into_boxed_slice());
        assert_eq!(ByteSource::len(&source), 3);
        assert_eq!(source.slice(1..3).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_out_of_bounds() {
        let source = vec![0u8; 8];
        let err = source.slice(4..9).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_file_source() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello, chunked world").unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.len(), 20);
        assert!(!source.is_empty());
        assert_eq!(source.slice(7..14).unwrap(), b"chunked");
        assert_eq!(source.path(), Some(file.path()));
    }

    #[test]
    fn test_file_source_missing() {
        let err = FileSource::open("/nonexistent/sluice/input.bin").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_file_source_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileSource::open(dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
