use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use advisory_lock::{AdvisoryFileLock, FileLockMode};
use bytes::Bytes;
use thiserror::Error;

/// Largest accepted entry. Anything bigger is assumed to be corruption.
pub const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

const FRAME_HEADER_SIZE: usize = 8;

/// Errors returned by the log.
#[derive(Debug, Error)]
pub enum LogError {
    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the log file.
    #[error("log file {0} is locked by another process")]
    Locked(PathBuf),

    /// An entry exceeds [`MAX_ENTRY_SIZE`].
    #[error("entry of {size} bytes exceeds maximum {MAX_ENTRY_SIZE}")]
    EntryTooLarge {
        /// Size of the offending entry.
        size: usize,
    },

    /// A frame failed its checksum or is truncated.
    #[error("corrupt entry at offset {offset}: {reason}")]
    Corrupt {
        /// Byte offset of the bad frame.
        offset: u64,
        /// What went wrong.
        reason: String,
    },

    /// The log handle was already closed.
    #[error("log already closed")]
    Closed,
}

impl LogError {
    /// Whether this error denotes on-disk corruption (as opposed to an
    /// operational failure).
    pub fn is_corruption(&self) -> bool {
        matches!(self, LogError::Corrupt { .. })
    }
}

/// An append-only, CRC32-framed, advisory-locked log file.
pub struct Log {
    path: PathBuf,
    file: Option<File>,
    entries: usize,
}

impl Log {
    /// Open the log at `path`, creating it if absent, and take the
    /// exclusive advisory lock.
    ///
    /// The file is scanned on open so that [`Log::len`] is exact; a scan
    /// error is returned as corruption and leaves the handle unusable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        AdvisoryFileLock::try_lock(&file, FileLockMode::Exclusive)
            .map_err(|_| LogError::Locked(path.clone()))?;

        let mut log = Self {
            path,
            file: Some(file),
            entries: 0,
        };

        log.entries = log.iter()?.count_valid()?;

        Ok(log)
    }

    /// Create a fresh, truncated log at `path`. Used by repair to build the
    /// replacement file.
    pub(crate) fn create_at(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            path,
            file: Some(file),
            entries: 0,
        })
    }

    /// The path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries in the log.
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Whether the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Append an entry. The write lands in the page cache; call
    /// [`Log::sync`] to make it durable.
    pub fn append(&mut self, data: &[u8]) -> Result<(), LogError> {
        if data.len() > MAX_ENTRY_SIZE {
            return Err(LogError::EntryTooLarge { size: data.len() });
        }

        let file = self.file.as_mut().ok_or(LogError::Closed)?;

        let crc = crc32fast::hash(data);

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + data.len());
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
        frame.extend_from_slice(data);

        file.write_all(&frame)?;
        self.entries += 1;

        Ok(())
    }

    /// Flush buffered writes and fsync the file.
    pub fn sync(&mut self) -> Result<(), LogError> {
        let file = self.file.as_mut().ok_or(LogError::Closed)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// Iterate over the entries from the start of the file.
    pub fn iter(&self) -> Result<LogIter, LogError> {
        if self.file.is_none() {
            return Err(LogError::Closed);
        }

        let file = File::open(&self.path)?;

        Ok(LogIter {
            reader: BufReader::new(file),
            offset: 0,
        })
    }

    /// Whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Fsync and release the file. Further operations return
    /// [`LogError::Closed`].
    pub fn close(&mut self) -> Result<(), LogError> {
        if self.file.is_some() {
            self.sync()?;
            self.file = None;
        }

        Ok(())
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Iterator over the entries of a [`Log`].
///
/// Yields entries in append order; a truncated or checksum-failing frame
/// yields a [`LogError::Corrupt`] and ends the iteration.
pub struct LogIter {
    reader: BufReader<File>,
    offset: u64,
}

impl LogIter {
    pub(crate) fn from_reader(reader: BufReader<File>) -> Self {
        Self { reader, offset: 0 }
    }

    /// The byte offset the iterator has consumed up to, ie. the end of the
    /// last successfully decoded frame.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_entry(&mut self) -> Result<Option<Bytes>, LogError> {
        let frame_offset = self.offset;

        let mut header = [0; FRAME_HEADER_SIZE];
        match read_exact_or_eof(&mut self.reader, &mut header)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Partial => {
                return Err(LogError::Corrupt {
                    offset: frame_offset,
                    reason: "truncated frame header".to_string(),
                })
            }
            ReadOutcome::Full => {}
        }

        let crc = u32::from_be_bytes(header[..4].try_into().expect("4 bytes"));
        let len = u32::from_be_bytes(header[4..].try_into().expect("4 bytes")) as usize;

        if len > MAX_ENTRY_SIZE {
            return Err(LogError::Corrupt {
                offset: frame_offset,
                reason: format!("frame length {len} exceeds maximum"),
            });
        }

        let mut data = vec![0; len];
        match read_exact_or_eof(&mut self.reader, &mut data)? {
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::Partial => {
                return Err(LogError::Corrupt {
                    offset: frame_offset,
                    reason: "truncated frame data".to_string(),
                })
            }
        }

        if crc32fast::hash(&data) != crc {
            return Err(LogError::Corrupt {
                offset: frame_offset,
                reason: "checksum mismatch".to_string(),
            });
        }

        self.offset += (FRAME_HEADER_SIZE + len) as u64;

        Ok(Some(Bytes::from(data)))
    }

    fn count_valid(mut self) -> Result<usize, LogError> {
        let mut count = 0;
        while self.read_entry()?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

impl Iterator for LogIter {
    type Item = Result<Bytes, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_entry().transpose()
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 if filled == 0 => return Ok(ReadOutcome::Eof),
            0 => return Ok(ReadOutcome::Partial),
            n => filled += n,
        }
    }

    Ok(ReadOutcome::Full)
}
