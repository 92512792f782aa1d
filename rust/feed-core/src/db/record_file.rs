// rust/feed-core/src/db/record_file.rs

//! Record files on the local filesystem.
//!
//! Layout: the 8-byte magic `FEEDREC1`, then each record as a 4-byte
//! big-endian length followed by that many bytes. Files at or above the
//! configured threshold are memory-mapped; smaller ones are read through a
//! buffered reader.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::Mode;
use crate::config::StorageConfig;
use crate::error::{FeedError, Result};

const MAGIC: &[u8; 8] = b"FEEDREC1";
const HEADER_LEN: u64 = MAGIC.len() as u64;
const LENGTH_PREFIX: usize = 4;

/// A record file opened in some [`Mode`].
pub struct RecordFileDb {
    path: PathBuf,
    mode: Mode,
    buffer_size: usize,
    use_mmap: bool,
    mmap_threshold: u64,
}

impl RecordFileDb {
    /// Opens or creates the record file at `path`.
    ///
    /// # Errors
    ///
    /// In `Read` mode, fails if the file is missing, has a bad header, or
    /// holds no records. Otherwise fails if the file cannot be created.
    pub fn open(path: &Path, mode: Mode, storage: &StorageConfig) -> Result<Self> {
        let db = Self {
            path: path.to_path_buf(),
            mode,
            buffer_size: storage.buffer_size,
            use_mmap: storage.use_mmap,
            mmap_threshold: storage.mmap_threshold,
        };

        match mode {
            Mode::Read => {
                let size = db.check_header()?;
                if size == HEADER_LEN {
                    return Err(FeedError::database(path, "database contains no records"));
                }
            }
            Mode::Write => {
                if path.exists() {
                    db.check_header()?;
                } else {
                    db.create()?;
                }
            }
            Mode::New => db.create()?,
        }
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates a cursor positioned on the first record.
    pub fn cursor(&self) -> Result<RecordFileCursor> {
        let file = File::open(&self.path)
            .map_err(|e| FeedError::database_with_source(&self.path, "failed to open file", e))?;
        let size = file
            .metadata()
            .map_err(|e| {
                FeedError::database_with_source(&self.path, "failed to read file metadata", e)
            })?
            .len();

        let source = if self.use_mmap && size >= self.mmap_threshold {
            // SAFETY: the file is opened read-only and the map lives as long
            // as the cursor. Writers only append past the mapped length.
            let map = unsafe { Mmap::map(&file) }.map_err(|e| {
                FeedError::database_with_source(&self.path, "failed to memory-map file", e)
            })?;
            Source::Mapped {
                map,
                value: 0..0,
                next: HEADER_LEN as usize,
            }
        } else {
            Source::Buffered {
                reader: BufReader::with_capacity(self.buffer_size, file),
                value: Vec::new(),
                size,
            }
        };

        let mut cursor = RecordFileCursor {
            path: self.path.clone(),
            source,
            valid: false,
        };
        cursor.seek_to_first()?;
        Ok(cursor)
    }

    pub fn writer(&self) -> Result<RecordFileWriter> {
        if self.mode == Mode::Read {
            return Err(FeedError::database(&self.path, "database was opened read-only"));
        }
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                FeedError::database_with_source(&self.path, "failed to open file for append", e)
            })?;
        Ok(RecordFileWriter {
            path: self.path.clone(),
            writer: BufWriter::with_capacity(self.buffer_size, file),
            written: 0,
        })
    }

    /// Validates the magic header and returns the file size.
    fn check_header(&self) -> Result<u64> {
        let mut file = File::open(&self.path)
            .map_err(|e| FeedError::database_with_source(&self.path, "failed to open file", e))?;
        let mut magic = [0u8; MAGIC.len()];
        file.read_exact(&mut magic).map_err(|e| {
            FeedError::database_with_source(&self.path, "file is too short for a record header", e)
        })?;
        if &magic != MAGIC {
            return Err(FeedError::database(&self.path, "not a record file (bad magic)"));
        }
        file.metadata()
            .map(|meta| meta.len())
            .map_err(|e| FeedError::database_with_source(&self.path, "failed to read file metadata", e))
    }

    fn create(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    FeedError::database_with_source(parent, "failed to create parent directories", e)
                })?;
            }
        }
        let mut file = File::create(&self.path)
            .map_err(|e| FeedError::database_with_source(&self.path, "failed to create file", e))?;
        file.write_all(MAGIC)
            .and_then(|()| file.sync_all())
            .map_err(|e| FeedError::database_with_source(&self.path, "failed to write header", e))
    }
}

enum Source {
    Mapped {
        map: Mmap,
        value: Range<usize>,
        next: usize,
    },
    Buffered {
        reader: BufReader<File>,
        value: Vec<u8>,
        // File length when the cursor was created.
        size: u64,
    },
}

pub struct RecordFileCursor {
    path: PathBuf,
    source: Source,
    valid: bool,
}

impl RecordFileCursor {
    pub fn value(&self) -> &[u8] {
        if !self.valid {
            return &[];
        }
        match &self.source {
            Source::Mapped { map, value, .. } => &map[value.clone()],
            Source::Buffered { value, .. } => value,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn next(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        self.load_next()
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        match &mut self.source {
            Source::Mapped { next, .. } => *next = HEADER_LEN as usize,
            Source::Buffered { reader, .. } => {
                reader.seek(SeekFrom::Start(HEADER_LEN)).map_err(|e| {
                    FeedError::database_with_source(&self.path, "failed to seek to first record", e)
                })?;
            }
        }
        self.load_next()
    }

    fn load_next(&mut self) -> Result<()> {
        let loaded = match &mut self.source {
            Source::Mapped { map, value, next } => {
                let start = *next;
                if start + LENGTH_PREFIX > map.len() {
                    if start != map.len() {
                        return Err(truncated(&self.path));
                    }
                    false
                } else {
                    let mut prefix = [0u8; LENGTH_PREFIX];
                    prefix.copy_from_slice(&map[start..start + LENGTH_PREFIX]);
                    let begin = start + LENGTH_PREFIX;
                    let end = begin + u32::from_be_bytes(prefix) as usize;
                    if end > map.len() {
                        return Err(truncated(&self.path));
                    }
                    *value = begin..end;
                    *next = end;
                    true
                }
            }
            Source::Buffered { reader, value, size } => {
                let mut prefix = [0u8; LENGTH_PREFIX];
                match read_prefix(reader, &mut prefix) {
                    Ok(0) => false,
                    Ok(LENGTH_PREFIX) => {
                        let len = u64::from(u32::from_be_bytes(prefix));
                        let position = reader.stream_position().map_err(|e| {
                            FeedError::database_with_source(&self.path, "failed to read record", e)
                        })?;
                        if len > size.saturating_sub(position) {
                            return Err(truncated(&self.path));
                        }
                        value.resize(len as usize, 0);
                        if reader.read_exact(value).is_err() {
                            return Err(truncated(&self.path));
                        }
                        true
                    }
                    Ok(_) => return Err(truncated(&self.path)),
                    Err(e) => {
                        return Err(FeedError::database_with_source(
                            &self.path,
                            "failed to read record",
                            e,
                        ))
                    }
                }
            }
        };
        self.valid = loaded;
        Ok(())
    }

}

fn truncated(path: &Path) -> FeedError {
    FeedError::database(path, "record file is truncated")
}

/// Reads up to a full length prefix, returning how many bytes were read.
fn read_prefix(reader: &mut impl Read, prefix: &mut [u8; LENGTH_PREFIX]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub struct RecordFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl RecordFileWriter {
    pub fn put(&mut self, value: &[u8]) -> Result<()> {
        let len = u32::try_from(value.len()).map_err(|_| {
            FeedError::database(
                &self.path,
                format!("record of {} bytes exceeds the 4 GiB record limit", value.len()),
            )
        })?;
        self.writer
            .write_all(&len.to_be_bytes())
            .and_then(|()| self.writer.write_all(value))
            .map_err(|e| FeedError::database_with_source(&self.path, "failed to write record", e))?;
        self.written += 1;
        Ok(())
    }

    /// Flushes buffered records and syncs the file to disk.
    pub fn commit(mut self) -> Result<()> {
        self.writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_all())
            .map_err(|e| FeedError::database_with_source(&self.path, "failed to sync file", e))?;
        tracing::debug!(path = %self.path.display(), records = self.written, "committed records");
        Ok(())
    }
}
