// rust/feed-core/src/db/mod.rs

//! Record databases.
//!
//! A database is an ordered sequence of opaque byte records. Every backend
//! exposes the same capabilities: open in a [`Mode`], walk the records with
//! a [`Cursor`] (`value`, `next`, `valid`, `seek_to_first`), and append
//! records with a [`DbWriter`]. The backend is chosen at configuration time.
//!
//! # Example
//!
//! ```
//! use feed_core::config::StorageConfig;
//! use feed_core::db::{Backend, Database, Mode};
//!
//! let storage = StorageConfig::default();
//! let db = Database::open(Backend::Memory, "mem://doc-example", Mode::New, &storage).unwrap();
//! let mut writer = db.writer().unwrap();
//! writer.put(b"first").unwrap();
//! writer.put(b"second").unwrap();
//! writer.commit().unwrap();
//!
//! let mut cursor = db.cursor().unwrap();
//! assert_eq!(cursor.value(), b"first");
//! cursor.next().unwrap();
//! assert_eq!(cursor.value(), b"second");
//! cursor.next().unwrap();
//! assert!(!cursor.valid());
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::error::{FeedError, Result};

#[cfg(feature = "lmdb")]
mod lmdb;
mod memory;
mod record_file;

#[cfg(feature = "lmdb")]
pub use lmdb::{LmdbCursor, LmdbDb, LmdbWriter};
pub use memory::{MemoryCursor, MemoryDb, MemoryWriter};
pub use record_file::{RecordFileCursor, RecordFileDb, RecordFileWriter};

/// Database backend type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Named in-process tables.
    Memory,
    /// Length-prefixed record file on the local filesystem.
    #[default]
    RecordFile,
    /// LMDB environment (requires the `lmdb` feature).
    Lmdb,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Memory => "memory",
            Backend::RecordFile => "record_file",
            Backend::Lmdb => "lmdb",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "record_file" | "record-file" | "recordfile" => Ok(Backend::RecordFile),
            "lmdb" => Ok(Backend::Lmdb),
            other => Err(FeedError::config(format!(
                "unknown database backend '{other}' (expected memory, record_file or lmdb)"
            ))),
        }
    }
}

/// How a database is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read existing records.
    Read,
    /// Append to an existing database, creating it if missing.
    Write,
    /// Create an empty database, discarding any existing one.
    New,
}

/// An open database.
pub enum Database {
    Memory(MemoryDb),
    RecordFile(RecordFileDb),
    #[cfg(feature = "lmdb")]
    Lmdb(LmdbDb),
}

impl Database {
    /// Opens the database at `path` with the given backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is missing or unreadable in `Read` mode,
    /// cannot be created otherwise, or the backend was not compiled in.
    pub fn open(
        backend: Backend,
        path: impl AsRef<Path>,
        mode: Mode,
        storage: &StorageConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        let db = match backend {
            Backend::Memory => Database::Memory(MemoryDb::open(path, mode)?),
            Backend::RecordFile => Database::RecordFile(RecordFileDb::open(path, mode, storage)?),
            #[cfg(feature = "lmdb")]
            Backend::Lmdb => Database::Lmdb(LmdbDb::open(path, mode, storage)?),
            #[cfg(not(feature = "lmdb"))]
            Backend::Lmdb => {
                return Err(FeedError::config(
                    "the lmdb backend requires building feed-core with the 'lmdb' feature",
                ))
            }
        };
        tracing::debug!(backend = %backend, path = %path.display(), ?mode, "opened database");
        Ok(db)
    }

    pub fn backend(&self) -> Backend {
        match self {
            Database::Memory(_) => Backend::Memory,
            Database::RecordFile(_) => Backend::RecordFile,
            #[cfg(feature = "lmdb")]
            Database::Lmdb(_) => Backend::Lmdb,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Database::Memory(db) => db.path(),
            Database::RecordFile(db) => db.path(),
            #[cfg(feature = "lmdb")]
            Database::Lmdb(db) => db.path(),
        }
    }

    /// Creates a cursor positioned on the first record.
    pub fn cursor(&self) -> Result<Cursor> {
        Ok(match self {
            Database::Memory(db) => Cursor::Memory(db.cursor()),
            Database::RecordFile(db) => Cursor::RecordFile(db.cursor()?),
            #[cfg(feature = "lmdb")]
            Database::Lmdb(db) => Cursor::Lmdb(db.cursor()?),
        })
    }

    /// Creates a writer appending to this database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database was opened in `Read` mode.
    pub fn writer(&self) -> Result<DbWriter> {
        Ok(match self {
            Database::Memory(db) => DbWriter::Memory(db.writer()?),
            Database::RecordFile(db) => DbWriter::RecordFile(db.writer()?),
            #[cfg(feature = "lmdb")]
            Database::Lmdb(db) => DbWriter::Lmdb(db.writer()?),
        })
    }
}

/// A position in a database's record sequence.
pub enum Cursor {
    Memory(MemoryCursor),
    RecordFile(RecordFileCursor),
    #[cfg(feature = "lmdb")]
    Lmdb(LmdbCursor),
}

impl Cursor {
    /// Bytes of the current record; empty when the cursor is not valid.
    pub fn value(&self) -> &[u8] {
        match self {
            Cursor::Memory(c) => c.value(),
            Cursor::RecordFile(c) => c.value(),
            #[cfg(feature = "lmdb")]
            Cursor::Lmdb(c) => c.value(),
        }
    }

    /// Advances to the next record.
    pub fn next(&mut self) -> Result<()> {
        match self {
            Cursor::Memory(c) => {
                c.next();
                Ok(())
            }
            Cursor::RecordFile(c) => c.next(),
            #[cfg(feature = "lmdb")]
            Cursor::Lmdb(c) => c.next(),
        }
    }

    /// Returns false once the cursor has moved past the last record.
    pub fn valid(&self) -> bool {
        match self {
            Cursor::Memory(c) => c.valid(),
            Cursor::RecordFile(c) => c.valid(),
            #[cfg(feature = "lmdb")]
            Cursor::Lmdb(c) => c.valid(),
        }
    }

    /// Moves back to the first record.
    pub fn seek_to_first(&mut self) -> Result<()> {
        match self {
            Cursor::Memory(c) => {
                c.seek_to_first();
                Ok(())
            }
            Cursor::RecordFile(c) => c.seek_to_first(),
            #[cfg(feature = "lmdb")]
            Cursor::Lmdb(c) => c.seek_to_first(),
        }
    }
}

/// Appends records to a database. Nothing is visible to readers until
/// [`DbWriter::commit`].
pub enum DbWriter {
    Memory(MemoryWriter),
    RecordFile(RecordFileWriter),
    #[cfg(feature = "lmdb")]
    Lmdb(LmdbWriter),
}

impl DbWriter {
    pub fn put(&mut self, value: &[u8]) -> Result<()> {
        match self {
            DbWriter::Memory(w) => {
                w.put(value);
                Ok(())
            }
            DbWriter::RecordFile(w) => w.put(value),
            #[cfg(feature = "lmdb")]
            DbWriter::Lmdb(w) => w.put(value),
        }
    }

    /// Makes every record put so far durable and visible.
    pub fn commit(self) -> Result<()> {
        match self {
            DbWriter::Memory(w) => {
                w.commit();
                Ok(())
            }
            DbWriter::RecordFile(w) => w.commit(),
            #[cfg(feature = "lmdb")]
            DbWriter::Lmdb(w) => w.commit(),
        }
    }
}
