// rust/feed-core/src/db/lmdb.rs

//! LMDB-backed record databases.
//!
//! Records live in the `records` table keyed by a big-endian `u64` sequence
//! number, so key order is insertion order.

use std::ops::Bound;
use std::path::{Path, PathBuf};

use heed::byteorder::BigEndian;
use heed::types::{Bytes, U64};
use heed::{Env, EnvOpenOptions};

use super::Mode;
use crate::config::StorageConfig;
use crate::error::{FeedError, Result};

type Records = heed::Database<U64<BigEndian>, Bytes>;

const TABLE: &str = "records";

fn lmdb_error(path: &Path, action: &str, err: heed::Error) -> FeedError {
    FeedError::database(path, format!("{action}: {err}"))
}

pub struct LmdbDb {
    path: PathBuf,
    mode: Mode,
    env: Env,
    table: Records,
}

impl LmdbDb {
    /// Opens the environment directory at `path`. An environment can only be
    /// open once per process, so drop earlier handles before reopening.
    pub fn open(path: &Path, mode: Mode, storage: &StorageConfig) -> Result<Self> {
        if mode == Mode::Read {
            if !path.is_dir() {
                return Err(FeedError::database(path, "no LMDB environment at this path"));
            }
        } else {
            std::fs::create_dir_all(path).map_err(|e| {
                FeedError::database_with_source(path, "failed to create environment directory", e)
            })?;
        }

        // SAFETY: the environment is opened once per handle and never
        // concurrently truncated by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(storage.lmdb_map_size)
                .max_dbs(1)
                .open(path)
        }
        .map_err(|e| lmdb_error(path, "failed to open environment", e))?;

        let table = if mode == Mode::Read {
            let txn = env
                .read_txn()
                .map_err(|e| lmdb_error(path, "failed to begin read transaction", e))?;
            let table: Option<Records> = env
                .open_database(&txn, Some(TABLE))
                .map_err(|e| lmdb_error(path, "failed to open records table", e))?;
            let table = table.ok_or_else(|| FeedError::database(path, "database contains no records"))?;
            let empty = table
                .is_empty(&txn)
                .map_err(|e| lmdb_error(path, "failed to inspect records table", e))?;
            txn.commit()
                .map_err(|e| lmdb_error(path, "failed to end read transaction", e))?;
            if empty {
                return Err(FeedError::database(path, "database contains no records"));
            }
            table
        } else {
            let mut txn = env
                .write_txn()
                .map_err(|e| lmdb_error(path, "failed to begin write transaction", e))?;
            let table: Records = env
                .create_database(&mut txn, Some(TABLE))
                .map_err(|e| lmdb_error(path, "failed to create records table", e))?;
            if mode == Mode::New {
                table
                    .clear(&mut txn)
                    .map_err(|e| lmdb_error(path, "failed to clear records table", e))?;
            }
            txn.commit()
                .map_err(|e| lmdb_error(path, "failed to commit table creation", e))?;
            table
        };

        Ok(Self {
            path: path.to_path_buf(),
            mode,
            env,
            table,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> Result<LmdbCursor> {
        let mut cursor = LmdbCursor {
            path: self.path.clone(),
            env: self.env.clone(),
            table: self.table,
            key: None,
            value: Vec::new(),
        };
        cursor.seek_to_first()?;
        Ok(cursor)
    }

    pub fn writer(&self) -> Result<LmdbWriter> {
        if self.mode == Mode::Read {
            return Err(FeedError::database(&self.path, "database was opened read-only"));
        }
        let txn = self
            .env
            .read_txn()
            .map_err(|e| lmdb_error(&self.path, "failed to begin read transaction", e))?;
        let next_key = self
            .table
            .last(&txn)
            .map_err(|e| lmdb_error(&self.path, "failed to read last key", e))?
            .map_or(0, |(key, _)| key + 1);
        drop(txn);

        Ok(LmdbWriter {
            path: self.path.clone(),
            env: self.env.clone(),
            table: self.table,
            next_key,
            pending: Vec::new(),
        })
    }
}

/// Walks the records table. Each step runs in a short read transaction, so
/// the current value is copied out.
pub struct LmdbCursor {
    path: PathBuf,
    env: Env,
    table: Records,
    key: Option<u64>,
    value: Vec<u8>,
}

impl LmdbCursor {
    pub fn value(&self) -> &[u8] {
        if self.key.is_some() {
            &self.value
        } else {
            &[]
        }
    }

    pub fn valid(&self) -> bool {
        self.key.is_some()
    }

    pub fn next(&mut self) -> Result<()> {
        match self.key {
            Some(key) => self.load((Bound::Excluded(key), Bound::Unbounded)),
            None => Ok(()),
        }
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.load((Bound::Unbounded, Bound::Unbounded))
    }

    fn load(&mut self, range: (Bound<u64>, Bound<u64>)) -> Result<()> {
        let txn = self
            .env
            .read_txn()
            .map_err(|e| lmdb_error(&self.path, "failed to begin read transaction", e))?;
        let mut iter = self
            .table
            .range(&txn, &range)
            .map_err(|e| lmdb_error(&self.path, "failed to position cursor", e))?;
        match iter.next().transpose() {
            Ok(Some((key, value))) => {
                self.key = Some(key);
                self.value.clear();
                self.value.extend_from_slice(value);
            }
            Ok(None) => self.key = None,
            Err(e) => return Err(lmdb_error(&self.path, "failed to read record", e)),
        }
        Ok(())
    }
}

pub struct LmdbWriter {
    path: PathBuf,
    env: Env,
    table: Records,
    next_key: u64,
    pending: Vec<Vec<u8>>,
}

impl LmdbWriter {
    pub fn put(&mut self, value: &[u8]) -> Result<()> {
        self.pending.push(value.to_vec());
        Ok(())
    }

    /// Writes all pending records in one transaction.
    pub fn commit(self) -> Result<()> {
        let mut txn = self
            .env
            .write_txn()
            .map_err(|e| lmdb_error(&self.path, "failed to begin write transaction", e))?;
        for (offset, value) in self.pending.iter().enumerate() {
            let key = self.next_key + offset as u64;
            self.table
                .put(&mut txn, &key, value.as_slice())
                .map_err(|e| lmdb_error(&self.path, "failed to put record", e))?;
        }
        txn.commit()
            .map_err(|e| lmdb_error(&self.path, "failed to commit records", e))?;
        tracing::debug!(path = %self.path.display(), records = self.pending.len(), "committed records");
        Ok(())
    }
}
