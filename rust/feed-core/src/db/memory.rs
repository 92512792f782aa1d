// rust/feed-core/src/db/memory.rs

//! In-process record tables, addressed by name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use super::Mode;
use crate::error::{FeedError, Result};

type Table = Arc<RwLock<Vec<Arc<[u8]>>>>;

static TABLES: OnceLock<Mutex<HashMap<PathBuf, Table>>> = OnceLock::new();

fn tables() -> &'static Mutex<HashMap<PathBuf, Table>> {
    TABLES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A named table of records living for the rest of the process.
pub struct MemoryDb {
    path: PathBuf,
    mode: Mode,
    table: Table,
}

impl MemoryDb {
    pub fn open(path: &Path, mode: Mode) -> Result<Self> {
        let mut tables = tables().lock();
        let table = match mode {
            Mode::Read => {
                let table = tables
                    .get(path)
                    .cloned()
                    .ok_or_else(|| FeedError::database(path, "no in-memory database with this name"))?;
                if table.read().is_empty() {
                    return Err(FeedError::database(path, "database contains no records"));
                }
                table
            }
            Mode::Write => tables.entry(path.to_path_buf()).or_default().clone(),
            Mode::New => {
                let table = Table::default();
                tables.insert(path.to_path_buf(), table.clone());
                table
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            table,
        })
    }

    /// Drops the named table. Open handles keep their records.
    pub fn remove(path: impl AsRef<Path>) -> bool {
        tables().lock().remove(path.as_ref()).is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cursor(&self) -> MemoryCursor {
        let mut cursor = MemoryCursor {
            table: self.table.clone(),
            index: 0,
            current: None,
        };
        cursor.seek_to_first();
        cursor
    }

    pub fn writer(&self) -> Result<MemoryWriter> {
        if self.mode == Mode::Read {
            return Err(FeedError::database(&self.path, "database was opened read-only"));
        }
        Ok(MemoryWriter {
            table: self.table.clone(),
            pending: Vec::new(),
        })
    }
}

pub struct MemoryCursor {
    table: Table,
    index: usize,
    current: Option<Arc<[u8]>>,
}

impl MemoryCursor {
    pub fn value(&self) -> &[u8] {
        self.current.as_deref().unwrap_or(&[])
    }

    pub fn next(&mut self) {
        self.index += 1;
        self.load();
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn seek_to_first(&mut self) {
        self.index = 0;
        self.load();
    }

    fn load(&mut self) {
        self.current = self.table.read().get(self.index).cloned();
    }
}

pub struct MemoryWriter {
    table: Table,
    pending: Vec<Arc<[u8]>>,
}

impl MemoryWriter {
    pub fn put(&mut self, value: &[u8]) {
        self.pending.push(Arc::from(value));
    }

    pub fn commit(self) {
        self.table.write().extend(self.pending);
    }
}
