//! # engine
//!
//! why: give the adapters one ordered key-value contract to persist through
//! relations: wrapped by log_store.rs and state_machine.rs
//! what: KvEngine trait, BatchOp, MemoryEngine, FileEngine

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use raft_core::StorageError;
use serde::{Deserialize, Serialize};

/// One mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl BatchOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Ordered key-value store with atomic batches.
///
/// Handles are cheap to clone and share one underlying store, so the log
/// storage and the state machine of a node can live in the same engine under
/// different key prefixes.
pub trait KvEngine: Clone + Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Apply every op or none of them.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError>;

    /// Pairs with `start <= key < end`, in key order.
    fn scan(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.write_batch(vec![BatchOp::put(key, value)])
    }
}

type Table = BTreeMap<String, Vec<u8>>;

fn apply_ops(table: &mut Table, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                table.insert(key, value);
            }
            BatchOp::Delete { key } => {
                table.remove(&key);
            }
        }
    }
}

fn scan_table(table: &Table, start: &str, end: &str) -> Vec<(String, Vec<u8>)> {
    if start >= end {
        return Vec::new();
    }
    table
        .range::<str, _>((std::ops::Bound::Included(start), std::ops::Bound::Excluded(end)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn lock(table: &Mutex<Table>) -> Result<MutexGuard<'_, Table>, StorageError> {
    table.lock().map_err(|_| StorageError::Poisoned)
}

// -- memory engine --

/// In-memory engine, shared between clones. Nothing survives the process,
/// but a clone kept by a test survives a node restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    table: Arc<Mutex<Table>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvEngine for MemoryEngine {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(lock(&self.table)?.get(key).cloned())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        apply_ops(&mut *lock(&self.table)?, ops);
        Ok(())
    }

    fn scan(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(scan_table(&*lock(&self.table)?, start, end))
    }
}

// -- file engine --

/// On-disk layout of a file engine.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DataFile {
    version: u32,
    entries: Table,
}

const DATA_FILE: &str = "data.json";
const TEMP_FILE: &str = "data.tmp";
const FORMAT_VERSION: u32 = 1;

/// file-backed engine
///
/// Keeps the table in memory and rewrites `data.json` in the given directory
/// on every batch: write a temp file, fsync it, rename it over the old one.
/// A crash leaves either the old or the new table, never a mix.
#[derive(Debug, Clone)]
pub struct FileEngine {
    dir: PathBuf,
    table: Arc<Mutex<Table>>,
}

impl FileEngine {
    /// Open the engine in `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io("creating data directory", e))?;
        let table = load_table(&dir.join(DATA_FILE))?;
        Ok(Self {
            dir,
            table: Arc::new(Mutex::new(table)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn persist(&self, table: &Table) -> Result<(), StorageError> {
        let file = DataFileRef {
            version: FORMAT_VERSION,
            entries: table,
        };
        let json =
            serde_json::to_vec(&file).map_err(|e| StorageError::codec("encoding data file", e))?;

        let temp_path = self.dir.join(TEMP_FILE);
        let mut out =
            File::create(&temp_path).map_err(|e| StorageError::io("creating temp file", e))?;
        out.write_all(&json)
            .map_err(|e| StorageError::io("writing temp file", e))?;
        out.sync_all()
            .map_err(|e| StorageError::io("syncing temp file", e))?;
        fs::rename(&temp_path, self.dir.join(DATA_FILE))
            .map_err(|e| StorageError::io("replacing data file", e))
    }
}

/// Borrowing twin of `DataFile` so a batch does not clone the table to encode it.
#[derive(Serialize)]
struct DataFileRef<'a> {
    version: u32,
    entries: &'a Table,
}

fn load_table(path: &Path) -> Result<Table, StorageError> {
    if !path.exists() {
        return Ok(Table::new());
    }
    let mut contents = Vec::new();
    File::open(path)
        .and_then(|mut file| file.read_to_end(&mut contents))
        .map_err(|e| StorageError::io("reading data file", e))?;
    let file: DataFile =
        serde_json::from_slice(&contents).map_err(|e| StorageError::codec("decoding data file", e))?;
    if file.version != FORMAT_VERSION {
        return Err(StorageError::Corrupt(format!(
            "unsupported data file version {}",
            file.version
        )));
    }
    Ok(file.entries)
}

impl KvEngine for FileEngine {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(lock(&self.table)?.get(key).cloned())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut table = lock(&self.table)?;
        // stage on a copy so a failed write leaves memory matching disk
        let mut staged = table.clone();
        apply_ops(&mut staged, ops);
        self.persist(&staged)?;
        *table = staged;
        Ok(())
    }

    fn scan(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(scan_table(&*lock(&self.table)?, start, end))
    }
}
