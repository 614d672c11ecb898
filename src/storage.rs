//! Key-value storage backends: RocksDB for real deployments, an in-memory
//! map for tests and dry runs.

use crate::config::{CompressionType, StorageConfig};
use crate::errors::{GuessRoundsResult, StorageError};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// One entry of an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Minimal storage contract the game store is written against
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> GuessRoundsResult<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> GuessRoundsResult<()>;

    fn delete(&self, key: &[u8]) -> GuessRoundsResult<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> GuessRoundsResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every operation or none
    fn batch_write(&self, ops: Vec<BatchOp>) -> GuessRoundsResult<()>;
}

#[derive(Clone)]
pub struct RocksStorage {
    db: Arc<DB>,
}

impl RocksStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> GuessRoundsResult<Self> {
        Self::with_config(path, &StorageConfig::default())
    }

    pub fn with_config<P: AsRef<Path>>(path: P, config: &StorageConfig) -> GuessRoundsResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        opts.set_max_write_buffer_number(config.max_write_buffer_number as i32);
        opts.set_target_file_size_base((config.target_file_size_mb * 1024 * 1024) as u64);
        opts.set_compression_type(match config.compression_type {
            CompressionType::None => rocksdb::DBCompressionType::None,
            CompressionType::Snappy => rocksdb::DBCompressionType::Snappy,
            CompressionType::Lz4 => rocksdb::DBCompressionType::Lz4,
            CompressionType::Zstd => rocksdb::DBCompressionType::Zstd,
        });

        let db = DB::open(&opts, path.as_ref())
            .map_err(|e| StorageError::DatabaseOpenFailed(format!("{}: {}", path.as_ref().display(), e)))?;
        Ok(Self { db: Arc::new(db) })
    }
}

impl KvStore for RocksStorage {
    fn get(&self, key: &[u8]) -> GuessRoundsResult<Option<Vec<u8>>> {
        Ok(self
            .db
            .get(key)
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> GuessRoundsResult<()> {
        self.db.put(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> GuessRoundsResult<()> {
        self.db.delete(key)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> GuessRoundsResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    fn batch_write(&self, ops: Vec<BatchOp>) -> GuessRoundsResult<()> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put(key, value) => batch.put(key, value),
                BatchOp::Delete(key) => batch.delete(key),
            }
        }
        self.db.write(batch)?;
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MemoryStorage {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StorageError {
    StorageError::ReadFailed(format!("memory store lock poisoned: {}", e))
}

impl KvStore for MemoryStorage {
    fn get(&self, key: &[u8]) -> GuessRoundsResult<Option<Vec<u8>>> {
        Ok(self.entries.read().map_err(poisoned)?.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> GuessRoundsResult<()> {
        self.entries
            .write()
            .map_err(poisoned)?
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> GuessRoundsResult<()> {
        self.entries.write().map_err(poisoned)?.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> GuessRoundsResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn batch_write(&self, ops: Vec<BatchOp>) -> GuessRoundsResult<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        for op in ops {
            match op {
                BatchOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
