//! RocksDB-backed key-value store

use super::store::{KvBatch, KvStore};
use crate::config::StorageConfig;
use crate::errors::LedgerResult;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        Self::open_with(path, 64)
    }

    pub fn open_with<P: AsRef<Path>>(path: P, write_buffer_size_mb: usize) -> LedgerResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(write_buffer_size_mb.max(1) * 1024 * 1024);
        opts.set_max_write_buffer_number(4);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Open per the storage section, wiping the directory first when asked
    pub fn from_config(config: &StorageConfig) -> LedgerResult<Self> {
        if config.clear_on_start {
            match std::fs::remove_dir_all(&config.data_directory) {
                Ok(()) => tracing::warn!(path = %config.data_directory, "Cleared ledger directory"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(crate::errors::LedgerError::Storage(e.to_string())),
            }
        }
        Self::open_with(&config.data_directory, config.write_buffer_size_mb)
    }
}

impl KvStore for RocksStore {
    fn get(&self, key: &[u8]) -> LedgerResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> LedgerResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    fn write(&self, batch: KvBatch) -> LedgerResult<()> {
        let mut wb = WriteBatch::default();
        for (key, value) in batch.into_ops() {
            match value {
                Some(v) => wb.put(key, v),
                None => wb.delete(key),
            }
        }
        self.db.write(wb)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rocks_batch_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();

        let mut batch = KvBatch::new();
        batch.put(b"hist:2".to_vec(), b"b".to_vec());
        batch.put(b"hist:1".to_vec(), b"a".to_vec());
        batch.put(b"room:1".to_vec(), b"r".to_vec());
        store.write(batch).unwrap();

        let rows = store.scan_prefix(b"hist:").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1, b"a".to_vec());

        let mut batch = KvBatch::new();
        batch.delete(b"hist:1".to_vec());
        store.write(batch).unwrap();
        assert_eq!(store.get(b"hist:1").unwrap(), None);
    }
}
