//! Ordered key-value backends behind the ledger

use crate::errors::LedgerResult;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// Puts and deletes applied together
#[derive(Debug, Default, Clone)]
pub struct KvBatch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl KvBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((key, Some(value)));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push((key, None));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.ops
    }
}

/// Minimal ordered store. Writes through `write` are all-or-nothing.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> LedgerResult<Option<Vec<u8>>>;

    /// All pairs under `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> LedgerResult<Vec<(Vec<u8>, Vec<u8>)>>;

    fn write(&self, batch: KvBatch) -> LedgerResult<()>;
}

/// In-process store for tests and ephemeral rooms
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> LedgerResult<Option<Vec<u8>>> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> LedgerResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, batch: KvBatch) -> LedgerResult<()> {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in batch.into_ops() {
            match value {
                Some(v) => {
                    map.insert(key, v);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_scan_is_bounded_and_ordered() {
        let store = MemoryStore::new();
        let mut batch = KvBatch::new();
        batch.put(b"bet:b".to_vec(), b"2".to_vec());
        batch.put(b"bet:a".to_vec(), b"1".to_vec());
        batch.put(b"bey:z".to_vec(), b"x".to_vec());
        batch.put(b"acct:1".to_vec(), b"y".to_vec());
        store.write(batch).unwrap();

        let rows = store.scan_prefix(b"bet:").unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"bet:a".as_slice(), b"bet:b".as_slice()]);

        let mut batch = KvBatch::new();
        batch.delete(b"bet:a".to_vec());
        store.write(batch).unwrap();
        assert_eq!(store.get(b"bet:a").unwrap(), None);
        assert_eq!(store.get(b"bet:b").unwrap(), Some(b"2".to_vec()));
    }
}
