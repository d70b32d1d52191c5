//! Per-key lock table for multi-key ledger mutations

use crate::types::{AccountId, RoomId};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Lockable unit. Declaration order is acquisition order, which rules out
/// lock-order deadlocks between settlements and bet placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Jackpot,
    Promos,
    Room(RoomId),
    Account(AccountId),
}

/// One mutex per key, created on first use and dropped once no caller holds it
#[derive(Debug, Default)]
pub struct KeyLocks {
    table: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: LockKey) -> Arc<Mutex<()>> {
        self.table.entry(key).or_default().clone()
    }

    /// Run `f` while holding every key in `keys`
    pub fn with<R>(&self, keys: impl IntoIterator<Item = LockKey>, f: impl FnOnce() -> R) -> R {
        let mut keys: Vec<LockKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let handles: Vec<Arc<Mutex<()>>> = keys.iter().map(|k| self.handle(*k)).collect();
        let out = {
            let _guards: Vec<_> = handles
                .iter()
                .map(|h| h.lock().unwrap_or_else(PoisonError::into_inner))
                .collect();
            f()
        };

        drop(handles);
        for key in keys {
            // The shard lock makes the count check atomic with `handle`
            self.table.remove_if(&key, |_, h| Arc::strong_count(h) == 1);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    #[test]
    fn test_key_order() {
        assert!(LockKey::Jackpot < LockKey::Room(RoomId(i64::MIN)));
        assert!(LockKey::Room(RoomId(i64::MAX)) < LockKey::Account(AccountId(i64::MIN)));
    }

    #[test]
    fn test_overlapping_keys_serialize() {
        let locks = Arc::new(KeyLocks::new());
        let counter = Arc::new(AtomicU64::new(0));

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let locks = locks.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        // Reverse the requested order on odd workers
                        let keys = if i % 2 == 0 {
                            vec![LockKey::Jackpot, LockKey::Account(AccountId(1))]
                        } else {
                            vec![LockKey::Account(AccountId(1)), LockKey::Jackpot]
                        };
                        locks.with(keys, || {
                            let v = counter.load(Ordering::SeqCst);
                            counter.store(v + 1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1_600);
        assert!(locks.is_empty(), "idle keys are pruned");
    }

    #[test]
    fn test_held_key_survives_nested_release() {
        let locks = KeyLocks::new();
        locks.with([LockKey::Room(RoomId(1))], || {
            locks.with([LockKey::Account(AccountId(2))], || {
                assert_eq!(locks.len(), 2);
            });
            assert_eq!(locks.len(), 1);
        });
        assert!(locks.is_empty());
    }
}
