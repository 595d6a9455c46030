use crate::{KVStore, Result, StorageError, Transaction};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type Entries = Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>;

/// In-memory key-value store
///
/// Backs tests and `trellis --in-memory` dry runs.
/// Transactions are optimistic: reads are validated again at commit time.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Entries,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KVStore for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone()))
            .collect())
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    fn transaction(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            entries: Arc::clone(&self.entries),
            reads: parking_lot::Mutex::new(HashMap::new()),
            writes: BTreeMap::new(),
        }))
    }
}

struct MemoryTransaction {
    entries: Entries,
    /// Value observed for every key read through this transaction
    reads: parking_lot::Mutex<HashMap<Vec<u8>, Option<Bytes>>>,
    /// Buffered writes, `None` meaning delete
    writes: BTreeMap<Vec<u8>, Option<Bytes>>,
}

impl Transaction for MemoryTransaction {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        let current = self.entries.read().get(key).cloned();
        self.reads
            .lock()
            .entry(key.to_vec())
            .or_insert_with(|| current.clone());
        Ok(current)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writes
            .insert(key.to_vec(), Some(Bytes::copy_from_slice(value)));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            entries,
            reads,
            writes,
        } = *self;
        let mut entries = entries.write();

        for (key, seen) in reads.into_inner() {
            if entries.get(&key) != seen.as_ref() {
                return Err(StorageError::transaction_error(format!(
                    "Key {} was modified concurrently",
                    String::from_utf8_lossy(&key)
                )));
            }
        }

        for (key, value) in writes {
            match value {
                Some(v) => {
                    entries.insert(key, v);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_scan() {
        let backend = MemoryBackend::new();
        backend.put(b"objects/a", b"1").unwrap();
        backend.put(b"objects/b", b"2").unwrap();
        backend.put(b"snapshots/a", b"3").unwrap();

        let results = backend.scan(b"objects/").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(backend.len(), 3);
    }

    #[test]
    fn test_transaction_commit_and_rollback() {
        let backend = MemoryBackend::new();

        let mut txn = backend.transaction().unwrap();
        txn.put(b"k", b"v").unwrap();
        assert_eq!(txn.get(b"k").unwrap(), Some(Bytes::from("v")));
        assert!(!backend.exists(b"k").unwrap());
        txn.commit().unwrap();
        assert!(backend.exists(b"k").unwrap());

        let mut txn = backend.transaction().unwrap();
        txn.delete(b"k").unwrap();
        txn.rollback().unwrap();
        assert!(backend.exists(b"k").unwrap());
    }

    #[test]
    fn test_transaction_detects_concurrent_modification() {
        let backend = MemoryBackend::new();
        backend.put(b"k", b"v1").unwrap();

        let mut txn = backend.transaction().unwrap();
        assert_eq!(txn.get(b"k").unwrap(), Some(Bytes::from("v1")));
        backend.put(b"k", b"v2").unwrap();
        txn.put(b"k", b"v3").unwrap();

        assert!(txn.commit().is_err());
        assert_eq!(backend.get(b"k").unwrap(), Some(Bytes::from("v2")));
    }
}
