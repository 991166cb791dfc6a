use rocksdb::{Direction, IteratorMode, WriteBatch, DB};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open storage: {0}")]
    OpenError(String),

    #[error("Storage operation failed: {0}")]
    StorageError(#[from] rocksdb::Error),
}

/// A single operation of an atomic write batch.
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An ordered, persistent key-value store. Reads are safe to call
/// concurrently with writes; atomicity is per call.
#[derive(Clone)]
pub struct Storage {
    db: Arc<DB>,
}

impl Storage {
    /// Open (or create) the store rooted at `path`.
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let db = DB::open_default(path).map_err(|e| StoreError::OpenError(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Read the value at `key`, if any.
    pub fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db.get(key).map_err(StoreError::from)
    }

    /// Write a single key-value pair.
    pub fn write(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.put(key, value).map_err(StoreError::from)
    }

    /// Apply a set of puts and deletes atomically.
    pub fn write_batch<I>(&self, operations: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = BatchOp>,
    {
        let mut batch = WriteBatch::default();
        for operation in operations {
            match operation {
                BatchOp::Put(key, value) => batch.put(key, value),
                BatchOp::Delete(key) => batch.delete(key),
            }
        }
        self.db.write(batch).map_err(StoreError::from)
    }

    /// All pairs with `from <= key < to`, in ascending key order.
    pub fn iter_range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut pairs = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(from, Direction::Forward))
        {
            let (key, value) = item?;
            if key.as_ref() >= to {
                break;
            }
            pairs.push((key.to_vec(), value.to_vec()));
        }
        Ok(pairs)
    }

    /// The greatest key-value pair whose key starts with `prefix`, if any.
    pub fn last_in_prefix(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let bound = upper_bound(prefix);
        // Reverse iteration starts at the last key <= the bound, which may
        // itself lie outside the prefix; the prefix check below skips it.
        let iter = match &bound {
            Some(bound) => self
                .db
                .iterator(IteratorMode::From(bound, Direction::Reverse)),
            None => self.db.iterator(IteratorMode::End),
        };
        for item in iter {
            let (key, value) = item?;
            if key.starts_with(prefix) {
                return Ok(Some((key.to_vec(), value.to_vec())));
            }
            if key.as_ref() < prefix {
                break;
            }
        }
        Ok(None)
    }
}

/// The smallest byte string greater than every string with this prefix, or
/// `None` when the prefix is all `0xff`.
fn upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(test_id: &str) -> Storage {
        let path = format!(".test_kv_storage_{}", test_id);
        let _ = std::fs::remove_dir_all(&path);
        Storage::new(&path).unwrap()
    }

    fn delete(test_id: &str) {
        let _ = std::fs::remove_dir_all(&format!(".test_kv_storage_{}", test_id));
    }

    #[test]
    fn read_your_writes() {
        let store = open("read_your_writes");
        assert_eq!(store.read(b"missing").unwrap(), None);
        store.write(b"key", b"value").unwrap();
        assert_eq!(store.read(b"key").unwrap(), Some(b"value".to_vec()));
        delete("read_your_writes");
    }

    #[test]
    fn batch_applies_puts_and_deletes() {
        let store = open("batch_applies_puts_and_deletes");
        store.write(b"stale", b"x").unwrap();
        store
            .write_batch(vec![
                BatchOp::Put(b"a".to_vec(), b"1".to_vec()),
                BatchOp::Put(b"b".to_vec(), b"2".to_vec()),
                BatchOp::Delete(b"stale".to_vec()),
            ])
            .unwrap();
        assert_eq!(store.read(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.read(b"stale").unwrap(), None);
        delete("batch_applies_puts_and_deletes");
    }

    #[test]
    fn range_is_ascending_and_half_open() {
        let store = open("range_is_ascending_and_half_open");
        for key in [b"E1", b"E2", b"E3", b"F0"].iter() {
            store.write(*key, b"v").unwrap();
        }
        let keys: Vec<_> = store
            .iter_range(b"E1", b"E3")
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![b"E1".to_vec(), b"E2".to_vec()]);
        delete("range_is_ascending_and_half_open");
    }

    #[test]
    fn last_in_prefix_ignores_other_families() {
        let store = open("last_in_prefix_ignores_other_families");
        assert_eq!(store.last_in_prefix(b"E").unwrap(), None);
        store.write(b"E1", b"a").unwrap();
        store.write(b"E9", b"b").unwrap();
        store.write(b"F5", b"c").unwrap();
        let (key, value) = store.last_in_prefix(b"E").unwrap().unwrap();
        assert_eq!(key, b"E9".to_vec());
        assert_eq!(value, b"b".to_vec());
        delete("last_in_prefix_ignores_other_families");
    }
}
