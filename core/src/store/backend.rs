// Storage abstraction shared by the announce table and the selection record

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Unified key/value storage trait.
///
/// Both persisted surfaces of this crate go through this trait: the bounded
/// announce table (`announce/<relay_id>` keys) and the current-selection
/// record (single `selection/current` key). Implementations must be safe to
/// share across tasks; every method is synchronous and cheap enough to call
/// from an async context.
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String>;
    fn remove(&self, key: &[u8]) -> Result<(), String>;
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String>;
    fn flush(&self) -> Result<(), String>;
}

/// In-memory storage for tests and ephemeral runs
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Durable storage backed by sled
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: &str) -> Result<Self, String> {
        let db = sled::open(path).map_err(|e| e.to_string())?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.db.insert(key, value).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        let value = self.db.get(key).map_err(|e| e.to_string())?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        self.db.remove(key).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| e.to_string())?;
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    fn flush(&self) -> Result<(), String> {
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Backend wrapper whose writes (and optionally reads) can be failed on
/// demand. Test-only: exercises the persist-retry and query-failure paths.
#[cfg(test)]
pub(crate) struct FlakyStorage {
    inner: MemoryStorage,
    pub fail_writes: std::sync::atomic::AtomicBool,
    pub fail_reads: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FlakyStorage {
    pub fn new() -> Self {
        Self {
            inner: MemoryStorage::new(),
            fail_writes: std::sync::atomic::AtomicBool::new(false),
            fail_reads: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl StorageBackend for FlakyStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err("simulated write failure".to_string());
        }
        self.inner.put(key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        if self.fail_reads.load(std::sync::atomic::Ordering::SeqCst) {
            return Err("simulated read failure".to_string());
        }
        self.inner.get(key)
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err("simulated write failure".to_string());
        }
        self.inner.remove(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        if self.fail_reads.load(std::sync::atomic::Ordering::SeqCst) {
            return Err("simulated read failure".to_string());
        }
        self.inner.scan_prefix(prefix)
    }

    fn flush(&self) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_put_get_remove() {
        let storage = MemoryStorage::new();
        storage.put(b"k1", b"v1").unwrap();
        assert_eq!(storage.get(b"k1").unwrap(), Some(b"v1".to_vec()));

        storage.remove(b"k1").unwrap();
        assert_eq!(storage.get(b"k1").unwrap(), None);
    }

    #[test]
    fn test_memory_scan_prefix_is_ordered() {
        let storage = MemoryStorage::new();
        storage.put(b"announce/bb", b"2").unwrap();
        storage.put(b"announce/aa", b"1").unwrap();
        storage.put(b"selection/current", b"x").unwrap();

        let scanned = storage.scan_prefix(b"announce/").unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, b"announce/aa".to_vec());
        assert_eq!(scanned[1].0, b"announce/bb".to_vec());
    }

    #[test]
    fn test_sled_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SledStorage::open(dir.path().to_str().unwrap()).unwrap();

        storage.put(b"announce/aa", b"1").unwrap();
        storage.flush().unwrap();
        assert_eq!(storage.get(b"announce/aa").unwrap(), Some(b"1".to_vec()));
        assert_eq!(storage.scan_prefix(b"announce/").unwrap().len(), 1);
    }

    #[test]
    fn test_flaky_storage_toggles() {
        let storage = FlakyStorage::new();
        storage.put(b"k", b"v").unwrap();

        storage.set_fail_writes(true);
        assert!(storage.put(b"k2", b"v2").is_err());
        assert_eq!(storage.get(b"k").unwrap(), Some(b"v".to_vec()));

        storage.set_fail_writes(false);
        storage.put(b"k2", b"v2").unwrap();
        assert_eq!(storage.get(b"k2").unwrap(), Some(b"v2".to_vec()));
    }
}
