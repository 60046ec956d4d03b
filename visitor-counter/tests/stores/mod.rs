use {
    std::{sync::{Arc, atomic::{AtomicU32, Ordering}}, time::Duration, thread},
    visitor_counter::kv::{KVStorage, StorageError, BoxedStorage, SqliteStorage, WithKey},
};

pub const KEY: &[u8] = b"visitor";

pub fn sqlite_with_count(count: &str) -> BoxedStorage {
    BoxedStorage::new(SqliteStorage::in_memory().unwrap().with_key(KEY, count.as_bytes()).unwrap())
}

pub fn empty_sqlite() -> BoxedStorage {
    BoxedStorage::new(SqliteStorage::in_memory().unwrap())
}

pub fn stored(storage: &BoxedStorage) -> Option<String> {
    storage.get(KEY).unwrap().map(|v| String::from_utf8(v).unwrap())
}

/// Every operation fails as if the backend could not be reached.
pub struct UnavailableStorage;

impl KVStorage for UnavailableStorage {
    fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> { Err(unavailable()) }
    fn set(&self, _key: &[u8], _value: &[u8]) -> Result<(), StorageError> { Err(unavailable()) }
    fn compare_and_swap(&self, _key: &[u8], _expected: Option<&[u8]>, _value: &[u8]) -> Result<(), StorageError> { Err(unavailable()) }
}

/// Reads go through, writes fail.
pub struct ReadOnlyStorage {
    pub inner: BoxedStorage,
}

impl KVStorage for ReadOnlyStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> { self.inner.get(key) }
    fn set(&self, _key: &[u8], _value: &[u8]) -> Result<(), StorageError> { Err(unavailable()) }
    fn compare_and_swap(&self, _key: &[u8], _expected: Option<&[u8]>, _value: &[u8]) -> Result<(), StorageError> { Err(unavailable()) }
}

fn unavailable() -> StorageError {
    StorageError::Unavailable { description: "connection refused".to_owned() }
}

/// Simulates another writer: right before each of the first `interference` conditional writes,
/// the stored count is bumped behind the caller's back, so that write conflicts.
pub struct InterferingStorage {
    inner: BoxedStorage,
    interference: AtomicU32,
    pub conditional_writes: Arc<AtomicU32>,
}

impl InterferingStorage {
    pub fn new(inner: BoxedStorage, interference: u32) -> Self {
        Self {
            inner,
            interference: AtomicU32::new(interference),
            conditional_writes: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl KVStorage for InterferingStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> { self.inner.get(key) }
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> { self.inner.set(key, value) }

    fn compare_and_swap(&self, key: &[u8], expected: Option<&[u8]>, value: &[u8]) -> Result<(), StorageError> {
        self.conditional_writes.fetch_add(1, Ordering::SeqCst);

        let interfere = self.interference
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if interfere {
            let current: u64 = match self.inner.get(key)? {
                Some(v) => String::from_utf8(v).unwrap().parse().unwrap(),
                None => 0,
            };
            self.inner.set(key, (current + 1).to_string().as_bytes())?;
        }

        self.inner.compare_and_swap(key, expected, value)
    }
}

/// Each read takes `delay`.
pub struct SlowStorage {
    pub inner: BoxedStorage,
    pub delay: Duration,
}

impl KVStorage for SlowStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        thread::sleep(self.delay);
        self.inner.get(key)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> { self.inner.set(key, value) }

    fn compare_and_swap(&self, key: &[u8], expected: Option<&[u8]>, value: &[u8]) -> Result<(), StorageError> {
        self.inner.compare_and_swap(key, expected, value)
    }
}
