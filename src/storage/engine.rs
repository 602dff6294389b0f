//! Sharded Storage Engine
//!
//! [`StorageEngine`] is the default [`Storage`] backend. Keys are spread over
//! a fixed number of shards, each a `HashMap` behind its own `RwLock`:
//!
//! ```text
//!   key ──hash──> shard[h % 64] ──> RwLock<HashMap<Bytes, Entry>>
//! ```
//!
//! - Expiry is lazy: a read that finds an expired entry removes it. The
//!   [`ExpirySweeper`](crate::storage::ExpirySweeper) reclaims keys nobody reads.
//! - Read-modify-write operations (`append`, `incr`, the conditional stores)
//!   hold one shard write lock for their whole duration.
//! - Counters are relaxed atomics; they are statistics, not synchronization.

use crate::storage::backend::{parse_counter, Storage, StorageError, Value};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shard count. Must stay fixed for the lifetime of an engine.
const NUM_SHARDS: usize = 64;

/// A value plus its expiry deadline.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Value,
    /// `None` never expires
    pub expires_at: Option<Instant>,
    pub created_at: Instant,
}

impl Entry {
    /// Creates a new entry, expiring after `ttl` if given.
    pub fn new(value: Value, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: ttl.map(|ttl| now + ttl),
            created_at: now,
        }
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(deadline) if Instant::now() >= deadline)
    }

    /// Milliseconds until expiry; `None` for entries without a deadline.
    pub fn ttl_ms(&self) -> Option<u64> {
        self.expires_at
            .map(|exp| exp.saturating_duration_since(Instant::now()).as_millis() as u64)
    }
}

type ShardMap = HashMap<Bytes, Entry>;

#[derive(Debug, Default)]
struct Shard {
    data: RwLock<ShardMap>,
}

/// The sharded storage engine.
///
/// # Example
///
/// ```
/// use tidekv::storage::{Storage, StorageEngine, Value};
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let engine = StorageEngine::new();
///
/// engine.put(Bytes::from("name"), Value::new("tide", 0), None);
/// assert_eq!(engine.get(b"name").unwrap().data, Bytes::from("tide"));
///
/// engine.put(Bytes::from("session"), Value::new("abc123", 0), Some(Duration::from_secs(60)));
/// assert!(engine.exists(b"session"));
/// ```
pub struct StorageEngine {
    shards: Vec<Shard>,
    key_count: AtomicU64,
    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("key_count", &self.key_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    /// Creates a new storage engine with default settings.
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS).map(|_| Shard::default()).collect();

        Self {
            shards,
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_for(&self, key: &[u8]) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    /// Removes `key` if it is present but expired. Returns the live entry, if any.
    fn live_entry<'a>(&self, data: &'a mut ShardMap, key: &[u8]) -> Option<&'a mut Entry> {
        if data.get(key).is_some_and(Entry::is_expired) {
            data.remove(key);
            self.key_count.fetch_sub(1, Ordering::Relaxed);
            self.expired_count.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        data.get_mut(key)
    }

    fn insert(&self, data: &mut ShardMap, key: Bytes, entry: Entry) {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        if data.insert(key, entry).is_none() {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// True if `key` holds a live (unexpired) value. Does not count as a read.
    pub fn exists(&self, key: &[u8]) -> bool {
        let data = self.shard_for(key).data.read();
        data.get(key).is_some_and(|entry| !entry.is_expired())
    }

    /// Returns the remaining TTL of a key in milliseconds.
    ///
    /// `None` if the key is absent, `Some(None)` if it never expires.
    pub fn ttl_ms(&self, key: &[u8]) -> Option<Option<u64>> {
        let data = self.shard_for(key).data.read();
        data.get(key)
            .filter(|e| !e.is_expired())
            .map(Entry::ttl_ms)
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.key_count.load(Ordering::Relaxed),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    /// Removes every expired entry and returns how many were dropped.
    ///
    /// Shards are locked one at a time.
    pub fn cleanup_expired(&self) -> u64 {
        let cleaned: u64 = self
            .shards
            .iter()
            .map(|shard| {
                let mut data = shard.data.write();
                let before = data.len();
                data.retain(|_, entry| !entry.is_expired());
                (before - data.len()) as u64
            })
            .sum();

        if cleaned > 0 {
            self.key_count.fetch_sub(cleaned, Ordering::Relaxed);
            self.expired_count.fetch_add(cleaned, Ordering::Relaxed);
        }

        cleaned
    }

    fn concat(&self, key: Bytes, data: &[u8], front: bool) -> bool {
        let mut map = self.shard_for(&key).data.write();
        let Some(entry) = self.live_entry(&mut map, &key) else {
            return false;
        };

        let mut joined = BytesMut::with_capacity(entry.value.data.len() + data.len());
        if front {
            joined.extend_from_slice(data);
            joined.extend_from_slice(&entry.value.data);
        } else {
            joined.extend_from_slice(&entry.value.data);
            joined.extend_from_slice(data);
        }
        entry.value.data = joined.freeze();
        self.set_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn adjust(
        &self,
        key: &[u8],
        apply: impl FnOnce(u64) -> u64,
    ) -> Result<Option<u64>, StorageError> {
        let mut map = self.shard_for(key).data.write();
        let Some(entry) = self.live_entry(&mut map, key) else {
            return Ok(None);
        };

        // TTL and flags survive the update
        let next = apply(parse_counter(&entry.value.data)?);
        entry.value.data = Bytes::from(next.to_string());
        self.set_count.fetch_add(1, Ordering::Relaxed);
        Ok(Some(next))
    }
}

impl Storage for StorageEngine {
    fn put(&self, key: Bytes, value: Value, ttl: Option<Duration>) -> bool {
        let mut data = self.shard_for(&key).data.write();
        self.insert(&mut data, key, Entry::new(value, ttl));
        true
    }

    /// Returns `None` if the key doesn't exist or has expired.
    /// Expired keys are removed on access ("lazy expiry").
    fn get(&self, key: &[u8]) -> Option<Value> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        let shard = self.shard_for(key);

        // Fast path: read lock for existing, non-expired keys
        {
            let data = shard.data.read();
            match data.get(key) {
                Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Key exists but is expired - need write lock to remove it
        let mut data = shard.data.write();
        self.live_entry(&mut data, key).map(|entry| entry.value.clone())
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);
        let mut data = self.shard_for(key).data.write();

        match data.remove(key) {
            Some(entry) => {
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                !entry.is_expired()
            }
            None => false,
        }
    }

    fn put_if_absent(&self, key: Bytes, value: Value, ttl: Option<Duration>) -> bool {
        let mut data = self.shard_for(&key).data.write();
        if self.live_entry(&mut data, &key).is_some() {
            return false;
        }
        self.insert(&mut data, key, Entry::new(value, ttl));
        true
    }

    fn put_if_present(&self, key: Bytes, value: Value, ttl: Option<Duration>) -> bool {
        let mut data = self.shard_for(&key).data.write();
        if self.live_entry(&mut data, &key).is_none() {
            return false;
        }
        self.insert(&mut data, key, Entry::new(value, ttl));
        true
    }

    fn append(&self, key: Bytes, data: &[u8]) -> bool {
        self.concat(key, data, false)
    }

    fn prepend(&self, key: Bytes, data: &[u8]) -> bool {
        self.concat(key, data, true)
    }

    fn incr(&self, key: &[u8], delta: u64) -> Result<Option<u64>, StorageError> {
        self.adjust(key, |current| current.wrapping_add(delta))
    }

    fn decr(&self, key: &[u8], delta: u64) -> Result<Option<u64>, StorageError> {
        self.adjust(key, |current| current.saturating_sub(delta))
    }

    fn flush(&self) {
        for shard in &self.shards {
            shard.data.write().clear();
        }
        self.key_count.store(0, Ordering::Relaxed);
    }

    /// Approximate, because counters use relaxed ordering.
    fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }
}

/// Database statistics.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    /// Number of keys currently stored
    pub keys: u64,
    /// Total GET operations
    pub get_ops: u64,
    /// Total store operations
    pub set_ops: u64,
    /// Total DELETE operations
    pub del_ops: u64,
    /// Total expired keys cleaned up
    pub expired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(s: &str) -> Value {
        Value::new(Bytes::copy_from_slice(s.as_bytes()), 0)
    }

    #[test]
    fn test_put_and_get() {
        let engine = StorageEngine::new();

        engine.put(Bytes::from("key"), Value::new("value", 42), None);
        let stored = engine.get(b"key").unwrap();
        assert_eq!(stored.data, Bytes::from("value"));
        assert_eq!(stored.flags, 42);
    }

    #[test]
    fn test_get_nonexistent() {
        let engine = StorageEngine::new();
        assert_eq!(engine.get(b"nonexistent"), None);
    }

    #[test]
    fn test_delete() {
        let engine = StorageEngine::new();

        engine.put(Bytes::from("key"), value("value"), None);
        assert!(engine.delete(b"key"));
        assert_eq!(engine.get(b"key"), None);
        assert!(!engine.delete(b"key")); // Already deleted
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn test_expiry() {
        let engine = StorageEngine::new();

        engine.put(
            Bytes::from("key"),
            value("value"),
            Some(Duration::from_millis(50)),
        );
        assert!(engine.exists(b"key"));

        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(engine.get(b"key"), None);
        assert_eq!(engine.len(), 0);
        assert_eq!(engine.stats().expired, 1);
    }

    #[test]
    fn test_conditional_puts() {
        let engine = StorageEngine::new();

        assert!(!engine.put_if_present(Bytes::from("k"), value("a"), None));
        assert!(engine.put_if_absent(Bytes::from("k"), value("b"), None));
        assert!(!engine.put_if_absent(Bytes::from("k"), value("c"), None));
        assert!(engine.put_if_present(Bytes::from("k"), value("d"), None));
        assert_eq!(engine.get(b"k").unwrap().data, Bytes::from("d"));
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_add_over_expired_key() {
        let engine = StorageEngine::new();
        engine.put(Bytes::from("k"), value("old"), Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(30));

        assert!(engine.put_if_absent(Bytes::from("k"), value("new"), None));
        assert_eq!(engine.get(b"k").unwrap().data, Bytes::from("new"));
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_append_prepend() {
        let engine = StorageEngine::new();

        // Both require an existing key
        assert!(!engine.append(Bytes::from("key"), b"x"));

        engine.put(Bytes::from("key"), Value::new("Hello", 3), None);
        assert!(engine.append(Bytes::from("key"), b" World"));
        assert!(engine.prepend(Bytes::from("key"), b">> "));

        let stored = engine.get(b"key").unwrap();
        assert_eq!(stored.data, Bytes::from(">> Hello World"));
        assert_eq!(stored.flags, 3);
    }

    #[test]
    fn test_incr_decr() {
        let engine = StorageEngine::new();

        assert_eq!(engine.incr(b"counter", 1), Ok(None));

        engine.put(Bytes::from("counter"), value("10"), None);
        assert_eq!(engine.incr(b"counter", 5), Ok(Some(15)));
        assert_eq!(engine.decr(b"counter", 20), Ok(Some(0)));

        engine.put(Bytes::from("text"), value("hello"), None);
        assert_eq!(engine.incr(b"text", 1), Err(StorageError::NotANumber));
    }

    #[test]
    fn test_incr_keeps_ttl() {
        let engine = StorageEngine::new();
        engine.put(
            Bytes::from("n"),
            value("1"),
            Some(Duration::from_secs(100)),
        );
        assert_eq!(engine.incr(b"n", 1), Ok(Some(2)));

        let ttl = engine.ttl_ms(b"n").unwrap();
        assert!(ttl.is_some_and(|ms| ms > 0 && ms <= 100_000));
    }

    #[test]
    fn test_flush() {
        let engine = StorageEngine::new();

        engine.put(Bytes::from("key1"), value("value1"), None);
        engine.put(Bytes::from("key2"), value("value2"), None);
        assert_eq!(engine.len(), 2);

        engine.flush();

        assert_eq!(engine.len(), 0);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_cleanup_expired() {
        let engine = StorageEngine::new();

        engine.put(Bytes::from("key1"), value("v"), Some(Duration::from_millis(10)));
        engine.put(Bytes::from("key2"), value("v"), Some(Duration::from_millis(10)));
        engine.put(Bytes::from("key3"), value("v"), None); // No expiry

        std::thread::sleep(Duration::from_millis(50));

        let cleaned = engine.cleanup_expired();
        assert_eq!(cleaned, 2);
        assert_eq!(engine.len(), 1);
        assert!(engine.exists(b"key3"));
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let engine = Arc::new(StorageEngine::new());
        let mut handles = vec![];

        for i in 0..10 {
            let engine = Arc::clone(&engine);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    let key = format!("key-{}-{}", i, j);
                    engine.put(Bytes::from(key.clone()), value("value"), None);
                    engine.get(key.as_bytes());
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.len(), 1000);
    }

    #[test]
    fn test_concurrent_incr_is_atomic() {
        use std::sync::Arc;
        use std::thread;

        let engine = Arc::new(StorageEngine::new());
        engine.put(Bytes::from("hits"), value("0"), None);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for _ in 0..250 {
                        engine.incr(b"hits", 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.get(b"hits").unwrap().data, Bytes::from("2000"));
    }
}
