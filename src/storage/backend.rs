//! Storage Interface
//!
//! The network core only talks to storage through the [`Storage`] trait, and only
//! from executor threads. Implementations must therefore be safe for concurrent
//! use from many threads at once.
//!
//! Only [`Storage::put`], [`Storage::get`] and [`Storage::delete`] are required.
//! The remaining operations have default implementations built on those three;
//! the defaults are not atomic, so engines that can do better (like
//! [`StorageEngine`](crate::storage::StorageEngine)) override them.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use thiserror::Error;

/// A stored value together with its opaque client flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub data: Bytes,
    pub flags: u32,
}

impl Value {
    pub fn new(data: impl Into<Bytes>, flags: u32) -> Self {
        Self {
            data: data.into(),
            flags,
        }
    }
}

/// Errors raised by storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// INCR/DECR on a value that is not a decimal u64
    #[error("cannot increment or decrement non-numeric value")]
    NotANumber,
}

/// Thread-safe key-value store used by command execution.
pub trait Storage: Send + Sync {
    /// Stores `value` under `key`, replacing any existing value.
    fn put(&self, key: Bytes, value: Value, ttl: Option<Duration>) -> bool;

    /// Returns the value for `key`, or `None` if absent or expired.
    fn get(&self, key: &[u8]) -> Option<Value>;

    /// Removes `key`. Returns `true` if it existed.
    fn delete(&self, key: &[u8]) -> bool;

    /// Stores only if `key` is absent.
    fn put_if_absent(&self, key: Bytes, value: Value, ttl: Option<Duration>) -> bool {
        if self.get(&key).is_some() {
            return false;
        }
        self.put(key, value, ttl)
    }

    /// Stores only if `key` already exists.
    fn put_if_present(&self, key: Bytes, value: Value, ttl: Option<Duration>) -> bool {
        if self.get(&key).is_none() {
            return false;
        }
        self.put(key, value, ttl)
    }

    /// Appends `data` to an existing value, keeping its flags.
    fn append(&self, key: Bytes, data: &[u8]) -> bool {
        let Some(current) = self.get(&key) else {
            return false;
        };
        let mut joined = BytesMut::with_capacity(current.data.len() + data.len());
        joined.extend_from_slice(&current.data);
        joined.extend_from_slice(data);
        self.put(key, Value::new(joined.freeze(), current.flags), None)
    }

    /// Prepends `data` to an existing value, keeping its flags.
    fn prepend(&self, key: Bytes, data: &[u8]) -> bool {
        let Some(current) = self.get(&key) else {
            return false;
        };
        let mut joined = BytesMut::with_capacity(current.data.len() + data.len());
        joined.extend_from_slice(data);
        joined.extend_from_slice(&current.data);
        self.put(key, Value::new(joined.freeze(), current.flags), None)
    }

    /// Adds `delta` with 64-bit wraparound. `Ok(None)` if the key is absent.
    fn incr(&self, key: &[u8], delta: u64) -> Result<Option<u64>, StorageError> {
        let Some(current) = self.get(key) else {
            return Ok(None);
        };
        let next = parse_counter(&current.data)?.wrapping_add(delta);
        let key = Bytes::copy_from_slice(key);
        self.put(key, Value::new(next.to_string(), current.flags), None);
        Ok(Some(next))
    }

    /// Subtracts `delta`, saturating at zero. `Ok(None)` if the key is absent.
    fn decr(&self, key: &[u8], delta: u64) -> Result<Option<u64>, StorageError> {
        let Some(current) = self.get(key) else {
            return Ok(None);
        };
        let next = parse_counter(&current.data)?.saturating_sub(delta);
        let key = Bytes::copy_from_slice(key);
        self.put(key, Value::new(next.to_string(), current.flags), None);
        Ok(Some(next))
    }

    /// Removes every key. Engines without bulk removal may leave this a no-op.
    fn flush(&self) {}

    /// Approximate number of stored keys.
    fn len(&self) -> u64 {
        0
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses a stored counter the way INCR/DECR expect it.
pub(crate) fn parse_counter(data: &[u8]) -> Result<u64, StorageError> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.trim_end().parse::<u64>().ok())
        .ok_or(StorageError::NotANumber)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Minimal storage that relies on every provided method.
    #[derive(Default)]
    struct MapStorage {
        map: Mutex<HashMap<Bytes, Value>>,
    }

    impl Storage for MapStorage {
        fn put(&self, key: Bytes, value: Value, _ttl: Option<Duration>) -> bool {
            self.map.lock().insert(key, value);
            true
        }

        fn get(&self, key: &[u8]) -> Option<Value> {
            self.map.lock().get(key).cloned()
        }

        fn delete(&self, key: &[u8]) -> bool {
            self.map.lock().remove(key).is_some()
        }
    }

    #[test]
    fn test_default_conditional_puts() {
        let storage = MapStorage::default();

        assert!(!storage.put_if_present(Bytes::from("k"), Value::new("v", 0), None));
        assert!(storage.put_if_absent(Bytes::from("k"), Value::new("v1", 0), None));
        assert!(!storage.put_if_absent(Bytes::from("k"), Value::new("v2", 0), None));
        assert!(storage.put_if_present(Bytes::from("k"), Value::new("v3", 0), None));
        assert_eq!(storage.get(b"k").unwrap().data, Bytes::from("v3"));
    }

    #[test]
    fn test_default_append_prepend_keep_flags() {
        let storage = MapStorage::default();
        assert!(!storage.append(Bytes::from("k"), b"x"));

        storage.put(Bytes::from("k"), Value::new("mid", 7), None);
        assert!(storage.append(Bytes::from("k"), b"-end"));
        assert!(storage.prepend(Bytes::from("k"), b"start-"));

        let value = storage.get(b"k").unwrap();
        assert_eq!(value.data, Bytes::from("start-mid-end"));
        assert_eq!(value.flags, 7);
    }

    #[test]
    fn test_default_counters() {
        let storage = MapStorage::default();
        assert_eq!(storage.incr(b"n", 1), Ok(None));

        storage.put(Bytes::from("n"), Value::new("10", 0), None);
        assert_eq!(storage.incr(b"n", 5), Ok(Some(15)));
        assert_eq!(storage.decr(b"n", 100), Ok(Some(0)));

        storage.put(Bytes::from("s"), Value::new("abc", 0), None);
        assert_eq!(storage.incr(b"s", 1), Err(StorageError::NotANumber));
    }

    #[test]
    fn test_incr_wraps() {
        let storage = MapStorage::default();
        storage.put(Bytes::from("n"), Value::new(u64::MAX.to_string(), 0), None);
        assert_eq!(storage.incr(b"n", 2), Ok(Some(1)));
    }
}
