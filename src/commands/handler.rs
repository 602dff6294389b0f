//! Command Handler Module
//!
//! This module executes parsed memcached commands against a [`Storage`]
//! backend. It runs on executor threads, never on a reactor thread.
//!
//! ## Supported Commands
//!
//! ### Storage Commands
//! - `set key flags exptime bytes [noreply]` - Store unconditionally
//! - `add ...` - Store if the key is absent
//! - `replace ...` - Store if the key exists
//! - `append ...` / `prepend ...` - Extend an existing value
//!
//! ### Retrieval and Update
//! - `get key [key ...]` - Get values
//! - `delete key [noreply]` - Delete a key
//! - `incr key delta [noreply]` / `decr key delta [noreply]` - Counters
//!
//! ### Server Commands
//! - `flush_all [noreply]`, `version`, `stats`, `quit`
//!
//! ## Expiration Times
//!
//! `0` never expires. Up to 30 days the value is a relative number of
//! seconds; above that it is an absolute unix timestamp. Negative values and
//! timestamps in the past store an already expired item.

use crate::connection::ConnectionStats;
use crate::protocol::{Command, Reply, StoreMode};
use crate::storage::{Storage, StorageError, Value};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Largest exptime still treated as a relative offset (30 days).
pub const MAX_RELATIVE_EXPTIME: i64 = 60 * 60 * 24 * 30;

/// Errors raised while executing a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The data block does not match the length announced in the header
    #[error("data block length mismatch: expected {expected}, got {actual}")]
    DataLength { expected: usize, actual: usize },
}

impl CommandError {
    /// Returns the reply sent to the client for this error.
    pub fn reply(&self) -> Reply {
        match self {
            CommandError::Storage(err) => Reply::client_error(err.to_string()),
            CommandError::DataLength { .. } => Reply::client_error("bad data chunk"),
        }
    }
}

/// Executes commands against the shared storage.
#[derive(Clone)]
pub struct CommandHandler {
    /// The storage backend
    storage: Arc<dyn Storage>,
    /// Server-wide counters reported by `stats`
    stats: Arc<ConnectionStats>,
    /// Server start time for the `stats` command
    start_time: Instant,
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

impl CommandHandler {
    /// Creates a new command handler over the given storage.
    pub fn new(storage: Arc<dyn Storage>, stats: Arc<ConnectionStats>) -> Self {
        Self {
            storage,
            stats,
            start_time: Instant::now(),
        }
    }

    /// Returns the shared statistics.
    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Executes a command and returns the reply.
    ///
    /// `data` is the data block of a storage command (without its CRLF) and
    /// empty for every other command. Commands sent with `noreply` return
    /// [`Reply::Silent`] on success.
    pub fn execute(&self, command: Command, data: Bytes) -> Result<Reply, CommandError> {
        self.stats.command_processed();
        let noreply = command.noreply();

        let reply = match command {
            Command::Store {
                mode,
                key,
                flags,
                exptime,
                bytes,
                ..
            } => {
                if data.len() != bytes {
                    return Err(CommandError::DataLength {
                        expected: bytes,
                        actual: data.len(),
                    });
                }
                self.cmd_store(mode, key, Value::new(data, flags), exptime)
            }
            Command::Get { keys } => self.cmd_get(keys),
            Command::Delete { key, .. } => self.cmd_delete(&key),
            Command::Incr { key, delta, .. } => self.storage.incr(&key, delta)?.into_reply(),
            Command::Decr { key, delta, .. } => self.storage.decr(&key, delta)?.into_reply(),
            Command::FlushAll { .. } => {
                self.storage.flush();
                Reply::Ok
            }
            Command::Version => Reply::Version(crate::VERSION.to_string()),
            Command::Stats => self.cmd_stats(),
            Command::Quit => Reply::Close,
        };

        if noreply {
            return Ok(Reply::Silent);
        }
        Ok(reply)
    }

    // ========================================================================
    // Storage Commands
    // ========================================================================

    fn cmd_store(&self, mode: StoreMode, key: Bytes, value: Value, exptime: i64) -> Reply {
        let ttl = ttl_from_exptime(exptime);

        let stored = match mode {
            StoreMode::Set => self.storage.put(key, value, ttl),
            StoreMode::Add => self.storage.put_if_absent(key, value, ttl),
            StoreMode::Replace => self.storage.put_if_present(key, value, ttl),
            // flags and exptime are ignored, the item keeps its own
            StoreMode::Append => self.storage.append(key, &value.data),
            StoreMode::Prepend => self.storage.prepend(key, &value.data),
        };

        if stored {
            Reply::Stored
        } else {
            Reply::NotStored
        }
    }

    // ========================================================================
    // Retrieval and Update
    // ========================================================================

    fn cmd_get(&self, keys: Vec<Bytes>) -> Reply {
        let values = keys
            .into_iter()
            .filter_map(|key| {
                let value = self.storage.get(&key)?;
                Some((key, value))
            })
            .collect();
        Reply::Values(values)
    }

    fn cmd_delete(&self, key: &[u8]) -> Reply {
        if self.storage.delete(key) {
            Reply::Deleted
        } else {
            Reply::NotFound
        }
    }

    // ========================================================================
    // Server Commands
    // ========================================================================

    fn cmd_stats(&self) -> Reply {
        let connections = self.stats.snapshot();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let stats = vec![
            ("pid", std::process::id().to_string()),
            ("uptime", self.start_time.elapsed().as_secs().to_string()),
            ("time", now.to_string()),
            ("version", crate::VERSION.to_string()),
            ("curr_connections", connections.active_connections.to_string()),
            ("total_connections", connections.connections_accepted.to_string()),
            ("cmd_total", connections.commands_processed.to_string()),
            ("cmd_rejected", connections.commands_rejected.to_string()),
            ("bytes_read", connections.bytes_read.to_string()),
            ("bytes_written", connections.bytes_written.to_string()),
            ("curr_items", self.storage.len().to_string()),
        ];

        Reply::Stats(
            stats
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        )
    }
}

trait IntoReply {
    fn into_reply(self) -> Reply;
}

impl IntoReply for Option<u64> {
    fn into_reply(self) -> Reply {
        match self {
            Some(n) => Reply::Number(n),
            None => Reply::NotFound,
        }
    }
}

/// Converts a protocol exptime into a TTL.
///
/// `None` means the item never expires; `Some(Duration::ZERO)` stores an
/// item that is already expired.
pub fn ttl_from_exptime(exptime: i64) -> Option<Duration> {
    match exptime {
        0 => None,
        t if t < 0 => Some(Duration::ZERO),
        t if t <= MAX_RELATIVE_EXPTIME => Some(Duration::from_secs(t as u64)),
        t => {
            let deadline = UNIX_EPOCH + Duration::from_secs(t as u64);
            Some(
                deadline
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
            )
        }
    }
}
