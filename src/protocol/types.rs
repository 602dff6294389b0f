//! Memcached Text Protocol Data Types
//!
//! This module defines the commands a client can send and the replies the
//! server sends back.
//!
//! ## Protocol Format
//!
//! Every command is a single header line terminated by CRLF. Storage
//! commands are followed by a data block of exactly `<bytes>` bytes and
//! another CRLF:
//!
//! ```text
//! set <key> <flags> <exptime> <bytes> [noreply]\r\n
//! <data block>\r\n
//! ```
//!
//! ## Examples
//!
//! Store: `set name 0 0 4\r\nAriz\r\n` → `STORED\r\n`
//! Retrieve: `get name\r\n` → `VALUE name 0 4\r\nAriz\r\nEND\r\n`
//! Counter: `incr hits 1\r\n` → `2\r\n`

use crate::storage::Value;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// The CRLF terminator used by the text protocol
pub const CRLF: &[u8] = b"\r\n";

/// Which storage command a [`Command::Store`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store unconditionally
    Set,
    /// Store only if the key is absent
    Add,
    /// Store only if the key exists
    Replace,
    /// Append data to an existing value
    Append,
    /// Prepend data to an existing value
    Prepend,
}

impl StoreMode {
    pub fn name(&self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
            StoreMode::Append => "append",
            StoreMode::Prepend => "prepend",
        }
    }
}

/// A fully parsed command header.
///
/// Storage commands still need their data block, whose length is
/// [`Command::body_len`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Store {
        mode: StoreMode,
        key: Bytes,
        flags: u32,
        exptime: i64,
        bytes: usize,
        noreply: bool,
    },
    Get {
        keys: Vec<Bytes>,
    },
    Delete {
        key: Bytes,
        noreply: bool,
    },
    Incr {
        key: Bytes,
        delta: u64,
        noreply: bool,
    },
    Decr {
        key: Bytes,
        delta: u64,
        noreply: bool,
    },
    FlushAll {
        noreply: bool,
    },
    Version,
    Stats,
    Quit,
}

impl Command {
    /// Returns the command name as sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Store { mode, .. } => mode.name(),
            Command::Get { .. } => "get",
            Command::Delete { .. } => "delete",
            Command::Incr { .. } => "incr",
            Command::Decr { .. } => "decr",
            Command::FlushAll { .. } => "flush_all",
            Command::Version => "version",
            Command::Stats => "stats",
            Command::Quit => "quit",
        }
    }

    /// Length of the data block that follows the header, if any.
    pub fn body_len(&self) -> Option<usize> {
        match self {
            Command::Store { bytes, .. } => Some(*bytes),
            _ => None,
        }
    }

    /// Returns true if the client asked for no reply.
    pub fn noreply(&self) -> bool {
        match self {
            Command::Store { noreply, .. }
            | Command::Delete { noreply, .. }
            | Command::Incr { noreply, .. }
            | Command::Decr { noreply, .. }
            | Command::FlushAll { noreply } => *noreply,
            _ => false,
        }
    }
}

/// A reply to a single command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Stored,
    NotStored,
    Deleted,
    NotFound,
    Ok,
    /// `VALUE <key> <flags> <bytes>` blocks followed by `END`
    Values(Vec<(Bytes, Value)>),
    /// Result of INCR/DECR
    Number(u64),
    Version(String),
    /// `STAT <name> <value>` lines followed by `END`
    Stats(Vec<(String, String)>),
    /// Unknown command
    Error,
    ClientError(String),
    ServerError(String),
    /// Nothing is written (`noreply`)
    Silent,
    /// Nothing is written and the connection closes (`quit`)
    Close,
}

impl Reply {
    pub fn client_error(msg: impl Into<String>) -> Self {
        Reply::ClientError(msg.into())
    }

    pub fn server_error(msg: impl Into<String>) -> Self {
        Reply::ServerError(msg.into())
    }

    /// Serializes the reply to bytes for sending over the wire.
    ///
    /// `Silent` and `Close` serialize to an empty buffer.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf);
        buf.freeze()
    }

    /// Serializes the reply into an existing buffer.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        match self {
            Reply::Stored => buf.put_slice(b"STORED\r\n"),
            Reply::NotStored => buf.put_slice(b"NOT_STORED\r\n"),
            Reply::Deleted => buf.put_slice(b"DELETED\r\n"),
            Reply::NotFound => buf.put_slice(b"NOT_FOUND\r\n"),
            Reply::Ok => buf.put_slice(b"OK\r\n"),
            Reply::Values(values) => {
                for (key, value) in values {
                    buf.put_slice(b"VALUE ");
                    buf.put_slice(key);
                    buf.put_slice(format!(" {} {}", value.flags, value.data.len()).as_bytes());
                    buf.put_slice(CRLF);
                    buf.put_slice(&value.data);
                    buf.put_slice(CRLF);
                }
                buf.put_slice(b"END\r\n");
            }
            Reply::Number(n) => {
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            Reply::Version(version) => {
                buf.put_slice(b"VERSION ");
                buf.put_slice(version.as_bytes());
                buf.put_slice(CRLF);
            }
            Reply::Stats(stats) => {
                for (name, value) in stats {
                    buf.put_slice(format!("STAT {} {}", name, value).as_bytes());
                    buf.put_slice(CRLF);
                }
                buf.put_slice(b"END\r\n");
            }
            Reply::Error => buf.put_slice(b"ERROR\r\n"),
            Reply::ClientError(msg) => {
                buf.put_slice(b"CLIENT_ERROR ");
                buf.put_slice(msg.as_bytes());
                buf.put_slice(CRLF);
            }
            Reply::ServerError(msg) => {
                buf.put_slice(b"SERVER_ERROR ");
                buf.put_slice(msg.as_bytes());
                buf.put_slice(CRLF);
            }
            Reply::Silent | Reply::Close => {}
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Values(values) => write!(f, "({} values)", values.len()),
            Reply::Stats(stats) => write!(f, "({} stats)", stats.len()),
            Reply::Silent => write!(f, "(silent)"),
            Reply::Close => write!(f, "(close)"),
            other => {
                let bytes = other.serialize();
                write!(f, "{}", String::from_utf8_lossy(bytes.trim_ascii_end()))
            }
        }
    }
}
