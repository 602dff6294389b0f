//! Storage Module
//!
//! The network core reaches storage only through the [`Storage`] trait, from
//! executor threads. [`StorageEngine`] is the default implementation: a
//! sharded key-value store with TTL support, kept tidy by an [`ExpirySweeper`].
//!
//! ## Architecture
//!
//! ```text
//!          executor threads
//!                 │  &dyn Storage
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │...64    │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ shards  │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!              ┌─────────────┴─────────────┐
//!              │     ExpirySweeper         │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use tidekv::storage::{Storage, StorageEngine, Value};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let engine = StorageEngine::new();
//!
//! engine.put(Bytes::from("name"), Value::new("Ariz", 0), None);
//! assert_eq!(engine.get(b"name").map(|v| v.data), Some(Bytes::from("Ariz")));
//!
//! engine.put(
//!     Bytes::from("session"),
//!     Value::new("token123", 0),
//!     Some(Duration::from_secs(3600)),
//! );
//! assert!(!engine.put_if_absent(Bytes::from("session"), Value::new("x", 0), None));
//! ```

pub mod backend;
pub mod engine;
pub mod expiry;

pub use backend::{Storage, StorageError, Value};
pub use engine::{Entry, StorageEngine, StorageStats};
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper};
