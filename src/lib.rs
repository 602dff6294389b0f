//! # TideKV - An In-Memory Key-Value Server
//!
//! TideKV speaks a subset of the memcached text protocol. Network I/O runs on
//! a small set of edge-triggered reactor threads while commands execute on an
//! elastic thread pool that grows and shrinks with load.
//!
//! ## Features
//!
//! - **Elastic Executor**: Between `low_watermark` and `high_watermark`
//!   threads, a bounded queue and explicit rejection as backpressure
//! - **Edge-Triggered Reactors**: One `mio` poll per worker, connections
//!   balanced round-robin or to the least loaded worker
//! - **Ordered Pipelining**: Replies always leave in request order
//! - **Graceful Shutdown**: In-flight commands finish and their replies are
//!   flushed before sockets close
//! - **TTL Support**: Lazy expiry on access plus a background sweeper
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                TideKV                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌──────────────────┐    ┌───────────────────────┐   │
//! │  │  Acceptor   │───>│ Worker (reactor) │───>│ Executor (pool)       │   │
//! │  │ (listener)  │    │ Connection state │    │  CommandHandler       │   │
//! │  └─────────────┘    └──────────────────┘    └──────────┬────────────┘   │
//! │                              ▲   replies               │                │
//! │                              └─────────────────────────┤                │
//! │                                                        ▼                │
//! │                     ┌──────────────────────────────────────────────┐    │
//! │                     │              StorageEngine                   │    │
//! │                     │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │    │
//! │                     │  │Shard 0 │ │Shard 1 │ │Shard 2 │ │...N    │ │    │
//! │                     │  └────────┘ └────────┘ └────────┘ └────────┘ │    │
//! │                     └──────────────────────────────────────────────┘    │
//! │                                        ▲                                │
//! │                     ┌──────────────────┴───────────────────┐            │
//! │                     │   ExpirySweeper (background task)    │            │
//! │                     └──────────────────────────────────────┘            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tidekv::server::{Server, ServerConfig};
//! use tidekv::storage::StorageEngine;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(StorageEngine::new());
//! let server = Server::new(ServerConfig::default(), storage);
//! server.start().unwrap();
//!
//! // ... serve until shutdown is requested ...
//!
//! server.stop();
//! ```
//!
//! ## Supported Commands
//!
//! - `set|add|replace|append|prepend <key> <flags> <exptime> <bytes> [noreply]`
//! - `get|gets <key> [<key> ...]`
//! - `delete <key> [noreply]`
//! - `incr|decr <key> <delta> [noreply]`
//! - `flush_all [noreply]`
//! - `stats`, `version`, `quit`
//!
//! ## Module Overview
//!
//! - [`concurrency`]: The elastic executor
//! - [`protocol`]: Text protocol parser and reply types
//! - [`storage`]: Thread-safe storage engine with TTL support
//! - [`commands`]: Command execution against a [`storage::Storage`]
//! - [`connection`]: Per-connection state machine
//! - [`server`]: Acceptor, reactor workers and the [`server::Server`] facade

pub mod commands;
pub mod concurrency;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use concurrency::{Executor, ExecutorConfig};
pub use connection::{Connection, ConnectionStats};
pub use protocol::{Command, ParseError, Parser, Reply};
pub use server::{Balancer, Server, ServerConfig, ServerError};
pub use storage::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper, Storage, StorageEngine};

/// The default port TideKV listens on (same as memcached)
pub const DEFAULT_PORT: u16 = 11211;

/// The default host TideKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of TideKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
