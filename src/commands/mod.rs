//! Command Handler Module
//!
//! This module implements the command processing layer for TideKV.
//! It receives parsed commands together with their data blocks, executes
//! them against the storage backend, and returns the reply.
//!
//! ## Architecture
//!
//! ```text
//! Connection (reactor thread)
//!       │  parsed Command + data block
//!       ▼
//! ┌─────────────────┐
//! │    Executor     │  (concurrency module)
//! └────────┬────────┘
//!          │ task
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  dyn Storage    │  (storage module)
//! └─────────────────┘
//! ```

pub mod handler;

pub use handler::{ttl_from_exptime, CommandError, CommandHandler};
