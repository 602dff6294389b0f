//! Connection Module
//!
//! This module manages individual client connections to TideKV. A
//! [`Connection`] is a non-blocking socket plus the protocol state machine
//! around it; it is driven by exactly one reactor thread
//! ([`Worker`](crate::server::Worker)) and by executor tasks that run its
//! requests one at a time.
//!
//! ## Architecture
//!
//! ```text
//!   Worker (reactor thread)                  Executor thread
//!  ┌──────────────────────────┐            ┌──────────────────────┐
//!  │ readable ──> do_read()   │            │ CommandHandler       │
//!  │   parser ──> lane        │ take_req() │   .execute()         │
//!  │                          │───────────>│                      │
//!  │ writable ──> do_write()  │            │ complete(reply)      │
//!  │   answers ──> socket     │<───────────│   answers + re-arm   │
//!  └──────────────────────────┘            └──────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Partial reads**: headers and data blocks may arrive split across packets
//! - **Pipelining**: many requests per packet, answered in arrival order
//! - **Partial writes**: short writes resume from the stored offset
//! - **Statistics**: Tracks connection and command metrics

pub mod handler;
pub mod stats;

pub use handler::{
    Connection, ConnectionState, InFlightGuard, MAX_PENDING_BYTES, MAX_PENDING_REQUESTS,
};
pub use stats::{ConnectionStats, ConnectionStatsSnapshot};
