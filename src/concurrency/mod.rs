//! Concurrency Primitives
//!
//! This module provides the elastic thread pool that executes parsed commands
//! off the I/O reactor threads.
//!
//! ## Architecture
//!
//! ```text
//!   Worker (reactor)            Executor
//!  ┌──────────────┐   execute  ┌─────────────────────────────────┐
//!  │ parsed cmd   │───────────>│ bounded FIFO ──> pool threads   │
//!  └──────────────┘   (bool)   │ (max_queue)     (low..=high)    │
//!                              └─────────────────────────────────┘
//! ```
//!
//! `execute` returning `false` is the backpressure signal: the pool is either
//! saturated or stopped.

pub mod executor;

pub use executor::{Executor, ExecutorConfig, ExecutorState, ExecutorStats, Task};
