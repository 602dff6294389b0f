//! Network Server
//!
//! The server ties the pieces together: one accept thread, a fixed set of
//! reactor [`Worker`]s and one shared [`Executor`].
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────┐
//!   clients ────> │  accept thread   │  (listener + waker)
//!                 └────────┬─────────┘
//!                          │ Balancer: round-robin / least-loaded
//!          ┌───────────────┼───────────────┐
//!          ▼               ▼               ▼
//!   ┌────────────┐  ┌────────────┐  ┌────────────┐
//!   │ tidekv-io-0│  │ tidekv-io-1│  │ tidekv-io-N│   edge-triggered poll each
//!   └─────┬──────┘  └─────┬──────┘  └─────┬──────┘
//!         └───────────────┼───────────────┘
//!                         ▼
//!               ┌──────────────────┐
//!               │     Executor     │ ──> CommandHandler ──> dyn Storage
//!               └──────────────────┘
//! ```
//!
//! ## Shutdown Order
//!
//! 1. stop accepting (the listener closes)
//! 2. stop every worker; each drains its connections
//! 3. join the workers
//! 4. stop the executor and wait for its threads

mod acceptor;
pub mod table;
pub mod worker;

pub use table::ConnectionTable;
pub use worker::{dispatch, Worker, WorkerConfig};

use crate::commands::CommandHandler;
use crate::concurrency::{Executor, ExecutorConfig, ExecutorStats};
use crate::connection::{ConnectionStats, ConnectionStatsSnapshot};
use crate::storage::Storage;
use acceptor::Acceptor;
use mio::net::TcpListener;
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors raised while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid listen address: {0}")]
    InvalidAddress(String),

    #[error("server already started")]
    AlreadyStarted,

    #[error("worker {0} is stopping")]
    WorkerStopped(usize),

    #[error("worker {0} has no free connection slots")]
    TableFull(usize),

    #[error("failed to register connection: {0}")]
    Register(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How the accept loop picks a worker for a new connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Balancer {
    /// Cycle through the workers
    #[default]
    RoundRobin,
    /// The worker with the fewest registered connections; ties go to the lowest id
    LeastLoaded,
}

impl Balancer {
    /// Picks a running worker. `next` is the round-robin cursor kept by the
    /// caller.
    ///
    /// Returns `None` when no worker is running.
    pub fn pick<'a>(&self, workers: &'a [Worker], next: &mut usize) -> Option<&'a Worker> {
        match self {
            Balancer::RoundRobin => (0..workers.len()).find_map(|_| {
                let worker = &workers[*next % workers.len()];
                *next = next.wrapping_add(1);
                worker.is_running().then_some(worker)
            }),
            Balancer::LeastLoaded => workers
                .iter()
                .filter(|worker| worker.is_running())
                .min_by_key(|worker| worker.connection_count()),
        }
    }
}

impl std::str::FromStr for Balancer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round-robin" | "roundrobin" | "rr" => Ok(Balancer::RoundRobin),
            "least-loaded" | "leastloaded" | "ll" => Ok(Balancer::LeastLoaded),
            other => Err(format!("unknown balancer: {}", other)),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Number of reactor threads
    pub workers: usize,
    pub balancer: Balancer,
    pub executor: ExecutorConfig,
    /// Readiness events handled per poll call
    pub max_events: usize,
    /// How long shutdown waits for connections to finish
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            workers: num_cpus::get().max(1),
            balancer: Balancer::default(),
            executor: ExecutorConfig::default(),
            max_events: 1024,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Returns the bind address string.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_events: self.max_events,
            drain_timeout: self.drain_timeout,
        }
    }
}

/// Point-in-time view of a running server.
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub connections: ConnectionStatsSnapshot,
    /// Registered connections per worker
    pub worker_connections: Vec<usize>,
    /// `None` unless the server is running
    pub executor: Option<ExecutorStats>,
}

struct Running {
    local_addr: SocketAddr,
    acceptor: Acceptor,
    workers: Arc<[Worker]>,
    executor: Arc<Executor>,
}

enum State {
    Idle,
    Running(Running),
    Stopped,
}

/// The TideKV network server.
///
/// # Example
///
/// ```no_run
/// use tidekv::server::{Server, ServerConfig};
/// use tidekv::storage::StorageEngine;
/// use std::sync::Arc;
///
/// let server = Server::new(ServerConfig::default(), Arc::new(StorageEngine::new()));
/// server.start().unwrap();
/// println!("listening on {:?}", server.local_addr());
/// server.stop();
/// ```
pub struct Server {
    config: ServerConfig,
    handler: CommandHandler,
    state: Mutex<State>,
}

impl Server {
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Self {
        let stats = Arc::new(ConnectionStats::new());
        Self {
            config,
            handler: CommandHandler::new(storage, stats),
            state: Mutex::new(State::Idle),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listener, starts the executor, the workers and the accept thread.
    ///
    /// A server starts at most once.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        if !matches!(*state, State::Idle) {
            return Err(ServerError::AlreadyStarted);
        }

        let bind_address = self.config.bind_address();
        let addr = bind_address
            .to_socket_addrs()
            .map_err(|e| ServerError::InvalidAddress(format!("{}: {}", bind_address, e)))?
            .next()
            .ok_or_else(|| ServerError::InvalidAddress(bind_address.clone()))?;

        let listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind {
            addr: bind_address.clone(),
            source,
        })?;
        let local_addr = listener.local_addr()?;

        let executor = Arc::new(Executor::new(
            "tidekv-exec",
            self.config.executor.clone().validate(),
        ));

        let workers = (0..self.config.workers.max(1))
            .map(|id| Worker::start(id, Arc::clone(&executor), self.config.worker_config()))
            .collect::<Result<Vec<_>, _>>()?;
        let workers: Arc<[Worker]> = workers.into();

        let acceptor = Acceptor::start(
            listener,
            Arc::clone(&workers),
            self.config.balancer,
            self.handler.clone(),
        )?;

        info!(
            addr = %local_addr,
            workers = workers.len(),
            balancer = ?self.config.balancer,
            "Server listening"
        );

        *state = State::Running(Running {
            local_addr,
            acceptor,
            workers,
            executor,
        });
        Ok(())
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock() {
            State::Running(running) => Some(running.local_addr),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Running(_))
    }

    pub fn stats(&self) -> ServerStats {
        let connections = self.handler.stats().snapshot();
        match &*self.state.lock() {
            State::Running(running) => ServerStats {
                connections,
                worker_connections: running
                    .workers
                    .iter()
                    .map(Worker::connection_count)
                    .collect(),
                executor: Some(running.executor.stats()),
            },
            _ => ServerStats {
                connections,
                worker_connections: Vec::new(),
                executor: None,
            },
        }
    }

    /// Stops the server and waits until every thread has exited.
    ///
    /// Idempotent. Blocks for at most about the drain timeout plus the
    /// longest running command.
    pub fn stop(&self) {
        let running = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Running(running) => running,
                _ => return,
            }
        };

        info!("Shutting down server");
        let Running {
            mut acceptor,
            workers,
            executor,
            ..
        } = running;

        acceptor.stop();
        for worker in workers.iter() {
            worker.stop();
        }
        for worker in workers.iter() {
            worker.join();
        }
        executor.stop(true);

        info!("Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
