//! I/O Reactor Worker
//!
//! A [`Worker`] owns one edge-triggered `mio::Poll` and the connections
//! registered on it. Its thread waits for readiness, runs the connection read
//! and write paths, and hands complete requests to the shared [`Executor`].
//!
//! ## Event Handling
//!
//! ```text
//!  poll ──> snapshot events ──> for each token:
//!              stale token          -> ignored
//!              error / hangup       -> on_error  (immediate close)
//!              readable / rd-closed -> do_read   (EOF: graceful close)
//!              writable             -> do_write
//!           then dispatch queued requests; dead connections are removed
//! ```
//!
//! ## Shutdown
//!
//! [`Worker::stop`] wakes the reactor, which moves every connection to
//! `Closing` and keeps serving until all of them finish or the drain timeout
//! expires; whatever is left is then closed forcibly.

use crate::concurrency::Executor;
use crate::connection::{Connection, InFlightGuard};
use crate::protocol::Reply;
use crate::server::table::{ConnectionTable, WAKER_TOKEN};
use crate::server::ServerError;
use mio::event::Event;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Reactor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Capacity of the readiness event buffer
    pub max_events: usize,
    /// How long a stopping worker waits for connections to finish
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_events: 1024,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EventSnapshot {
    token: Token,
    flags: u8,
}

const EVENT_FLAG_READABLE: u8 = 1 << 0;
const EVENT_FLAG_WRITABLE: u8 = 1 << 1;
const EVENT_FLAG_READ_CLOSED: u8 = 1 << 2;
const EVENT_FLAG_WRITE_CLOSED: u8 = 1 << 3;
const EVENT_FLAG_ERROR: u8 = 1 << 4;

impl EventSnapshot {
    fn from_mio_event(event: &Event) -> Self {
        let mut flags = 0;
        if event.is_readable() {
            flags |= EVENT_FLAG_READABLE;
        }
        if event.is_writable() {
            flags |= EVENT_FLAG_WRITABLE;
        }
        if event.is_read_closed() {
            flags |= EVENT_FLAG_READ_CLOSED;
        }
        if event.is_write_closed() {
            flags |= EVENT_FLAG_WRITE_CLOSED;
        }
        if event.is_error() {
            flags |= EVENT_FLAG_ERROR;
        }
        Self {
            token: event.token(),
            flags,
        }
    }

    /// Error, hangup or reset. A half-close of the peer's write side is not
    /// a failure; it arrives through the read path as EOF.
    fn failed(self) -> bool {
        self.flags & (EVENT_FLAG_ERROR | EVENT_FLAG_WRITE_CLOSED) != 0
    }

    fn readable(self) -> bool {
        self.flags & (EVENT_FLAG_READABLE | EVENT_FLAG_READ_CLOSED) != 0
    }

    fn writable(self) -> bool {
        self.flags & EVENT_FLAG_WRITABLE != 0
    }
}

/// State shared between the worker handle and its reactor thread.
struct Shared {
    id: usize,
    registry: Arc<Registry>,
    waker: Waker,
    table: Mutex<ConnectionTable>,
    connections: AtomicUsize,
    stopping: AtomicBool,
    running: AtomicBool,
    #[cfg(test)]
    fail_poll: AtomicBool,
}

impl Shared {
    fn remove(&self, token: Token) -> Option<Arc<Connection>> {
        let removed = self.table.lock().remove(token);
        if removed.is_some() {
            self.connections.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }
}

/// One I/O reactor thread and the connections registered on it.
pub struct Worker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("connections", &self.connection_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Worker {
    /// Creates the poll instance and spawns the reactor thread `tidekv-io-{id}`.
    pub fn start(
        id: usize,
        executor: Arc<Executor>,
        config: WorkerConfig,
    ) -> Result<Self, ServerError> {
        let poll = Poll::new()?;
        let registry = Arc::new(poll.registry().try_clone()?);
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            id,
            registry,
            waker,
            table: Mutex::new(ConnectionTable::new()),
            connections: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            running: AtomicBool::new(true),
            #[cfg(test)]
            fail_poll: AtomicBool::new(false),
        });

        let thread = thread::Builder::new()
            .name(format!("tidekv-io-{}", id))
            .spawn({
                let shared = Arc::clone(&shared);
                move || reactor_loop(poll, shared, executor, config)
            })?;

        debug!(worker = id, "Worker started");

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Takes ownership of `connection` and registers it on this reactor.
    ///
    /// On failure the connection is closed.
    pub fn register(&self, connection: Connection) -> Result<Token, ServerError> {
        let connection = Arc::new(connection);
        let mut table = self.shared.table.lock();

        // Checked under the table lock so an exiting reactor never misses it
        if self.shared.stopping.load(Ordering::Acquire)
            || !self.shared.running.load(Ordering::Acquire)
        {
            connection.force_close();
            return Err(ServerError::WorkerStopped(self.shared.id));
        }

        let Some(token) = table.insert(Arc::clone(&connection)) else {
            connection.force_close();
            return Err(ServerError::TableFull(self.shared.id));
        };

        if let Err(e) = connection.start(Arc::clone(&self.shared.registry), token) {
            table.remove(token);
            connection.force_close();
            return Err(ServerError::Register(e));
        }

        self.shared.connections.fetch_add(1, Ordering::Relaxed);
        Ok(token)
    }

    /// Removes the connection registered under `token` and closes it.
    ///
    /// Returns false if the token is stale.
    pub fn deregister(&self, token: Token) -> bool {
        match self.shared.remove(token) {
            Some(connection) => {
                connection.force_close();
                true
            }
            None => false,
        }
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Returns false once the reactor thread has exited.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Asks the reactor to drain its connections and exit. Does not block.
    pub fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.shared.waker.wake() {
            warn!(worker = self.shared.id, error = %e, "Failed to wake reactor");
        }
    }

    /// Waits for the reactor thread to exit.
    pub fn join(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.join().is_err() {
            error!(worker = self.shared.id, "Reactor thread panicked");
        }
    }

    /// Makes the next `poll` call fail, which kills the reactor.
    #[cfg(test)]
    pub(crate) fn fail_poll(&self) {
        self.shared.fail_poll.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn reactor_loop(mut poll: Poll, shared: Arc<Shared>, executor: Arc<Executor>, config: WorkerConfig) {
    let mut events = Events::with_capacity(config.max_events.max(1));
    let mut drain_deadline: Option<Instant> = None;

    loop {
        let timeout = drain_deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let polled = poll.poll(&mut events, timeout);
        #[cfg(test)]
        let polled = if shared.fail_poll.load(Ordering::Acquire) {
            Err(std::io::Error::other("poll failure"))
        } else {
            polled
        };
        if let Err(e) = polled {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(worker = shared.id, error = %e, "Poll failed, stopping worker");
            break;
        }

        let snapshots: Vec<EventSnapshot> =
            events.iter().map(EventSnapshot::from_mio_event).collect();

        for snapshot in snapshots {
            if snapshot.token == WAKER_TOKEN {
                continue;
            }
            let Some(connection) = shared.table.lock().get(snapshot.token) else {
                trace!(worker = shared.id, token = snapshot.token.0, "Event for stale token");
                continue;
            };

            if snapshot.failed() {
                connection.on_error();
            } else {
                if snapshot.readable() {
                    connection.do_read();
                }
                if snapshot.writable() {
                    connection.do_write();
                }
            }

            dispatch(&connection, &executor);
            if !connection.is_alive() {
                shared.remove(snapshot.token);
            }
        }

        if shared.stopping.load(Ordering::Acquire) {
            let deadline = match drain_deadline {
                Some(deadline) => deadline,
                None => {
                    begin_drain(&shared, &executor);
                    let deadline = Instant::now() + config.drain_timeout;
                    drain_deadline = Some(deadline);
                    deadline
                }
            };

            let remaining = shared.table.lock().len();
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    worker = shared.id,
                    remaining, "Drain timeout, closing remaining connections"
                );
                break;
            }
        }
    }

    let leftover = {
        let mut table = shared.table.lock();
        shared.running.store(false, Ordering::Release);
        table.drain()
    };
    shared.connections.store(0, Ordering::Relaxed);
    for connection in leftover {
        connection.force_close();
    }

    info!(worker = shared.id, "Worker stopped");
}

/// Moves every connection to `Closing`; idle ones close right away.
fn begin_drain(shared: &Shared, executor: &Arc<Executor>) {
    let entries = shared.table.lock().entries();
    debug!(worker = shared.id, connections = entries.len(), "Draining connections");

    for (token, connection) in entries {
        connection.on_close();
        dispatch(&connection, executor);
        if !connection.is_alive() {
            shared.remove(token);
        }
    }
}

/// Submits the connection's next request to the executor, if it may run one.
///
/// The task that executes it calls `dispatch` again once its reply is queued,
/// so a connection never has more than one request running.
pub fn dispatch(connection: &Arc<Connection>, executor: &Arc<Executor>) {
    let Some((command, data)) = connection.take_request() else {
        return;
    };

    let task_connection = Arc::clone(connection);
    let task_executor = Arc::clone(executor);
    let accepted = executor.execute(move || {
        let guard = InFlightGuard::new(Arc::clone(&task_connection));
        let connection = task_connection;
        let reply = connection
            .handler()
            .execute(command, data)
            .unwrap_or_else(|e| {
                debug!(client = %connection.peer_addr(), error = %e, "Command failed");
                e.reply()
            });
        guard.complete(reply);
        dispatch(&connection, &task_executor);
    });

    if !accepted {
        connection.stats().command_rejected();
        warn!(client = %connection.peer_addr(), "Executor rejected request, closing connection");
        connection.abort(Reply::server_error("busy"));
    }
}
