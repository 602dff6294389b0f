//! Per-Connection State Machine
//!
//! A [`Connection`] owns one non-blocking client socket. Its read path turns
//! raw bytes into complete requests, its write path streams replies back, and
//! the dispatch methods let executor tasks run one request at a time.
//!
//! ## Connection Lifecycle
//!
//! ```text
//!   accept ──> Open ──(EOF, quit, parse error, busy, server stop)──> Closing
//!               │                                                     │
//!               │ (socket error / hangup)          (nothing in flight, │
//!               │                                   answers flushed)   │
//!               └───────────────────────> Closed <─────────────────────┘
//! ```
//!
//! Only the reactor thread that owns the connection moves it to `Closed`.
//! Executor threads only queue answers and re-arm the socket; re-arming under
//! edge-triggered polling produces a fresh writable event that brings the
//! reactor back to flush the answers and, if closing, finish the close.
//!
//! ## Buffer Management
//!
//! Incoming bytes are fed to the [`Parser`] in 4 KiB chunks. The data block
//! of a storage command is collected into a separate argument buffer; the
//! number of bytes still expected (`arg_remains`) survives across reads, so a
//! value may arrive split over any number of packets. Several commands in one
//! packet (pipelining) are queued on the connection lane in arrival order.
//! Once the lane holds [`MAX_PENDING_REQUESTS`] requests or
//! [`MAX_PENDING_BYTES`] of data, reading pauses and the rest of the input
//! stays in the kernel buffer; it resumes when the lane has drained to half
//! of both limits.
//!
//! Outgoing answers are kept as a queue of serialized replies plus the byte
//! offset already written from the front one, so short writes resume exactly
//! where they stopped.

use crate::commands::CommandHandler;
use crate::connection::ConnectionStats;
use crate::protocol::{take_data_block, Command, ParseError, Parsed, Parser, Reply};
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Size of a single socket read.
const READ_CHUNK_SIZE: usize = 4096;

/// Maximum number of answers handed to one vectored write.
const MAX_WRITE_SLICES: usize = 64;

/// Parsed requests queued on one connection before reading pauses.
pub const MAX_PENDING_REQUESTS: usize = 1024;

/// Data block bytes queued on one connection before reading pauses.
pub const MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Reading, executing and answering
    Open = 0,
    /// No more input; pending work and answers are still flushed
    Closing = 1,
    /// Deregistered and shut down
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// A request waiting on the connection lane.
#[derive(Debug)]
enum Request {
    /// A complete command with its data block
    Command { command: Command, data: Bytes },
    /// Input that could not be parsed; answered, then the connection closes
    Reject(Reply),
}

/// State guarded by the connection lock.
struct Inner {
    socket: TcpStream,
    parser: Parser,
    /// Header of a storage command whose data block is still arriving
    command: Option<Command>,
    /// Bytes of the data block (including its CRLF) still expected
    arg_remains: usize,
    argument: BytesMut,
    /// Parsed requests not yet handed to the executor, in arrival order
    lane: VecDeque<Request>,
    /// Data block bytes held by `lane`
    lane_bytes: usize,
    /// Reading stopped because the lane is full
    read_paused: bool,
    /// A request of this connection is running on the executor
    in_flight: bool,
    /// A reject is queued; further input is ignored
    poisoned: bool,
    answers: VecDeque<Bytes>,
    /// Bytes of `answers.front()` already written
    offset: usize,
    interest: Interest,
    registration: Option<(Arc<Registry>, Token)>,
}

/// A client connection.
///
/// Shared as `Arc<Connection>` between the reactor that owns its registration
/// and the executor task currently running one of its requests.
pub struct Connection {
    state: AtomicU8,
    peer: SocketAddr,
    handler: CommandHandler,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wraps an accepted socket. The connection does nothing until [`start`](Self::start).
    pub fn new(socket: TcpStream, peer: SocketAddr, handler: CommandHandler) -> Self {
        handler.stats().connection_opened();

        Self {
            state: AtomicU8::new(ConnectionState::Open as u8),
            peer,
            handler,
            inner: Mutex::new(Inner {
                socket,
                parser: Parser::new(),
                command: None,
                arg_remains: 0,
                argument: BytesMut::new(),
                lane: VecDeque::new(),
                lane_bytes: 0,
                read_paused: false,
                in_flight: false,
                poisoned: false,
                answers: VecDeque::new(),
                offset: 0,
                interest: Interest::READABLE,
                registration: None,
            }),
        }
    }

    /// Registers the socket for readable events under `token`.
    ///
    /// Fails if the connection is already registered or closed.
    pub fn start(&self, registry: Arc<Registry>, token: Token) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.registration.is_some() || self.state() == ConnectionState::Closed {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "connection already registered",
            ));
        }

        registry.register(&mut inner.socket, token, Interest::READABLE)?;
        inner.interest = Interest::READABLE;
        inner.registration = Some((registry, token));

        info!(client = %self.peer, token = token.0, "Client connected");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns false once the connection is closed.
    pub fn is_alive(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn handler(&self) -> &CommandHandler {
        &self.handler
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        self.handler.stats()
    }

    /// Returns true if answers are waiting to be written.
    pub fn wants_write(&self) -> bool {
        !self.inner.lock().answers.is_empty()
    }

    /// Number of answers not yet fully written.
    pub fn pending_answers(&self) -> usize {
        self.inner.lock().answers.len()
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Drains the socket until it would block.
    ///
    /// Called by the reactor on readable events. Ignored unless the
    /// connection is open.
    pub fn do_read(&self) {
        let mut inner = self.inner.lock();
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        while self.state() == ConnectionState::Open && !inner.poisoned {
            if lane_full(&inner) {
                trace!(
                    client = %self.peer,
                    pending = inner.lane.len(),
                    bytes = inner.lane_bytes,
                    "Lane full, pausing reads"
                );
                inner.read_paused = true;
                break;
            }

            match inner.socket.read(&mut chunk) {
                Ok(0) => {
                    debug!(client = %self.peer, "Client closed its write side");
                    self.begin_closing(&mut inner, false);
                    break;
                }
                Ok(n) => {
                    self.stats().bytes_read(n);
                    self.consume(&mut inner, &chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(&mut inner, &e);
                    return;
                }
            }
        }

        self.finish_if_idle(&mut inner);
    }

    /// Feeds one chunk of input through the parser onto the lane.
    fn consume(&self, inner: &mut Inner, mut data: &[u8]) {
        while !data.is_empty() && !inner.poisoned {
            if inner.arg_remains > 0 {
                let take = inner.arg_remains.min(data.len());
                inner.argument.extend_from_slice(&data[..take]);
                inner.arg_remains -= take;
                data = &data[take..];

                if inner.arg_remains == 0 {
                    let block = inner.argument.split();
                    let request = match (inner.command.take(), take_data_block(block)) {
                        (Some(command), Ok(data)) => Request::Command { command, data },
                        (_, Err(e)) => self.reject(&e),
                        (None, Ok(_)) => Request::Reject(Reply::server_error("lost command")),
                    };
                    self.push_request(inner, request);
                }
                continue;
            }

            match inner.parser.parse(data) {
                Ok(Parsed::Incomplete) => break,
                Ok(Parsed::Complete {
                    command,
                    consumed,
                    body_len,
                }) => {
                    trace!(client = %self.peer, command = command.name(), "Parsed command");
                    data = &data[consumed..];
                    match body_len {
                        Some(len) => {
                            inner.command = Some(command);
                            inner.arg_remains = len + 2;
                            inner.argument.reserve(len + 2);
                        }
                        None => self.push_request(
                            inner,
                            Request::Command {
                                command,
                                data: Bytes::new(),
                            },
                        ),
                    }
                }
                Err(e) => {
                    let request = self.reject(&e);
                    self.push_request(inner, request);
                }
            }
        }
    }

    fn reject(&self, error: &ParseError) -> Request {
        debug!(client = %self.peer, error = %error, "Protocol error");
        Request::Reject(error.reply())
    }

    fn push_request(&self, inner: &mut Inner, request: Request) {
        match &request {
            Request::Command { data, .. } => inner.lane_bytes += data.len(),
            Request::Reject(_) => {
                inner.poisoned = true;
                inner.parser.reset();
                inner.command = None;
                inner.arg_remains = 0;
                inner.argument.clear();
            }
        }
        inner.lane.push_back(request);
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Hands out the next request if none of this connection's requests is
    /// running. The caller must later call [`complete`](Self::complete) or
    /// [`abort`](Self::abort) for it.
    ///
    /// A queued reject is answered here and starts closing the connection.
    pub fn take_request(&self) -> Option<(Command, Bytes)> {
        let mut inner = self.inner.lock();
        if inner.in_flight || self.state() == ConnectionState::Closed {
            return None;
        }

        let request = inner.lane.pop_front()?;
        if let Request::Command { data, .. } = &request {
            inner.lane_bytes -= data.len();
        }
        if inner.read_paused && lane_drained(&inner) {
            // The re-registration reports the unread input as a fresh edge
            inner.read_paused = false;
            self.rearm(&mut inner);
        }

        match request {
            Request::Command { command, data } => {
                inner.in_flight = true;
                Some((command, data))
            }
            Request::Reject(reply) => {
                inner.answers.push_back(reply.serialize());
                self.begin_closing(&mut inner, true);
                self.rearm(&mut inner);
                None
            }
        }
    }

    /// Queues the reply of the in-flight request and re-arms the socket.
    pub fn complete(&self, reply: Reply) {
        let mut inner = self.inner.lock();
        inner.in_flight = false;
        if self.state() == ConnectionState::Closed {
            return;
        }

        match reply {
            Reply::Silent => {}
            Reply::Close => self.begin_closing(&mut inner, true),
            reply => inner.answers.push_back(reply.serialize()),
        }
        self.rearm(&mut inner);
    }

    /// Answers with `reply` instead of running the in-flight request, drops
    /// the rest of the lane and starts closing.
    ///
    /// Used when the executor refuses a request or a task panics.
    pub fn abort(&self, reply: Reply) {
        let mut inner = self.inner.lock();
        inner.in_flight = false;
        if self.state() == ConnectionState::Closed {
            return;
        }

        inner.answers.push_back(reply.serialize());
        self.begin_closing(&mut inner, true);
        self.rearm(&mut inner);
    }

    /// Re-registers for readable and writable events.
    ///
    /// With edge-triggered polling the re-registration reports the socket
    /// as ready again, so the reactor gets an event even if no new data arrives.
    fn rearm(&self, inner: &mut Inner) {
        let interest = Interest::READABLE | Interest::WRITABLE;
        self.reregister(inner, interest);
    }

    fn reregister(&self, inner: &mut Inner, interest: Interest) {
        let Some((registry, token)) = inner.registration.as_ref() else {
            return;
        };
        if let Err(e) = registry.reregister(&mut inner.socket, *token, interest) {
            warn!(client = %self.peer, error = %e, "Failed to re-arm socket");
            return;
        }
        inner.interest = interest;
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Writes queued answers until done or the socket would block.
    pub fn do_write(&self) {
        let mut guard = self.inner.lock();
        if self.state() == ConnectionState::Closed {
            return;
        }

        let inner = &mut *guard;
        while !inner.answers.is_empty() {
            let written = {
                let offset = inner.offset;
                let slices: Vec<IoSlice<'_>> = inner
                    .answers
                    .iter()
                    .take(MAX_WRITE_SLICES)
                    .enumerate()
                    .map(|(i, answer)| {
                        let start = if i == 0 { offset } else { 0 };
                        IoSlice::new(&answer[start..])
                    })
                    .collect();
                inner.socket.write_vectored(&slices)
            };

            match written {
                Ok(0) => {
                    let e = io::Error::from(io::ErrorKind::WriteZero);
                    self.fail(inner, &e);
                    return;
                }
                Ok(n) => {
                    self.stats().bytes_written(n);
                    advance(inner, n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(inner, &e);
                    return;
                }
            }
        }

        if inner.interest.is_writable() {
            self.reregister(inner, Interest::READABLE);
        }
        self.finish_if_idle(inner);
    }

    // ========================================================================
    // Closing
    // ========================================================================

    /// Stops reading; the connection closes once pending work is flushed.
    pub fn on_close(&self) {
        let mut inner = self.inner.lock();
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.begin_closing(&mut inner, false);
        self.finish_if_idle(&mut inner);
    }

    /// Closes immediately, dropping pending requests and answers.
    pub fn on_error(&self) {
        let mut inner = self.inner.lock();
        let error = inner
            .socket
            .take_error()
            .ok()
            .flatten()
            .unwrap_or_else(|| io::Error::from(io::ErrorKind::ConnectionReset));
        self.fail(&mut inner, &error);
    }

    /// Closes immediately without consulting the socket.
    ///
    /// Used when registration fails, when a drain times out and when the
    /// owning reactor dies.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        self.finish_close(&mut inner);
    }

    fn begin_closing(&self, inner: &mut Inner, drop_lane: bool) {
        if drop_lane {
            inner.lane.clear();
            inner.lane_bytes = 0;
        }
        let _ = self.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn fail(&self, inner: &mut Inner, error: &io::Error) {
        match error.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                debug!(client = %self.peer, "Connection reset by client")
            }
            _ => warn!(client = %self.peer, error = %error, "Connection error"),
        }
        self.finish_close(inner);
    }

    fn finish_if_idle(&self, inner: &mut Inner) {
        if self.state() == ConnectionState::Closing
            && !inner.in_flight
            && inner.lane.is_empty()
            && inner.answers.is_empty()
        {
            self.finish_close(inner);
        }
    }

    /// Releases every buffer, deregisters and shuts the socket down. Runs once.
    ///
    /// Callers hold the connection lock, so `Closed` is published only after
    /// the socket is gone.
    fn finish_close(&self, inner: &mut Inner) {
        if self.state() == ConnectionState::Closed {
            return;
        }

        inner.parser.reset();
        inner.command = None;
        inner.arg_remains = 0;
        inner.argument = BytesMut::new();
        inner.lane.clear();
        inner.lane_bytes = 0;
        inner.read_paused = false;
        inner.answers.clear();
        inner.offset = 0;

        if let Some((registry, _)) = inner.registration.take() {
            let _ = registry.deregister(&mut inner.socket);
        }
        // Closing with unread input sends a reset instead of a FIN
        discard_input(&mut inner.socket);
        let _ = inner.socket.shutdown(Shutdown::Both);
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);

        self.stats().connection_closed();
        info!(client = %self.peer, "Client disconnected");
    }

    #[cfg(test)]
    fn lock(&self) -> parking_lot::MutexGuard<'_, Inner> {
        self.inner.lock()
    }
}

fn lane_full(inner: &Inner) -> bool {
    inner.lane.len() >= MAX_PENDING_REQUESTS || inner.lane_bytes >= MAX_PENDING_BYTES
}

fn lane_drained(inner: &Inner) -> bool {
    inner.lane.len() <= MAX_PENDING_REQUESTS / 2 && inner.lane_bytes <= MAX_PENDING_BYTES / 2
}

/// Reads and drops whatever input is immediately available.
fn discard_input(socket: &mut TcpStream) {
    let mut sink = [0u8; READ_CHUNK_SIZE];
    for _ in 0..16 {
        match socket.read(&mut sink) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Drops `n` written bytes from the front of the answer queue.
fn advance(inner: &mut Inner, mut n: usize) {
    while n > 0 {
        let Some(front) = inner.answers.front() else {
            break;
        };
        let remaining = front.len() - inner.offset;
        if n >= remaining {
            n -= remaining;
            inner.answers.pop_front();
            inner.offset = 0;
        } else {
            inner.offset += n;
            n = 0;
        }
    }
}

/// Completes a dispatched request even if the task executing it panics.
///
/// Dropping an unfinished guard aborts the connection with a server error.
pub struct InFlightGuard {
    connection: Arc<Connection>,
    armed: bool,
}

impl InFlightGuard {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            armed: true,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Queues `reply` for the in-flight request.
    pub fn complete(mut self, reply: Reply) {
        self.armed = false;
        self.connection.complete(reply);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.armed {
            self.connection.abort(Reply::server_error("internal error"));
        }
    }
}
