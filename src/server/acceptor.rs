//! Accept Loop
//!
//! The acceptor thread owns the listening socket. It accepts until the
//! listener would block, wraps each socket in a [`Connection`] and hands it
//! to a worker chosen by the [`Balancer`].

use crate::commands::CommandHandler;
use crate::connection::Connection;
use crate::server::worker::Worker;
use crate::server::{Balancer, ServerError};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Pause before retrying after an accept error such as running out of file
/// descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Handle to the running accept thread.
pub(crate) struct Acceptor {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl Acceptor {
    pub(crate) fn start(
        mut listener: TcpListener,
        workers: Arc<[Worker]>,
        balancer: Balancer,
        handler: CommandHandler,
    ) -> Result<Self, ServerError> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let stop = Arc::new(AtomicBool::new(false));

        let thread = thread::Builder::new()
            .name("tidekv-accept".to_string())
            .spawn({
                let stop = Arc::clone(&stop);
                move || accept_loop(poll, listener, workers, balancer, handler, stop)
            })?;

        Ok(Self {
            stop,
            waker,
            thread: Some(thread),
        })
    }

    /// Stops accepting and waits for the thread; the listener closes with it.
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake accept loop");
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Accept thread panicked");
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    mut poll: Poll,
    listener: TcpListener,
    workers: Arc<[Worker]>,
    balancer: Balancer,
    handler: CommandHandler,
    stop: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(16);
    let mut next = 0usize;
    let mut backing_off = false;

    loop {
        let timeout = backing_off.then_some(ACCEPT_BACKOFF);
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "Listener poll failed, no longer accepting");
            break;
        }
        if stop.load(Ordering::Acquire) {
            break;
        }

        // A failed accept leaves the edge consumed, so retry on the timer too
        let ready = backing_off || events.iter().any(|event| event.token() == LISTENER);
        if ready {
            backing_off = accept_pending(&listener, &workers, balancer, &handler, &mut next);
        }
    }

    info!("Accept loop stopped");
}

/// Accepts until the listener would block.
///
/// Returns true if an accept error needs a back-off before the next attempt.
fn accept_pending(
    listener: &TcpListener,
    workers: &[Worker],
    balancer: Balancer,
    handler: &CommandHandler,
    next: &mut usize,
) -> bool {
    loop {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => match AcceptStep::after_error(&e) {
                AcceptStep::Drained => return false,
                AcceptStep::Retry => continue,
                AcceptStep::Backoff => {
                    warn!(
                        error = %e,
                        backoff_ms = ACCEPT_BACKOFF.as_millis() as u64,
                        "Accept failed, retrying after back-off"
                    );
                    return true;
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let Some(worker) = balancer.pick(workers, next) else {
            error!(client = %addr, "No running worker, dropping connection");
            continue;
        };
        let connection = Connection::new(stream, addr, handler.clone());
        match worker.register(connection) {
            Ok(token) => debug!(
                client = %addr,
                worker = worker.id(),
                token = token.0,
                "Accepted connection"
            ),
            Err(e) => warn!(client = %addr, error = %e, "Failed to register connection"),
        }
    }
}

/// What the accept loop does after `accept` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptStep {
    /// Nothing left to accept until the next readiness edge
    Drained,
    /// Transient, accept again right away
    Retry,
    /// Resource exhaustion or an unexpected error
    Backoff,
}

impl AcceptStep {
    fn after_error(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::WouldBlock => AcceptStep::Drained,
            io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => AcceptStep::Retry,
            _ => AcceptStep::Backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::{Executor, ExecutorConfig};
    use crate::connection::ConnectionStats;
    use crate::server::WorkerConfig;
    use crate::storage::StorageEngine;
    use std::io::Read;
    use std::net::TcpStream;
    use std::time::Instant;

    #[test]
    fn test_accept_error_classification() {
        let step = |kind: io::ErrorKind| AcceptStep::after_error(&io::Error::from(kind));
        assert_eq!(step(io::ErrorKind::WouldBlock), AcceptStep::Drained);
        assert_eq!(step(io::ErrorKind::Interrupted), AcceptStep::Retry);
        assert_eq!(step(io::ErrorKind::ConnectionAborted), AcceptStep::Retry);
        assert_eq!(step(io::ErrorKind::PermissionDenied), AcceptStep::Backoff);

        // EMFILE: out of file descriptors
        let emfile = io::Error::from_raw_os_error(24);
        assert_eq!(AcceptStep::after_error(&emfile), AcceptStep::Backoff);
    }

    #[test]
    fn test_accept_drops_connections_without_running_workers() {
        let executor = Arc::new(Executor::new("accept", ExecutorConfig::default()));
        let worker = Worker::start(0, Arc::clone(&executor), WorkerConfig::default()).unwrap();
        worker.stop();
        worker.join();
        let workers: Arc<[Worker]> = Arc::from(vec![worker]);

        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(ConnectionStats::new());
        let handler = CommandHandler::new(Arc::new(StorageEngine::new()), Arc::clone(&stats));

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();

        // The listener may see the connection a moment after connect returns
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut next = 0;
        let mut buf = [0u8; 16];
        let closed = loop {
            assert!(!accept_pending(&listener, &workers, Balancer::RoundRobin, &handler, &mut next));
            match client.read(&mut buf) {
                Ok(n) => break n == 0,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => break e.kind() == io::ErrorKind::ConnectionReset,
            }
        };
        assert!(closed);
        assert_eq!(stats.snapshot().connections_accepted, 0);
        executor.stop(true);
    }
}
