//! Elastic Thread Pool
//!
//! The executor runs submitted tasks on a set of OS threads whose size floats
//! between a low and a high watermark.
//!
//! ## Lifecycle of a pool thread
//!
//! ```text
//!   execute() with no free thread
//!            │
//!            ▼
//!   ┌──────────────────┐   task available   ┌──────────────────┐
//!   │ wait (idle_time) │───────────────────>│  run task        │
//!   │  free_threads++  │<───────────────────│  free_threads--  │
//!   └────────┬─────────┘                    └──────────────────┘
//!            │ timeout && threads > low
//!            │ or Stopping && queue empty
//!            ▼
//!        [retire]
//! ```
//!
//! ## Guarantees
//!
//! - `threads_count` never exceeds `high_watermark`.
//! - The queue never holds more than `max_queue_size` tasks.
//! - A panicking task is caught at the thread boundary; the thread keeps serving.
//! - `stop(true)` returns only after every spawned thread has been joined.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Pool sizing and queue limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Threads at or below this count never retire because of idleness
    pub low_watermark: usize,
    /// Hard upper bound on live threads
    pub high_watermark: usize,
    /// Maximum number of queued (not yet claimed) tasks
    pub max_queue_size: usize,
    /// How long an idle thread waits for work before considering retirement
    pub idle_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            low_watermark: cpus,
            high_watermark: cpus * 4,
            max_queue_size: 1024,
            idle_timeout: Duration::from_secs(1),
        }
    }
}

impl ExecutorConfig {
    /// Returns a copy with `high_watermark >= 1` and `low_watermark <= high_watermark`.
    pub fn validate(mut self) -> Self {
        self.high_watermark = self.high_watermark.max(1);
        self.low_watermark = self.low_watermark.min(self.high_watermark);
        self
    }
}

/// Lifecycle of the pool. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Accepting and running tasks
    Running,
    /// No new tasks accepted; queued tasks still drain
    Stopping,
    /// Every pool thread has retired
    Stopped,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorStats {
    pub state: ExecutorState,
    pub threads_count: usize,
    pub free_threads: usize,
    pub queued: usize,
    pub executed: u64,
    pub rejected: u64,
    pub panicked: u64,
}

/// State guarded by the pool lock.
struct Inner {
    state: ExecutorState,
    tasks: VecDeque<Task>,
    threads_count: usize,
    free_threads: usize,
    handles: Vec<JoinHandle<()>>,
    next_thread_id: u64,
}

struct Shared {
    name: String,
    config: ExecutorConfig,
    inner: Mutex<Inner>,
    /// Signaled when a task is queued or the pool starts stopping
    empty_condition: Condvar,
    /// Signaled by the last retiring thread
    stop_condition: Condvar,
    executed: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
}

/// An elastic pool of worker threads with a bounded FIFO task queue.
///
/// # Example
///
/// ```
/// use tidekv::concurrency::{Executor, ExecutorConfig};
/// use std::sync::mpsc;
///
/// let executor = Executor::new("example", ExecutorConfig::default());
/// let (tx, rx) = mpsc::channel();
///
/// assert!(executor.execute(move || tx.send(40 + 2).unwrap()));
/// assert_eq!(rx.recv().unwrap(), 42);
///
/// executor.stop(true);
/// assert!(!executor.execute(|| {}));
/// ```
pub struct Executor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Executor")
            .field("name", &self.shared.name)
            .field("state", &inner.state)
            .field("threads_count", &inner.threads_count)
            .field("free_threads", &inner.free_threads)
            .field("queued", &inner.tasks.len())
            .finish()
    }
}

impl Executor {
    /// Creates a pool with no threads. Threads are spawned on demand by [`Executor::execute`].
    pub fn new(name: impl Into<String>, config: ExecutorConfig) -> Self {
        let config = config.validate();
        let shared = Shared {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: ExecutorState::Running,
                tasks: VecDeque::with_capacity(config.max_queue_size.min(4096)),
                threads_count: 0,
                free_threads: 0,
                handles: Vec::new(),
                next_thread_id: 0,
            }),
            config,
            empty_condition: Condvar::new(),
            stop_condition: Condvar::new(),
            executed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Schedules `task` for execution.
    ///
    /// Returns `false` without side effects when the pool is not running or the
    /// queue already holds `max_queue_size` tasks. The result of the task is not
    /// observed; a task that needs to report back does so itself.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.shared.inner.lock();
        if inner.state != ExecutorState::Running
            || inner.tasks.len() >= self.shared.config.max_queue_size
        {
            self.shared.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if inner.free_threads == 0 && inner.threads_count < self.shared.config.high_watermark {
            if let Err(e) = self.spawn_thread(&mut inner) {
                warn!(pool = %self.shared.name, error = %e, "Failed to spawn pool thread");
                if inner.threads_count == 0 {
                    self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
        }

        inner.tasks.push_back(Box::new(task));
        self.shared.empty_condition.notify_one();
        true
    }

    /// Stops accepting tasks. Queued tasks still run before threads retire.
    ///
    /// With `await_threads` the call blocks until every pool thread has exited
    /// and been joined. It must not be called with `await_threads` from inside
    /// a task running on this pool.
    pub fn stop(&self, await_threads: bool) {
        let mut inner = self.shared.inner.lock();
        if inner.state == ExecutorState::Running {
            inner.state = if inner.threads_count == 0 {
                ExecutorState::Stopped
            } else {
                ExecutorState::Stopping
            };
            info!(
                pool = %self.shared.name,
                threads = inner.threads_count,
                queued = inner.tasks.len(),
                "Executor stopping"
            );
        }
        self.shared.empty_condition.notify_all();

        if !await_threads {
            return;
        }

        while inner.threads_count > 0 {
            self.shared.stop_condition.wait(&mut inner);
        }
        let handles = std::mem::take(&mut inner.handles);
        drop(inner);

        for handle in handles {
            if handle.join().is_err() {
                error!(pool = %self.shared.name, "Pool thread terminated abnormally");
            }
        }
        debug!(pool = %self.shared.name, "All pool threads joined");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExecutorState {
        self.shared.inner.lock().state
    }

    /// Number of live pool threads.
    pub fn threads_count(&self) -> usize {
        self.shared.inner.lock().threads_count
    }

    /// Number of pool threads waiting for work.
    pub fn free_threads(&self) -> usize {
        self.shared.inner.lock().free_threads
    }

    /// Number of queued, unclaimed tasks.
    pub fn queue_len(&self) -> usize {
        self.shared.inner.lock().tasks.len()
    }

    /// The configuration in effect after validation.
    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> ExecutorStats {
        let inner = self.shared.inner.lock();
        ExecutorStats {
            state: inner.state,
            threads_count: inner.threads_count,
            free_threads: inner.free_threads,
            queued: inner.tasks.len(),
            executed: self.shared.executed.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
        }
    }

    /// Spawns one pool thread. Must be called with the pool lock held.
    fn spawn_thread(&self, inner: &mut MutexGuard<'_, Inner>) -> std::io::Result<()> {
        // Reap handles of threads that retired on idle timeout.
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.handles)
            .into_iter()
            .partition(|h| h.is_finished());
        inner.handles = running;
        for handle in finished {
            let _ = handle.join();
        }

        let id = inner.next_thread_id;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.shared.name, id))
            .spawn(move || perform(shared))?;

        inner.next_thread_id += 1;
        inner.threads_count += 1;
        inner.free_threads += 1;
        inner.handles.push(handle);
        trace!(pool = %self.shared.name, thread = id, threads = inner.threads_count, "Spawned pool thread");
        Ok(())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop(false);
    }
}

/// Main loop of every pool thread.
fn perform(shared: Arc<Shared>) {
    let mut inner = shared.inner.lock();

    loop {
        if let Some(task) = inner.tasks.pop_front() {
            inner.free_threads -= 1;
            MutexGuard::unlocked(&mut inner, || run_task(&shared, task));
            inner.free_threads += 1;
            continue;
        }

        if inner.state != ExecutorState::Running {
            break;
        }

        let timed_out = shared
            .empty_condition
            .wait_for(&mut inner, shared.config.idle_timeout)
            .timed_out();

        if timed_out
            && inner.tasks.is_empty()
            && inner.state == ExecutorState::Running
            && inner.threads_count > shared.config.low_watermark
        {
            trace!(pool = %shared.name, threads = inner.threads_count, "Idle pool thread retiring");
            break;
        }
    }

    inner.threads_count -= 1;
    inner.free_threads -= 1;
    if inner.threads_count == 0 && inner.state == ExecutorState::Stopping {
        inner.state = ExecutorState::Stopped;
        shared.stop_condition.notify_all();
        debug!(pool = %shared.name, "Executor stopped");
    }
}

fn run_task(shared: &Shared, task: Task) {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(()) => {
            shared.executed.fetch_add(1, Ordering::Relaxed);
        }
        Err(payload) => {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(pool = %shared.name, panic = %message, "Task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    fn config(low: usize, high: usize, max_queue: usize, idle_ms: u64) -> ExecutorConfig {
        ExecutorConfig {
            low_watermark: low,
            high_watermark: high,
            max_queue_size: max_queue,
            idle_timeout: Duration::from_millis(idle_ms),
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_starts_without_threads() {
        let executor = Executor::new("test", config(2, 4, 8, 50));
        assert_eq!(executor.threads_count(), 0);
        assert_eq!(executor.state(), ExecutorState::Running);
    }

    #[test]
    fn test_executes_task() {
        let executor = Executor::new("test", config(1, 2, 8, 50));
        let (tx, rx) = mpsc::channel();

        assert!(executor.execute(move || tx.send("done").unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "done");

        executor.stop(true);
    }

    #[test]
    fn test_growth_bounded_scenario() {
        // low=2, high=4, max_queue=2: three short tasks spawn at most three threads
        let executor = Executor::new("test", config(2, 4, 2, 50));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            // A full queue is a valid rejection; retry until a thread claims work
            loop {
                let done = Arc::clone(&done);
                let accepted = executor.execute(move || {
                    thread::sleep(Duration::from_millis(20));
                    done.fetch_add(1, Ordering::SeqCst);
                });
                assert!(executor.queue_len() <= 2);
                assert!(executor.threads_count() <= 3);
                if accepted {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }

        assert!(wait_until(Duration::from_secs(2), || done.load(Ordering::SeqCst) == 3));
        assert!(executor.threads_count() <= 3);
        executor.stop(true);
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_rejects_when_queue_full() {
        let executor = Executor::new("test", config(1, 1, 1, 50));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        assert!(executor.execute(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        }));
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        // The only thread is busy: one task fits in the queue, the next does not
        assert!(executor.execute(|| {}));
        assert!(!executor.execute(|| {}));
        assert_eq!(executor.stats().rejected, 1);

        release_tx.send(()).unwrap();
        executor.stop(true);
    }

    #[test]
    fn test_accepts_below_queue_limit_regardless_of_threads() {
        let executor = Executor::new("test", config(1, 1, 3, 50));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();

        assert!(executor.execute(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        }));
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        for _ in 0..3 {
            assert!(executor.execute(|| {}));
        }
        assert!(!executor.execute(|| {}));
        assert_eq!(executor.threads_count(), 1);

        release_tx.send(()).unwrap();
        executor.stop(true);
    }

    #[test]
    fn test_never_exceeds_high_watermark() {
        let executor = Executor::new("test", config(1, 3, 64, 50));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        for _ in 0..20 {
            let release_rx = Arc::clone(&release_rx);
            assert!(executor.execute(move || {
                let _ = release_rx.lock().recv_timeout(Duration::from_millis(200));
            }));
            assert!(executor.threads_count() <= 3);
        }

        drop(release_tx);
        executor.stop(true);
        assert_eq!(executor.threads_count(), 0);
    }

    #[test]
    fn test_execute_fails_after_stop() {
        let executor = Executor::new("test", config(1, 2, 8, 50));
        assert!(executor.execute(|| {}));

        executor.stop(false);
        assert!(!executor.execute(|| {}));

        executor.stop(true);
        assert!(!executor.execute(|| {}));
        assert_eq!(executor.state(), ExecutorState::Stopped);
    }

    #[test]
    fn test_stop_without_threads_is_immediate() {
        let executor = Executor::new("test", config(1, 2, 8, 50));
        executor.stop(false);
        assert_eq!(executor.state(), ExecutorState::Stopped);
    }

    #[test]
    fn test_stop_await_drains_queue() {
        let executor = Executor::new("test", config(1, 1, 16, 50));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let done = Arc::clone(&done);
            assert!(executor.execute(move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        executor.stop(true);
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(executor.threads_count(), 0);
        assert_eq!(executor.state(), ExecutorState::Stopped);
    }

    #[test]
    fn test_idle_threads_retire_down_to_low_watermark() {
        let executor = Executor::new("test", config(1, 4, 16, 30));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let (started_tx, started_rx) = mpsc::channel();

        // Each blocking task forces a new thread because none is free
        for _ in 0..4 {
            let release_rx = Arc::clone(&release_rx);
            let started_tx = started_tx.clone();
            assert!(executor.execute(move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.lock().recv();
            }));
            started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        assert_eq!(executor.threads_count(), 4);

        drop(release_tx);
        assert!(wait_until(Duration::from_secs(2), || executor.threads_count() == 1));

        // The last thread sits at the low watermark and must not retire
        thread::sleep(Duration::from_millis(120));
        assert_eq!(executor.threads_count(), 1);

        executor.stop(true);
    }

    #[test]
    fn test_panicking_task_does_not_kill_pool() {
        let executor = Executor::new("test", config(1, 1, 8, 50));
        assert!(executor.execute(|| panic!("boom")));

        let (tx, rx) = mpsc::channel();
        assert!(executor.execute(move || tx.send(7).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 7);

        assert_eq!(executor.threads_count(), 1);
        executor.stop(true);
        assert_eq!(executor.stats().panicked, 1);
    }

    #[test]
    fn test_counters_invariant_under_load() {
        let executor = Arc::new(Executor::new("test", config(2, 6, 32, 20)));
        let mut submitters = Vec::new();

        for _ in 0..4 {
            let executor = Arc::clone(&executor);
            submitters.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _ = executor.execute(|| thread::sleep(Duration::from_micros(200)));
                    let stats = executor.stats();
                    assert!(stats.free_threads <= stats.threads_count);
                    assert!(stats.threads_count <= 6);
                    assert!(stats.queued <= 32);
                }
            }));
        }
        for s in submitters {
            s.join().unwrap();
        }

        executor.stop(true);
        assert_eq!(executor.threads_count(), 0);
    }

    #[test]
    fn test_config_validate() {
        let cfg = config(8, 0, 1, 10).validate();
        assert_eq!(cfg.high_watermark, 1);
        assert_eq!(cfg.low_watermark, 1);
    }
}
