//! Debounced background writer
//!
//! One named thread per table. Mutations arm a deadline on the command
//! channel; the worker sleeps in `recv_deadline` and flushes when the
//! deadline passes without being pushed further out.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use setstore_common::{Error, Result, SchedulerConfig};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Something the worker can ask to persist its pending changes
pub trait Flush: Send + Sync + 'static {
    /// Write the current state if it has unwritten changes
    fn flush_pending(&self);
}

/// Completion hook run once the final drain flush has finished
pub type DrainCallback = Box<dyn FnOnce() + Send + 'static>;

/// Quiet-period policy bounded by a latency ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebouncePolicy {
    debounce: Duration,
    max_delay: Duration,
}

impl DebouncePolicy {
    pub const fn new(debounce: Duration, max_delay: Duration) -> Self {
        Self {
            debounce,
            max_delay,
        }
    }

    pub const fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.debounce(), config.max_delay())
    }

    pub const fn debounce(&self) -> Duration {
        self.debounce
    }

    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// How long to wait before writing, given the oldest unwritten mutation.
    ///
    /// Zero once the ceiling has been reached.
    pub fn delay(&self, first_dirty: Instant, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(first_dirty);
        if elapsed >= self.max_delay {
            Duration::ZERO
        } else {
            self.debounce.min(self.max_delay - elapsed)
        }
    }
}

enum Command {
    /// Flush at the given instant unless re-armed or cancelled first
    Arm(Instant),
    Cancel,
    /// Flush, run the callback, exit
    Drain(Option<DrainCallback>),
}

/// Handle to the background writer thread
pub struct WriteScheduler {
    name: String,
    policy: DebouncePolicy,
    tx: Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WriteScheduler {
    /// Start the worker thread
    pub fn spawn(
        name: impl Into<String>,
        config: &SchedulerConfig,
        flusher: Arc<dyn Flush>,
    ) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = unbounded();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(&rx, flusher.as_ref()))
            .map_err(Error::Io)?;

        debug!("Started writer thread {}", name);
        Ok(Self {
            name,
            policy: DebouncePolicy::from_config(config),
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub const fn policy(&self) -> &DebouncePolicy {
        &self.policy
    }

    /// (Re-)arm the timer for a table first dirtied at `first_dirty`.
    ///
    /// Returns false if the worker has already exited.
    pub fn arm(&self, first_dirty: Instant) -> bool {
        let now = Instant::now();
        let delay = self.policy.delay(first_dirty, now);
        if delay.is_zero() {
            debug!("{}: latency ceiling reached, flushing now", self.name);
        } else {
            debug!("{}: flush scheduled in {:?}", self.name, delay);
        }
        self.tx.send(Command::Arm(now + delay)).is_ok()
    }

    /// Disarm the timer without flushing
    pub fn cancel(&self) {
        let _ = self.tx.send(Command::Cancel);
    }

    /// Ask the worker to flush once more, run `on_done` and stop.
    ///
    /// Hands the callback back if the worker is gone.
    pub fn drain(
        &self,
        on_done: Option<DrainCallback>,
    ) -> std::result::Result<(), Option<DrainCallback>> {
        self.tx.send(Command::Drain(on_done)).map_err(|e| match e.0 {
            Command::Drain(cb) => cb,
            _ => None,
        })
    }

    /// Check if the worker thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the worker to exit. Only returns once a drain was requested.
    pub fn join(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("Writer thread {} panicked", self.name);
        }
    }
}

impl std::fmt::Debug for WriteScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteScheduler")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn run_worker(rx: &Receiver<Command>, flusher: &dyn Flush) {
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => rx.recv_deadline(at),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(Command::Arm(at)) => deadline = Some(at),
            Ok(Command::Cancel) => deadline = None,
            Ok(Command::Drain(on_done)) => {
                flusher.flush_pending();
                if let Some(on_done) = on_done {
                    on_done();
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                deadline = None;
                flusher.flush_pending();
            }
            Err(RecvTimeoutError::Disconnected) => {
                if deadline.is_some() {
                    flusher.flush_pending();
                }
                break;
            }
        }
    }

    info!(
        "Writer thread {} stopped",
        thread::current().name().unwrap_or("<unnamed>")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[derive(Default)]
    struct CountingFlush {
        calls: AtomicUsize,
    }

    impl Flush for CountingFlush {
        fn flush_pending(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(debounce_ms: u64, max_delay_ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            debounce_ms,
            max_delay_ms,
        }
    }

    fn spawn(debounce_ms: u64, max_delay_ms: u64) -> (WriteScheduler, Arc<CountingFlush>) {
        let flusher = Arc::new(CountingFlush::default());
        let scheduler = WriteScheduler::spawn(
            "test-writer",
            &config(debounce_ms, max_delay_ms),
            flusher.clone(),
        )
        .unwrap();
        (scheduler, flusher)
    }

    #[test]
    fn test_policy_delay() {
        let policy = DebouncePolicy::new(Duration::from_millis(200), Duration::from_millis(2000));
        let start = Instant::now();

        assert_eq!(policy.delay(start, start), Duration::from_millis(200));
        assert_eq!(
            policy.delay(start, start + Duration::from_millis(1900)),
            Duration::from_millis(100)
        );
        assert_eq!(
            policy.delay(start, start + Duration::from_millis(2000)),
            Duration::ZERO
        );
        assert_eq!(
            policy.delay(start, start + Duration::from_secs(10)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_fires_after_debounce() {
        let (scheduler, flusher) = spawn(50, 1000);
        assert!(scheduler.arm(Instant::now()));

        thread::sleep(Duration::from_millis(250));
        assert_eq!(flusher.calls.load(Ordering::SeqCst), 1);

        scheduler.drain(None).ok();
        scheduler.join();
    }

    #[test]
    fn test_rearm_coalesces() {
        let (scheduler, flusher) = spawn(100, 5000);
        let first = Instant::now();
        for _ in 0..5 {
            scheduler.arm(first);
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(flusher.calls.load(Ordering::SeqCst), 0);

        thread::sleep(Duration::from_millis(400));
        assert_eq!(flusher.calls.load(Ordering::SeqCst), 1);

        scheduler.drain(None).ok();
        scheduler.join();
    }

    #[test]
    fn test_cancel_disarms() {
        let (scheduler, flusher) = spawn(50, 1000);
        scheduler.arm(Instant::now());
        scheduler.cancel();

        thread::sleep(Duration::from_millis(200));
        assert_eq!(flusher.calls.load(Ordering::SeqCst), 0);

        scheduler.drain(None).ok();
        scheduler.join();
    }

    #[test]
    fn test_ceiling_flushes_immediately() {
        let (scheduler, flusher) = spawn(100, 100);
        let first_dirty = Instant::now();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(
            scheduler.policy().delay(first_dirty, Instant::now()),
            Duration::ZERO
        );

        scheduler.arm(first_dirty);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(flusher.calls.load(Ordering::SeqCst), 1);

        scheduler.drain(None).ok();
        scheduler.join();
    }

    #[test]
    fn test_drain_runs_callback_and_stops() {
        let (scheduler, flusher) = spawn(10_000, 10_000);
        scheduler.arm(Instant::now());

        let (done_tx, done_rx) = mpsc::channel();
        let callback: DrainCallback = Box::new(move || done_tx.send(()).unwrap());
        assert!(scheduler.drain(Some(callback)).is_ok());

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        scheduler.join();
        assert!(scheduler.is_finished());
        assert_eq!(flusher.calls.load(Ordering::SeqCst), 1);

        // The worker is gone; the callback comes back to the caller.
        let callback: DrainCallback = Box::new(|| {});
        assert!(matches!(scheduler.drain(Some(callback)), Err(Some(_))));
        assert!(!scheduler.arm(Instant::now()));
    }
}
