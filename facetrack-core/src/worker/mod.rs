//! worker — long-lived background threads for the CV pipeline
//!
//! One native thread per worker, parked on a condvar between work items.  The
//! orchestrator never waits on a worker: it peeks with [`Worker::try_lock`],
//! and if the worker is mid-computation the tick simply moves on and re-polls
//! next time.  A worker blocks only itself.
//!
//! Retired workers are not torn down; [`Worker::request_suspend`] keeps the
//! thread alive but idle so the pool can hand it out again without paying the
//! spawn cost.  Only [`Worker::stop`] (or drop) ends the thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tracing::{debug, warn};

/// One unit of background work on whatever state has been staged under the
/// worker's lock.
pub trait WorkStep: Send + 'static {
    fn run(&mut self);
}

struct Shared<S> {
    step: Mutex<S>,
    cond: Condvar,
    stop: AtomicBool,
    suspend: AtomicBool,
}

/// A background thread running `S::run` once per signal.
pub struct Worker<S: WorkStep> {
    shared: Arc<Shared<S>>,
    thread: Option<JoinHandle<()>>,
    name: String,
}

impl<S: WorkStep> Worker<S> {
    /// Wrap `step`; the thread is not spawned until [`start`](Self::start).
    pub fn new(name: impl Into<String>, step: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                step: Mutex::new(step),
                cond: Condvar::new(),
                stop: AtomicBool::new(false),
                suspend: AtomicBool::new(false),
            }),
            thread: None,
            name: name.into(),
        }
    }

    /// Spawn the thread if it is not already running, clearing the stop and
    /// suspend flags.  Restarting a suspended (pooled) worker reuses the
    /// existing thread and just wakes it.
    pub fn start(&mut self) {
        self.shared.stop.store(false, Ordering::Release);
        self.shared.suspend.store(false, Ordering::Release);

        if self.thread.is_some() {
            let _held = self.lock();
            self.shared.cond.notify_one();
            return;
        }

        debug!(worker = %self.name, "starting worker thread");
        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker_loop(&shared))
            // A process that cannot spawn its worker threads cannot do
            // anything useful; treat this as an invariant violation.
            .expect("failed to spawn worker thread");
        self.thread = Some(thread);
    }

    /// Request termination, wake the thread and join it.  Safe to call when
    /// the worker was never started.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        debug!(worker = %self.name, "stopping worker thread");
        {
            let _held = self.lock();
            self.shared.stop.store(true, Ordering::Release);
            self.shared.cond.notify_one();
        }
        if thread.join().is_err() {
            warn!(worker = %self.name, "worker thread terminated abnormally");
        }
    }

    /// Blocking lock; only used around start/stop handshakes.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.shared.step.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The orchestrator's staging primitive: take the lock only if the worker
    /// is parked.  `None` means the worker is busy and this tick should skip
    /// it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, S>> {
        match self.shared.step.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    /// Wake the thread to run one work step.  Callers stage input under
    /// [`try_lock`](Self::try_lock) first.
    pub fn signal(&self) {
        self.shared.cond.notify_one();
    }

    /// Keep the thread alive but make it skip work steps until the next
    /// [`start`](Self::start).  Used when a worker is moved to the idle pool.
    pub fn request_suspend(&self) {
        self.shared.suspend.store(true, Ordering::Release);
    }
}

impl<S: WorkStep> Drop for Worker<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<S: WorkStep>(shared: &Shared<S>) {
    let mut guard = shared.step.lock().unwrap_or_else(PoisonError::into_inner);
    while !shared.stop.load(Ordering::Acquire) {
        if !shared.suspend.load(Ordering::Acquire) {
            // A failed CV cycle must never take the thread down with it.
            let step = &mut *guard;
            if catch_unwind(AssertUnwindSafe(|| step.run())).is_err() {
                warn!("worker step panicked; skipping this cycle");
            }
        }
        guard = shared
            .cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

// ── Log burst suppression ────────────────────────────────────────────────────

/// Counter that admits a log line on the first failure of a streak and then
/// once every `period` consecutive failures; a success resets it.
#[derive(Debug, Default)]
pub struct ErrorBurst {
    streak: u32,
}

impl ErrorBurst {
    const PERIOD: u32 = 30;

    /// Record a failure; true when this one should be logged.
    pub fn failed(&mut self) -> bool {
        self.streak += 1;
        self.streak == 1 || self.streak % Self::PERIOD == 0
    }

    pub fn succeeded(&mut self) {
        self.streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    struct CountingStep {
        runs: Arc<AtomicU32>,
    }

    impl WorkStep for CountingStep {
        fn run(&mut self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Blocks inside `run` until released, to simulate a slow CV call.
    struct BlockingStep {
        release: mpsc::Receiver<()>,
        entered: mpsc::Sender<()>,
    }

    impl WorkStep for BlockingStep {
        fn run(&mut self) {
            let _ = self.entered.send(());
            let _ = self.release.recv();
        }
    }

    fn wait_for(runs: &AtomicU32, at_least: u32) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while runs.load(Ordering::SeqCst) < at_least {
            assert!(Instant::now() < deadline, "worker never ran");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stage-and-signal once the worker has parked; try_lock can race the
    /// worker still holding its lock right after a run.
    fn signal_when_parked<S: WorkStep>(w: &Worker<S>) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(_g) = w.try_lock() {
                w.signal();
                return;
            }
            assert!(Instant::now() < deadline, "worker never parked");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn runs_once_per_signal() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut w = Worker::new("test-count", CountingStep { runs: Arc::clone(&runs) });
        w.start();
        wait_for(&runs, 1);

        signal_when_parked(&w);
        wait_for(&runs, 2);
        w.stop();
    }

    #[test]
    fn stop_without_start_is_safe() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut w = Worker::new("test-nostart", CountingStep { runs });
        w.stop();
        w.stop();
    }

    #[test]
    fn try_lock_fails_while_busy_and_returns_promptly() {
        let (release_tx, release_rx) = mpsc::channel();
        let (entered_tx, entered_rx) = mpsc::channel();
        let mut w = Worker::new(
            "test-busy",
            BlockingStep { release: release_rx, entered: entered_tx },
        );
        w.start();
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // The worker is wedged inside run(); the orchestrator must not stall.
        let t0 = Instant::now();
        for _ in 0..100 {
            assert!(w.try_lock().is_none());
        }
        assert!(t0.elapsed() < Duration::from_millis(100));

        release_tx.send(()).unwrap();
        w.stop();
    }

    #[test]
    fn suspend_skips_work_until_restarted() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut w = Worker::new("test-suspend", CountingStep { runs: Arc::clone(&runs) });
        w.start();
        wait_for(&runs, 1);

        w.request_suspend();
        signal_when_parked(&w);
        std::thread::sleep(Duration::from_millis(20));
        let after_suspend = runs.load(Ordering::SeqCst);

        // Restart wakes the same thread and work resumes.
        w.start();
        wait_for(&runs, after_suspend + 1);
        w.stop();
    }

    #[test]
    fn error_burst_logs_first_then_every_period() {
        let mut b = ErrorBurst::default();
        assert!(b.failed());
        for _ in 0..28 {
            assert!(!b.failed());
        }
        assert!(b.failed()); // 30th
        b.succeeded();
        assert!(b.failed()); // streak restarts
    }
}
