//! The global lock, per-thread state, and the freeze protocol.
//!
//! All core-internal code runs under one process-wide recursive lock.
//! Recursion depth is tracked per thread, so reentry never blocks, and
//! the depth doubles as the "are we inside core code?" flag that routes
//! allocations and interception decisions.
//!
//! While a fault is serviced, every other user thread must be frozen:
//! each is sent the access-violation signal, which lands it in the
//! handler, which blocks on this lock. A thread already parked in the
//! kernel is just as safe — it cannot touch user memory until it runs
//! again, and when it runs it will be signalled. The wait for each
//! thread is bounded; on timeout the fault proceeds and logs, a known
//! race inherited by design (a thread can mask the signal behind our
//! back via raw syscalls). Frozen threads get a cancellation ticket so
//! their handler invocation exits as soon as it wins the lock.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};
use tracing::{debug, trace, warn};

use crate::sysinfo::{state_is_parked, thread_state};

/// Default per-thread freeze timeout.
pub const FREEZE_TIMEOUT_MS: u64 = 1000;

/// Per-thread state, shared between the thread itself and the freezer.
pub struct ThreadRecord {
    /// Pthread handle, used for signal delivery.
    pub(crate) pthread: libc::pthread_t,
    /// Kernel thread id, used for run-state queries.
    pub(crate) tid: i32,
    /// The thread is parked waiting for the global lock.
    blocked: AtomicBool,
    /// Outstanding orders to leave the signal handler immediately.
    cancel: AtomicU32,
    /// Core-internal threads are never frozen.
    internal: bool,
    dead: AtomicBool,
}

impl ThreadRecord {
    /// Consume one cancellation ticket, if any.
    pub fn must_bail(&self) -> bool {
        self.cancel
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn tid(&self) -> i32 {
        self.tid
    }
}

thread_local! {
    static LOCK_DEPTH: Cell<u32> = const { Cell::new(0) };
    static MY_RECORD: std::cell::OnceCell<Arc<ThreadRecord>> =
        const { std::cell::OnceCell::new() };
}

/// Delivers the freeze signal. Injectable so the freeze protocol can be
/// tested without a live signal handler.
pub trait FreezeSignaller: Send + Sync {
    /// Deliver the access-violation signal to a thread. `Err(())` means
    /// the thread no longer exists.
    fn interrupt(&self, pthread: libc::pthread_t) -> std::result::Result<(), ()>;
}

/// Real delivery via `pthread_kill(SIGSEGV)`.
pub struct SegvSignaller;

impl FreezeSignaller for SegvSignaller {
    fn interrupt(&self, pthread: libc::pthread_t) -> std::result::Result<(), ()> {
        match nix::sys::pthread::pthread_kill(pthread, nix::sys::signal::Signal::SIGSEGV) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Err(()),
            Err(err) => {
                warn!(?err, "freeze signal delivery failed");
                Ok(())
            }
        }
    }
}

/// Test hook into the freeze wait: lets a test pin a thread as
/// (not-)quiescent regardless of what the OS reports, to exercise the
/// timeout race deterministically.
pub trait FreezeProbe: Send + Sync {
    /// `None` defers to the real blocked/parked detection.
    fn is_quiescent(&self, _tid: i32) -> Option<bool> {
        None
    }
}

/// The default probe: always defer to reality.
pub struct NoFreezeProbe;

impl FreezeProbe for NoFreezeProbe {}

/// What a freeze wave did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FreezeReport {
    /// Threads signalled this wave.
    pub signalled: usize,
    /// Threads observed frozen (blocked or parked).
    pub frozen: usize,
    /// Threads that never acknowledged within the timeout.
    pub timed_out: usize,
    /// Dead threads dropped from the registry.
    pub removed_dead: usize,
}

/// The process-wide lock plus the registry of live threads.
pub struct CoreSync {
    lock: RawMutex,
    records: Mutex<Vec<Arc<ThreadRecord>>>,
    freeze_timeout_ms: u64,
}

impl Default for CoreSync {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreSync {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: RawMutex::INIT,
            records: Mutex::new(Vec::new()),
            freeze_timeout_ms: FREEZE_TIMEOUT_MS,
        }
    }

    #[must_use]
    pub fn with_freeze_timeout(mut self, ms: u64) -> Self {
        self.freeze_timeout_ms = ms;
        self
    }

    pub(crate) fn insert_record(
        &self,
        pthread: libc::pthread_t,
        tid: i32,
        internal: bool,
    ) -> Arc<ThreadRecord> {
        let record = Arc::new(ThreadRecord {
            pthread,
            tid,
            blocked: AtomicBool::new(false),
            cancel: AtomicU32::new(0),
            internal,
            dead: AtomicBool::new(false),
        });
        self.records.lock().push(record.clone());
        record
    }

    /// This thread's record, registering it on first touch.
    pub fn current_record(&self, internal: bool) -> Arc<ThreadRecord> {
        MY_RECORD.with(|cell| {
            cell.get_or_init(|| {
                let pthread = nix::sys::pthread::pthread_self();
                let tid = nix::unistd::gettid().as_raw();
                trace!(tid, internal, "registering thread");
                self.insert_record(pthread, tid, internal)
            })
            .clone()
        })
    }

    /// True while the calling thread holds the lock (any depth).
    #[must_use]
    pub fn in_core(&self) -> bool {
        LOCK_DEPTH.with(|d| d.get() > 0)
    }

    /// Enter the critical section, recursively.
    pub fn enter(&self) {
        let depth = LOCK_DEPTH.with(Cell::get);
        if depth == 0 {
            let record = self.current_record(false);
            record.blocked.store(true, Ordering::Release);
            self.lock.lock();
            record.blocked.store(false, Ordering::Release);
        }
        LOCK_DEPTH.with(|d| d.set(depth + 1));
    }

    /// Leave the critical section.
    pub fn exit(&self) {
        let depth = LOCK_DEPTH.with(Cell::get);
        debug_assert!(depth > 0, "unbalanced lock exit");
        LOCK_DEPTH.with(|d| d.set(depth - 1));
        if depth == 1 {
            // SAFETY: this thread holds the lock (depth was 1).
            unsafe { self.lock.unlock() };
        }
    }

    /// Run `f` inside the critical section.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter();
        let result = f();
        self.exit();
        result
    }

    /// Freeze every other user thread. Call with the lock held.
    pub fn freeze_peer_threads(
        &self,
        signaller: &dyn FreezeSignaller,
        probe: &dyn FreezeProbe,
    ) -> FreezeReport {
        let me = nix::unistd::gettid().as_raw();
        let mut report = FreezeReport::default();

        // Order every running, non-internal peer thread into its signal
        // handler, where it will block on the global lock. Delivery
        // failure means the thread died; drop it.
        let snapshot: Vec<Arc<ThreadRecord>> = self.records.lock().clone();
        for record in &snapshot {
            if record.tid == me
                || record.internal
                || record.dead.load(Ordering::Acquire)
                || record.is_blocked()
            {
                continue;
            }
            trace!(tid = record.tid, "signalling thread to freeze");
            match signaller.interrupt(record.pthread) {
                Ok(()) => report.signalled += 1,
                Err(()) => {
                    record.dead.store(true, Ordering::Release);
                    report.removed_dead += 1;
                }
            }
        }
        if report.removed_dead > 0 {
            self.records
                .lock()
                .retain(|r| !r.dead.load(Ordering::Acquire));
        }

        // Wait until each is blocked on the lock or parked in the
        // kernel, bounded per thread.
        let started = Instant::now();
        for record in &snapshot {
            if record.tid == me || record.internal || record.dead.load(Ordering::Acquire) {
                continue;
            }
            loop {
                let quiescent = probe.is_quiescent(record.tid).unwrap_or_else(|| {
                    record.is_blocked() || state_is_parked(thread_state(record.tid))
                });
                if quiescent {
                    report.frozen += 1;
                    break;
                }
                if started.elapsed().as_millis() as u64 > self.freeze_timeout_ms {
                    // Proceed anyway: the alternative is hanging the
                    // whole process behind a thread that may have
                    // masked the signal through a raw syscall.
                    warn!(
                        tid = record.tid,
                        timeout_ms = self.freeze_timeout_ms,
                        "thread failed to freeze; proceeding"
                    );
                    report.timed_out += 1;
                    break;
                }
                std::thread::yield_now();
            }
        }

        // Every frozen thread leaves its handler immediately once it
        // wins the lock.
        for record in &snapshot {
            if record.tid == me || record.internal || record.dead.load(Ordering::Acquire) {
                continue;
            }
            record.cancel.fetch_add(1, Ordering::AcqRel);
        }
        debug!(?report, "freeze wave complete");
        report
    }

    /// Number of registered live threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.records.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct MockSignaller {
        delivered: AtomicUsize,
        dead_pthread: Option<libc::pthread_t>,
    }

    impl MockSignaller {
        fn new(dead_pthread: Option<libc::pthread_t>) -> Self {
            Self {
                delivered: AtomicUsize::new(0),
                dead_pthread,
            }
        }
    }

    impl FreezeSignaller for MockSignaller {
        fn interrupt(&self, pthread: libc::pthread_t) -> std::result::Result<(), ()> {
            if Some(pthread) == self.dead_pthread {
                return Err(());
            }
            self.delivered.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Probe that pins given tids as already quiescent (or stuck).
    struct PinProbe {
        quiescent: bool,
    }

    impl FreezeProbe for PinProbe {
        fn is_quiescent(&self, _tid: i32) -> Option<bool> {
            Some(self.quiescent)
        }
    }

    #[test]
    fn lock_is_recursive_per_thread() {
        let sync = CoreSync::new();
        assert!(!sync.in_core());
        sync.enter();
        assert!(sync.in_core());
        sync.enter();
        sync.exit();
        assert!(sync.in_core(), "still held at depth 1");
        sync.exit();
        assert!(!sync.in_core());
    }

    #[test]
    fn with_runs_inside_the_lock() {
        let sync = CoreSync::new();
        let nested = sync.with(|| sync.with(|| sync.in_core()));
        assert!(nested);
        assert!(!sync.in_core());
    }

    #[test]
    fn lock_excludes_other_threads() {
        let sync = Arc::new(CoreSync::new());
        let witness = Arc::new(AtomicU32::new(0));

        sync.enter();
        let handle = {
            let sync = Arc::clone(&sync);
            let witness = Arc::clone(&witness);
            std::thread::spawn(move || {
                sync.with(|| witness.store(1, Ordering::Release));
            })
        };
        // The spawned thread cannot get in while we hold the lock.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(witness.load(Ordering::Acquire), 0);
        sync.exit();
        handle.join().unwrap();
        assert_eq!(witness.load(Ordering::Acquire), 1);
    }

    #[test]
    fn freeze_skips_self_internal_and_blocked() {
        let sync = CoreSync::new();
        let _me = sync.current_record(false);
        let internal = sync.insert_record(11, 1001, true);
        let blocked = sync.insert_record(12, 1002, false);
        blocked.blocked.store(true, Ordering::Release);

        let signaller = MockSignaller::new(None);
        let report = sync.freeze_peer_threads(&signaller, &PinProbe { quiescent: true });
        // Internal skipped entirely; blocked not re-signalled but still
        // counted frozen and ticketed.
        assert_eq!(report.signalled, 0);
        assert_eq!(report.frozen, 1);
        assert_eq!(signaller.delivered.load(Ordering::Relaxed), 0);
        assert!(blocked.must_bail());
        assert!(!blocked.must_bail(), "one ticket per wave");
        assert!(!internal.must_bail(), "internal threads get no ticket");
    }

    #[test]
    fn dead_threads_are_pruned_during_the_wave() {
        let sync = CoreSync::new();
        let _me = sync.current_record(false);
        let _ghost = sync.insert_record(99, 9999, false);
        assert_eq!(sync.thread_count(), 2);

        let signaller = MockSignaller::new(Some(99));
        let report = sync.freeze_peer_threads(&signaller, &PinProbe { quiescent: true });
        assert_eq!(report.removed_dead, 1);
        assert_eq!(sync.thread_count(), 1);
    }

    #[test]
    fn unacknowledged_threads_time_out_and_the_wave_proceeds() {
        let sync = CoreSync::new().with_freeze_timeout(30);
        let _me = sync.current_record(false);
        let stuck = sync.insert_record(55, 5555, false);

        let signaller = MockSignaller::new(None);
        let report = sync.freeze_peer_threads(&signaller, &PinProbe { quiescent: false });
        assert_eq!(report.signalled, 1);
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.frozen, 0);
        // The straggler still gets a cancellation ticket for whenever
        // it finally enters the handler.
        assert!(stuck.must_bail());
    }

    #[test]
    fn cancellation_tickets_accumulate_across_waves() {
        let sync = CoreSync::new();
        let _me = sync.current_record(false);
        let peer = sync.insert_record(77, 7777, false);

        let signaller = MockSignaller::new(None);
        let probe = PinProbe { quiescent: true };
        sync.freeze_peer_threads(&signaller, &probe);
        sync.freeze_peer_threads(&signaller, &probe);
        assert!(peer.must_bail());
        assert!(peer.must_bail());
        assert!(!peer.must_bail());
    }
}
