//! The signal-based suspend/resume protocol that brings every
//! non-checkpoint thread to a known, quiescent point so the checkpoint
//! engine can safely read and overwrite the address space.
//!
//! This is the one corner of the crate that is inherently unsafe and
//! inherently platform-specific: it is kept behind the `QuiescePoint`
//! trait so `ThreadRegistry` never calls `libc` directly.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::descriptor::ThreadState;
use crate::error::ThreadsError;
use crate::registry::ThreadRegistry;

/// A thin wrapper over `libc::sem_t`. Chosen over `std::sync::Condvar`
/// because `sem_post` is on the async-signal-safe list and the suspend
/// handler must be able to call it from inside a signal handler; a
/// condvar's notify is not safe there.
pub struct Semaphore(std::cell::UnsafeCell<libc::sem_t>);

// SAFETY: every operation on the inner `sem_t` goes through libc's own
// synchronization; the type is shared only to give threads and the
// signal handler a common place to call from.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub fn new() -> Self {
        let mut sem = std::mem::MaybeUninit::<libc::sem_t>::uninit();
        // SAFETY: `sem_init` with `pshared = 0` initializes a
        // process-private semaphore in freshly allocated storage.
        unsafe {
            libc::sem_init(sem.as_mut_ptr(), 0, 0);
        }
        Self(std::cell::UnsafeCell::new(unsafe { sem.assume_init() }))
    }

    /// Async-signal-safe: may be called from inside the suspend handler.
    pub fn post(&self) {
        // SAFETY: `sem_t` is valid for the lifetime of `self`.
        unsafe {
            libc::sem_post(self.0.get());
        }
    }

    /// Blocks until `post` has been called once, consuming one unit.
    pub fn wait(&self) {
        // SAFETY: `sem_t` is valid for the lifetime of `self`; `sem_wait`
        // only fails with EINTR, which we retry.
        loop {
            let rc = unsafe { libc::sem_wait(self.0.get()) };
            if rc == 0 {
                return;
            }
            if std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
                return;
            }
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: no other thread can hold a reference past this point.
        unsafe {
            libc::sem_destroy(self.0.get());
        }
    }
}

/// The suspend/resume barrier. Targets take the read side while blocked;
/// the checkpoint thread holds the write side for the duration of the
/// quiesced window, then drops it to release everyone at once. The same
/// `pthread_rwlock_t` is reused across cycles: `hold_write`/`release`
/// are always called in strict alternation by the checkpoint thread, so
/// there is never a stale reader left over from a previous cycle.
pub struct ResumeLock(std::sync::Mutex<libc::pthread_rwlock_t>);

// SAFETY: `pthread_rwlock_t` supplies its own internal synchronization;
// wrapping it in a `Mutex` here is only to give the compiler a concrete
// reason to believe accesses are serialized through `&self` methods.
unsafe impl Send for ResumeLock {}
unsafe impl Sync for ResumeLock {}

impl ResumeLock {
    pub fn new() -> Self {
        // SAFETY: `PTHREAD_RWLOCK_INITIALIZER` is a valid static
        // initializer for a process-private rwlock.
        let lock = libc::PTHREAD_RWLOCK_INITIALIZER;
        Self(std::sync::Mutex::new(lock))
    }

    /// Takes the write side, barring readers until `release` is called.
    pub fn hold_write(&self) {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        // SAFETY: the rwlock is initialized and outlives this call
        // because it is owned by `self`.
        unsafe {
            libc::pthread_rwlock_wrlock(&mut *guard);
        }
    }

    /// Releases the write lock, waking every thread blocked in
    /// `block_as_reader`.
    pub fn release(&self) {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        // SAFETY: called by the same thread that took the write lock.
        unsafe {
            libc::pthread_rwlock_unlock(&mut *guard);
        }
    }

    /// Called from inside the suspend handler: blocks the target thread
    /// until the checkpoint thread calls `release`.
    pub fn block_as_reader(&self) {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        // SAFETY: the rwlock is valid for the duration of the call; a
        // reader blocks here exactly until the writer unlocks.
        unsafe {
            libc::pthread_rwlock_rdlock(&mut *guard);
            libc::pthread_rwlock_unlock(&mut *guard);
        }
    }
}

impl Drop for ResumeLock {
    fn drop(&mut self) {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        // SAFETY: no reader or writer can be mid-call once `self` is
        // being dropped; the registry that owns this lock outlives every
        // thread that could reach it.
        unsafe {
            libc::pthread_rwlock_destroy(&mut *guard);
        }
    }
}

/// A per-OS strategy for suspending and resuming a set of threads.
/// `UnixQuiescePoint` is the only implementation today;
/// the trait exists so a future ptrace-based backend — needed on targets
/// that reject in-process signal delivery, e.g. under some seccomp
/// profiles — can be slotted in without touching `ThreadRegistry`.
pub trait QuiescePoint: Send + Sync {
    /// Delivers the suspend signal to the thread identified by `pthread`
    /// (`tid` is carried along only for error reporting). Returns
    /// `Ok(false)` if the thread no longer exists (treated as "it already
    /// exited").
    fn signal_suspend(&self, tid: i32, pthread: libc::pthread_t) -> Result<bool, ThreadsError>;

    /// Zero-signal liveness probe.
    fn probe_alive(&self, pthread: libc::pthread_t) -> bool;

    fn notify(&self) -> &Semaphore;
    fn resume_lock(&self) -> &ResumeLock;
}

/// Both signals are realtime signals (`SIGRTMIN + N`) rather than the
/// fixed `SIGUSR1`/`SIGUSR2` pair, so a hosted game that independently
/// uses those two signals for its own purposes is not starved of them.
pub struct UnixQuiescePoint {
    suspend_signal: i32,
    notify: Semaphore,
    resume: ResumeLock,
    restore_in_progress: AtomicBool,
    active: AtomicI32,
}

impl UnixQuiescePoint {
    /// `signal_offset` is added to `SIGRTMIN` to pick the concrete signal
    /// number, so an embedder whose hosted game independently claims the
    /// harness's default realtime slot can shift it via
    /// `HarnessConfig::suspend_signal_offset`.
    pub fn new(signal_offset: i32) -> Self {
        // SAFETY: `SIGRTMIN()` reads a libc constant table; no
        // preconditions beyond linking against libc.
        let suspend_signal = unsafe { libc::SIGRTMIN() } + signal_offset;
        Self {
            suspend_signal,
            notify: Semaphore::new(),
            resume: ResumeLock::new(),
            restore_in_progress: AtomicBool::new(false),
            active: AtomicI32::new(0),
        }
    }

    pub fn suspend_signal(&self) -> i32 {
        self.suspend_signal
    }

    pub fn set_restore_in_progress(&self, value: bool) {
        self.restore_in_progress.store(value, Ordering::Release);
    }

    pub fn restore_in_progress(&self) -> bool {
        self.restore_in_progress.load(Ordering::Acquire)
    }
}

impl Default for UnixQuiescePoint {
    fn default() -> Self {
        Self::new(0)
    }
}

impl QuiescePoint for UnixQuiescePoint {
    fn signal_suspend(&self, tid: i32, pthread: libc::pthread_t) -> Result<bool, ThreadsError> {
        // SAFETY: `pthread` is the target's own live `pthread_t`; the
        // caller guarantees it is still valid by holding the registry
        // slot. `kill(tid, ...)` would not do here: it is
        // process/thread-group directed, and on Linux a secondary
        // thread's kernel tid is not a tgid, so it would reach the wrong
        // target (or nothing at all, surfacing as a bogus ESRCH).
        let rc = unsafe { libc::pthread_kill(pthread, self.suspend_signal) };
        if rc == 0 {
            return Ok(true);
        }
        if rc == libc::ESRCH {
            return Ok(false);
        }
        // `pthread_kill` returns the error number directly rather than
        // setting `errno`.
        Err(ThreadsError::SignalDeliveryFailed {
            tid,
            signal: self.suspend_signal,
            errno: std::io::Error::from_raw_os_error(rc),
        })
    }

    fn probe_alive(&self, pthread: libc::pthread_t) -> bool {
        // SAFETY: signal `0` delivers nothing, only checks that `pthread`
        // still identifies a live thread.
        unsafe { libc::pthread_kill(pthread, 0) == 0 }
    }

    fn notify(&self) -> &Semaphore {
        &self.notify
    }

    fn resume_lock(&self) -> &ResumeLock {
        &self.resume
    }
}

/// Runs on the checkpoint thread. Repeatedly scans every live thread,
/// signaling each `Running` one and reaping any `Zombie`, until a full
/// pass makes no further progress. Returns the number of threads
/// accounted for (and thus the number of `notify` waits the caller must
/// perform).
pub fn suspend_all(
    registry: &ThreadRegistry,
    quiesce: &UnixQuiescePoint,
) -> Result<usize, ThreadsError> {
    loop {
        let mut changed = false;
        let mut accounted = 0usize;

        for handle in registry.live_handles() {
            let Some(state) = registry.state_of(handle) else {
                continue;
            };

            match state {
                ThreadState::Running => {
                    if registry.try_transition(handle, ThreadState::Running, ThreadState::Signaled) {
                        changed = true;
                        let Some(tid) = registry.tid_of(handle) else {
                            continue;
                        };
                        let Some(pthread) = registry.pthread_of(handle) else {
                            continue;
                        };
                        match quiesce.signal_suspend(tid, pthread) {
                            Ok(true) => {}
                            Ok(false) => {
                                registry.retire(handle);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                ThreadState::Zombie => {
                    if registry.try_transition(handle, ThreadState::Zombie, ThreadState::FakeZombie) {
                        changed = true;
                        registry.join_and_retire(handle);
                    }
                }
                ThreadState::Signaled => {
                    if let Some(pthread) = registry.pthread_of(handle) {
                        if quiesce.probe_alive(pthread) {
                            // Still alive but not yet through its handler
                            // (context not saved, not blocked on resume):
                            // keep rescanning instead of declaring this
                            // pass done.
                            changed = true;
                        } else {
                            registry.retire(handle);
                            changed = true;
                        }
                    }
                }
                ThreadState::SuspendInProgress | ThreadState::Suspended => {
                    accounted += 1;
                }
                // The checkpoint thread never runs the suspend handler on
                // itself, so it must never be counted towards `notify`
                // waits — it is simply not a target of `suspend_all`.
                ThreadState::FakeZombie | ThreadState::CheckpointThread => {}
            }
        }

        if !changed {
            return Ok(accounted);
        }
        std::thread::sleep(std::time::Duration::from_micros(10));
    }
}

/// Waits on `notify` exactly `accounted` times, establishing the
/// happens-before edge between every target's context save and whatever
/// the checkpoint thread reads next.
pub fn wait_for_all_suspended(quiesce: &UnixQuiescePoint, accounted: usize) {
    for _ in 0..accounted {
        quiesce.notify().wait();
    }
}

/// Releases every thread blocked in the suspend handler.
pub fn resume_all(quiesce: &UnixQuiescePoint) {
    quiesce.resume_lock().release();
}
