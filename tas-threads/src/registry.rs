//! The thread registry: an arena of descriptors plus the lifecycle and
//! quiesce entry points built on top of it.
//!
//! Uses a generation-checked arena in place of an intrusive doubly-linked
//! list of thread-info nodes: a dead slot is recycled rather than freed,
//! and a `ThreadHandle` that outlives its slot's recycling is rejected
//! instead of silently aliasing an unrelated thread.

use std::sync::Mutex;

use crate::descriptor::{InheritedFlags, ThreadDescriptor, ThreadState};
use crate::error::ThreadsError;
use crate::quiesce::{self, QuiescePoint, UnixQuiescePoint};

/// A stable reference to one arena slot. `generation` guards against the
/// handle being used after its slot has been recycled for an unrelated
/// thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    index: usize,
    generation: u32,
}

struct Slot {
    generation: u32,
    descriptor: Option<ThreadDescriptor>,
}

struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Arena {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, descriptor: ThreadDescriptor) -> ThreadHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.descriptor = Some(descriptor);
            return ThreadHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len();
        self.slots.push(Slot {
            generation: 0,
            descriptor: Some(descriptor),
        });
        ThreadHandle {
            index,
            generation: 0,
        }
    }

    fn get(&self, handle: ThreadHandle) -> Option<&ThreadDescriptor> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.descriptor.as_ref()
    }

    fn remove(&mut self, handle: ThreadHandle) -> Option<ThreadDescriptor> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let descriptor = slot.descriptor.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        descriptor
    }

    fn live_handles(&self) -> Vec<ThreadHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.descriptor.as_ref().map(|_| ThreadHandle {
                    index,
                    generation: slot.generation,
                })
            })
            .collect()
    }
}

/// The shared, process-wide tracker of every thread the harness knows
/// about. One instance is normally installed once via `tas_core::Core`
/// and reached from signal handlers through that singleton; the registry
/// itself has no global state of its own, so it is equally usable as an
/// ordinary owned value in tests.
pub struct ThreadRegistry {
    arena: Mutex<Arena>,
    quiesce: UnixQuiescePoint,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::with_suspend_signal_offset(0)
    }

    /// Same as `new`, but picks the suspend signal at `SIGRTMIN +
    /// signal_offset` instead of `SIGRTMIN`. Used when
    /// `HarnessConfig::suspend_signal_offset` overrides the default.
    pub fn with_suspend_signal_offset(signal_offset: i32) -> Self {
        Self {
            arena: Mutex::new(Arena::new()),
            quiesce: UnixQuiescePoint::new(signal_offset),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Allocates a descriptor for the calling thread and marks it
    /// `CheckpointThread`: the one thread never suspended by
    /// `suspend_all`. The write-checkpoint signal itself is unblocked by
    /// `tas_core::Core::install`, which is the one place that knows both
    /// reserved signal numbers.
    pub fn init_main(&self) -> ThreadHandle {
        let tid = current_tid();
        #[cfg(unix)]
        let pthread = unsafe { libc::pthread_self() };
        let descriptor = ThreadDescriptor::new(
            tid,
            #[cfg(unix)]
            pthread,
            ThreadState::CheckpointThread,
        );
        self.lock().insert(descriptor)
    }

    /// Called from a newly created thread's own context as its first
    /// act. Unblocks the suspend signal on itself so `suspend_all` can
    /// always reach it, regardless of what mask the thread inherited from
    /// its creator.
    pub fn register_thread(&self, inherit: InheritedFlags) -> ThreadHandle {
        let tid = current_tid();
        #[cfg(unix)]
        let pthread = unsafe { libc::pthread_self() };
        unblock_signal(self.quiesce.suspend_signal());
        let mut descriptor = ThreadDescriptor::new(
            tid,
            #[cfg(unix)]
            pthread,
            ThreadState::Running,
        );
        descriptor.inherited = inherit;
        let handle = self.lock().insert(descriptor);
        self.install_own_altstack(handle);
        handle
    }

    /// Registers this thread's pre-allocated private alternate signal
    /// stack with the kernel, so the suspend
    /// handler runs on it rather than on the thread's own stack — the
    /// precondition that makes it safe for the checkpoint engine to later
    /// overwrite that stack's memory. Each thread must register its own;
    /// `sigaltstack` state is per-thread and cannot be set on another
    /// thread's behalf.
    fn install_own_altstack(&self, handle: ThreadHandle) {
        let Some(desc) = self.lock().get(handle) else {
            return;
        };
        let mut altstack = desc.altstack.lock().unwrap_or_else(|p| p.into_inner());
        let stack = altstack.as_stack_t();
        // SAFETY: `stack` describes memory owned by this descriptor for
        // the lifetime of the thread; registering it only affects the
        // calling thread's own alternate-stack state.
        unsafe {
            libc::sigaltstack(&stack, std::ptr::null_mut());
        }
    }

    /// Spawns an OS thread and registers it before running `f`, so
    /// embedding code that creates its own worker threads (including
    /// tests) gets registration for free.
    pub fn spawn_tracked<F>(self: &std::sync::Arc<Self>, f: F) -> std::thread::JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let registry = std::sync::Arc::clone(self);
        std::thread::spawn(move || {
            let _handle = registry.register_thread(InheritedFlags::default());
            f();
            registry.thread_exit();
        })
    }

    pub fn get(&self, handle: ThreadHandle) -> Option<DescriptorRef<'_>> {
        let guard = self.lock();
        guard.get(handle)?;
        Some(DescriptorRef {
            registry: self,
            handle,
        })
    }

    /// Marks the current thread's descriptor `Zombie`. If it was already
    /// `detach`-ed, recycles the slot immediately.
    pub fn thread_exit(&self) {
        let tid = current_tid();
        let mut guard = self.lock();
        let handle = guard
            .live_handles()
            .into_iter()
            .find(|h| guard.get(*h).is_some_and(|d| d.tid == tid));
        let Some(handle) = handle else { return };
        if let Some(desc) = guard.get(handle) {
            let detached = desc.detached.load(std::sync::atomic::Ordering::Acquire);
            desc.state.compare_and_set(ThreadState::Running, ThreadState::Zombie);
            if detached {
                guard.remove(handle);
            }
        }
    }

    pub fn detach(&self, handle: ThreadHandle) {
        if let Some(desc) = self.lock().get(handle) {
            desc.detached.store(true, std::sync::atomic::Ordering::Release);
            if desc.state.load() == ThreadState::Zombie {
                self.lock().remove(handle);
            }
        }
    }

    pub(crate) fn live_handles(&self) -> Vec<ThreadHandle> {
        self.lock().live_handles()
    }

    pub(crate) fn state_of(&self, handle: ThreadHandle) -> Option<ThreadState> {
        self.lock().get(handle).map(|d| d.state.load())
    }

    pub(crate) fn try_transition(
        &self,
        handle: ThreadHandle,
        from: ThreadState,
        to: ThreadState,
    ) -> bool {
        self.lock()
            .get(handle)
            .is_some_and(|d| d.state.compare_and_set(from, to))
    }

    pub(crate) fn tid_of(&self, handle: ThreadHandle) -> Option<i32> {
        self.lock().get(handle).map(|d| d.tid)
    }

    /// The target's `pthread_t`, needed because `libc::kill` is
    /// process/thread-group directed: on Linux a secondary thread's
    /// kernel tid is not a tgid, so signaling it by tid alone would hit
    /// the wrong target (or nothing). `suspend_all` delivers and probes
    /// via `pthread_kill` using this handle instead.
    #[cfg(unix)]
    pub(crate) fn pthread_of(&self, handle: ThreadHandle) -> Option<libc::pthread_t> {
        self.lock().get(handle).map(|d| d.pthread)
    }

    pub(crate) fn retire(&self, handle: ThreadHandle) {
        self.lock().remove(handle);
    }

    pub(crate) fn join_and_retire(&self, handle: ThreadHandle) {
        #[cfg(unix)]
        if let Some(desc) = self.lock().get(handle) {
            let pthread = desc.pthread;
            // SAFETY: the descriptor is `FakeZombie`, meaning the thread
            // has already returned from its entry point and is only
            // waiting to be joined.
            unsafe {
                let mut retval: *mut libc::c_void = std::ptr::null_mut();
                libc::pthread_join(pthread, &mut retval);
            }
        }
        self.lock().remove(handle);
    }

    /// Drives every non-checkpoint thread to `Suspended` and returns the
    /// count of threads the caller must wait on via the quiesce
    /// semaphore. See `quiesce::suspend_all` for the full algorithm.
    pub fn suspend_all(&self) -> Result<usize, ThreadsError> {
        // Must be held before any suspend signal is sent: a target's
        // `block_as_reader` call has to find the write side already
        // taken, or it would fall straight through instead of blocking.
        self.quiesce.resume_lock().hold_write();
        let accounted = quiesce::suspend_all(self, &self.quiesce)?;
        quiesce::wait_for_all_suspended(&self.quiesce, accounted);
        Ok(accounted)
    }

    /// Releases every thread blocked in the suspend handler.
    pub fn resume_all(&self) {
        quiesce::resume_all(&self.quiesce);
    }

    pub fn quiesce_point(&self) -> &UnixQuiescePoint {
        &self.quiesce
    }

    /// Looks up the calling thread's own handle by kernel tid. The raw
    /// suspend-signal handler the kernel invokes has no way to carry a
    /// `ThreadHandle` across the signal-delivery boundary, so it must
    /// recover its own handle this way before calling
    /// `run_suspend_handler`.
    pub fn handle_for_current_thread(&self) -> Option<ThreadHandle> {
        let tid = current_tid();
        let guard = self.lock();
        guard
            .live_handles()
            .into_iter()
            .find(|h| guard.get(*h).is_some_and(|d| d.tid == tid))
    }

    /// Convenience wrapper combining `handle_for_current_thread` and
    /// `run_suspend_handler`, for callers (the installed signal handler)
    /// that have no handle of their own to pass in.
    pub fn run_suspend_handler_for_current_thread(&self) {
        if let Some(handle) = self.handle_for_current_thread() {
            self.run_suspend_handler(handle);
        }
    }

    /// Invoked by the suspend signal handler on the target thread. Not
    /// `pub` at the crate boundary beyond what `tas-core`'s installed
    /// handler needs to call.
    pub fn run_suspend_handler(&self, handle: ThreadHandle) {
        let guard = self.lock();
        let Some(desc) = guard.get(handle) else {
            return;
        };
        if !desc
            .state
            .compare_and_set(ThreadState::Signaled, ThreadState::SuspendInProgress)
        {
            return;
        }
        #[cfg(target_os = "linux")]
        {
            // SAFETY: called on the target thread's own stack context
            // (the alternate signal stack), writing only into this
            // descriptor's own context cell.
            unsafe {
                libc::getcontext(&mut (*desc.context.get()).0);
            }
        }
        desc.state
            .compare_and_set(ThreadState::SuspendInProgress, ThreadState::Suspended);
        drop(guard);

        self.quiesce.notify().post();
        self.quiesce.resume_lock().block_as_reader();

        let guard = self.lock();
        if let Some(desc) = guard.get(handle) {
            if self.quiesce.restore_in_progress() {
                #[cfg(target_os = "linux")]
                // SAFETY: the saved context was populated by this same
                // thread's earlier `getcontext` call and the memory it
                // describes has since been restored from the snapshot.
                unsafe {
                    libc::setcontext(&(*desc.context.get()).0);
                }
            } else {
                desc.state
                    .compare_and_set(ThreadState::Suspended, ThreadState::Running);
            }
        }
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A short-lived borrow of one descriptor, returned by `ThreadRegistry::get`.
pub struct DescriptorRef<'a> {
    registry: &'a ThreadRegistry,
    handle: ThreadHandle,
}

impl DescriptorRef<'_> {
    pub fn state(&self) -> ThreadState {
        self.registry
            .lock()
            .get(self.handle)
            .map(|d| d.state.load())
            .unwrap_or(ThreadState::FakeZombie)
    }

    pub fn tid(&self) -> i32 {
        self.registry
            .lock()
            .get(self.handle)
            .map(|d| d.tid)
            .unwrap_or(-1)
    }
}

/// Unblocks `signal` on the calling thread. Called by `register_thread`
/// so a worker thread that inherited a blocking mask from its creator is
/// still reachable by `suspend_all`.
fn unblock_signal(signal: libc::c_int) {
    // SAFETY: `sigset` is a local, fully initialized value; only the
    // calling thread's mask is affected.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(target_os = "linux")]
fn current_tid() -> i32 {
    // SAFETY: `gettid` has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> i32 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as i32
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::sync::Arc;

    #[test]
    fn init_main_is_marked_checkpoint_thread_and_never_suspended() {
        let registry = ThreadRegistry::new();
        let handle = registry.init_main();
        assert_eq!(registry.get(handle).unwrap().state(), ThreadState::CheckpointThread);
    }

    #[test]
    fn register_thread_starts_running() {
        let registry = Arc::new(ThreadRegistry::new());
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let b2 = Arc::clone(&barrier);
        let join = registry.spawn_tracked(move || {
            b2.wait();
        });
        barrier.wait();
        join.join().unwrap();
    }

    #[test]
    fn detach_recycles_a_zombie_slot_immediately() {
        let registry = Arc::new(ThreadRegistry::new());
        let handle = registry.register_thread(InheritedFlags::default());
        // Simulate the owning thread exiting without us calling
        // `thread_exit` from inside it (we're borrowing its handle from
        // the test thread here).
        if let Some(desc) = registry.lock().get(handle) {
            desc.state
                .compare_and_set(ThreadState::Running, ThreadState::Zombie);
        }
        registry.detach(handle);
        assert!(registry.get(handle).is_none());
    }

    #[test]
    fn stale_handle_after_recycling_is_rejected() {
        let registry = ThreadRegistry::new();
        let first = registry.register_thread(InheritedFlags::default());
        if let Some(desc) = registry.lock().get(first) {
            desc.state
                .compare_and_set(ThreadState::Running, ThreadState::Zombie);
        }
        registry.detach(first);
        let second = registry.register_thread(InheritedFlags::default());
        assert_ne!(first, second);
        assert!(registry.get(first).is_none());
        assert!(registry.get(second).is_some());
    }
}

/// Exercises `suspend_all`/`resume_all` against real OS threads and a real
/// installed signal handler, rather than the in-process state machine
/// alone — the one corner of this crate where the behavior that matters
/// (a thread genuinely blocked mid-signal, not just a flag flipped) can
/// only be observed this way. A single process-wide `OnceLock` stands in
/// for what `tas_core::Core::install` does in production; this module
/// installs its own handler because `tas_core` cannot depend back on this
/// crate's tests.
#[cfg(test)]
mod signal_tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;

    static HANDLER_REGISTRY: OnceLock<Arc<ThreadRegistry>> = OnceLock::new();

    extern "C" fn test_suspend_trampoline(_sig: libc::c_int) {
        if let Some(registry) = HANDLER_REGISTRY.get() {
            registry.run_suspend_handler_for_current_thread();
        }
    }

    /// Installs `test_suspend_trampoline` for `signal`, once per process.
    /// Only one test in this module uses real signals, so there is no
    /// risk of a second registry silently taking over a handler already
    /// bound to the first.
    fn install_test_handler(registry: &Arc<ThreadRegistry>, signal: libc::c_int) {
        HANDLER_REGISTRY.get_or_init(|| Arc::clone(registry));
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = test_suspend_trampoline as usize;
        action.sa_flags = libc::SA_ONSTACK | libc::SA_RESTART;
        // SAFETY: installs a handler for a signal reserved by this test,
        // restored for no one since the process exits with the test run.
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, std::ptr::null_mut());
        }
    }

    #[test]
    fn suspend_all_quiesces_busy_workers_and_reaps_a_thread_that_already_exited() {
        let registry = Arc::new(ThreadRegistry::new());
        install_test_handler(&registry, registry.quiesce_point().suspend_signal());

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let mut joins = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            let tx = tx.clone();
            joins.push(std::thread::spawn(move || {
                let handle = registry.register_thread(InheritedFlags::default());
                tx.send(handle).expect("test receiver still alive");
                while !stop.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
                registry.thread_exit();
            }));
        }
        let worker_handles: Vec<ThreadHandle> = (0..4).map(|_| rx.recv().expect("worker registered")).collect();

        // A thread that has already run to completion (and marked itself
        // Zombie) by the time `suspend_all` scans the registry — the
        // race-loss path `suspend_all` must reap rather than wait on.
        let racer_registry = Arc::clone(&registry);
        let racer_handle = std::thread::spawn(move || {
            let handle = racer_registry.register_thread(InheritedFlags::default());
            racer_registry.thread_exit();
            handle
        })
        .join()
        .expect("racer thread does not panic");
        std::thread::sleep(Duration::from_millis(20));

        registry.suspend_all().expect("no signal delivery failure against live threads");

        for handle in &worker_handles {
            assert_eq!(registry.state_of(*handle), Some(ThreadState::Suspended));
        }
        assert!(registry.get(racer_handle).is_none(), "zombie racer must be reaped during suspend_all");

        registry.resume_all();
        stop.store(true, Ordering::Relaxed);
        for join in joins {
            join.join().expect("worker thread does not panic");
        }
    }
}
