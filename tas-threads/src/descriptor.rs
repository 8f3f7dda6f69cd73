use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

/// The state of one live thread. Transitions are always a CAS keyed on
/// the expected prior state; an unexpected prior state means either a
/// race we should absorb (another pass already moved it) or, for states
/// that should never be observed outside a suspend/resume cycle, a
/// contract violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Running = 0,
    Signaled = 1,
    SuspendInProgress = 2,
    Suspended = 3,
    Zombie = 4,
    FakeZombie = 5,
    CheckpointThread = 6,
}

impl ThreadState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Signaled => "Signaled",
            Self::SuspendInProgress => "SuspendInProgress",
            Self::Suspended => "Suspended",
            Self::Zombie => "Zombie",
            Self::FakeZombie => "FakeZombie",
            Self::CheckpointThread => "CheckpointThread",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Signaled,
            2 => Self::SuspendInProgress,
            3 => Self::Suspended,
            4 => Self::Zombie,
            5 => Self::FakeZombie,
            _ => Self::CheckpointThread,
        }
    }
}

/// An atomic cell holding a `ThreadState`, with the CAS-or-reject
/// semantics every state transition relies on.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(initial: ThreadState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> ThreadState {
        ThreadState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempts `expected -> new`. Returns `true` iff the descriptor was
    /// in `expected` and is now in `new`.
    #[must_use]
    pub fn compare_and_set(&self, expected: ThreadState, new: ThreadState) -> bool {
        self.0
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Whether a newly created thread inherited "native / own-code / no-log"
/// mode from its creator; an embedding harness that intercepts thread
/// creation sets these, since symbol hooking itself is out of core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InheritedFlags {
    pub native: bool,
    pub own_code: bool,
    pub no_log: bool,
}

/// A full machine context: registers, program counter and signal mask, as
/// saved by `getcontext` / restored by `setcontext` on the platforms that
/// support them.
///
/// `ucontext_t` is plain data (no interior pointers that would make
/// sharing it across threads unsound on its own); the actual safety of
/// reading a descriptor's saved context from the checkpoint thread comes
/// from the happens-before edge established by the quiesce semaphore, not
/// from this type.
#[cfg(target_os = "linux")]
pub struct SavedContext(pub libc::ucontext_t);

#[cfg(target_os = "linux")]
impl Default for SavedContext {
    fn default() -> Self {
        // SAFETY: `ucontext_t` is a plain-old-data struct; a zeroed value
        // is never read by anyone until `getcontext` has populated it,
        // which is enforced by `ThreadDescriptor::context` starting as
        // `None`.
        Self(unsafe { std::mem::zeroed() })
    }
}

#[cfg(target_os = "linux")]
unsafe impl Send for SavedContext {}
#[cfg(target_os = "linux")]
unsafe impl Sync for SavedContext {}

/// A private alternate signal stack for one thread, pre-allocated rather
/// than mapped on demand. Installed via `sigaltstack` right before the suspend
/// signal is delivered, so the handler's own stack frame never aliases
/// the thread's normal stack — this is what makes it safe for the
/// checkpoint engine to later overwrite that normal stack's memory.
pub struct AltStack {
    storage: Box<[u8]>,
}

impl AltStack {
    pub const SIZE: usize = 64 * 1024;

    pub fn new() -> Self {
        Self {
            storage: vec![0u8; Self::SIZE].into_boxed_slice(),
        }
    }

    #[cfg(unix)]
    pub fn as_stack_t(&mut self) -> libc::stack_t {
        libc::stack_t {
            ss_sp: self.storage.as_mut_ptr().cast(),
            ss_flags: 0,
            ss_size: self.storage.len(),
        }
    }
}

impl Default for AltStack {
    fn default() -> Self {
        Self::new()
    }
}

/// One live (or recyclable) thread's full bookkeeping record. Held in the
/// registry's arena behind a `ThreadHandle` (an index plus a generation,
/// in place of an intrusive linked list of thread-info nodes).
pub struct ThreadDescriptor {
    pub tid: i32,
    #[cfg(unix)]
    pub pthread: libc::pthread_t,
    pub state: StateCell,
    #[cfg(target_os = "linux")]
    pub context: std::cell::UnsafeCell<SavedContext>,
    pub tls_value: std::sync::atomic::AtomicUsize,
    pub altstack: std::sync::Mutex<AltStack>,
    pub detached: std::sync::atomic::AtomicBool,
    pub join_retval: std::sync::Mutex<Option<usize>>,
    pub inherited: InheritedFlags,
    pub routine_id: isize,
}

// SAFETY: `UnsafeCell<SavedContext>` is only written by the owning thread
// (inside its own suspend handler) and only read by the checkpoint thread
// after that write is ordered-before by the release/acquire pair on the
// quiesce semaphore.
unsafe impl Sync for ThreadDescriptor {}

impl ThreadDescriptor {
    pub fn new(tid: i32, #[cfg(unix)] pthread: libc::pthread_t, initial: ThreadState) -> Self {
        Self {
            tid,
            #[cfg(unix)]
            pthread,
            state: StateCell::new(initial),
            #[cfg(target_os = "linux")]
            context: std::cell::UnsafeCell::new(SavedContext::default()),
            tls_value: std::sync::atomic::AtomicUsize::new(0),
            altstack: std::sync::Mutex::new(AltStack::new()),
            detached: std::sync::atomic::AtomicBool::new(false),
            join_retval: std::sync::Mutex::new(None),
            inherited: InheritedFlags::default(),
            routine_id: 0,
        }
    }
}
