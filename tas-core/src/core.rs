//! Process-wide wiring: the one place that owns a `ThreadRegistry`, a
//! `DeterministicTimer` and a `CheckpointEngine` together, and the single
//! well-known slot (`Core::install`) that lets the raw suspend-signal
//! handler — which the kernel invokes with no way to pass a context
//! pointer — reach back into them: process-wide mutable state becomes an
//! explicit context object plus one install slot, rather than scattered
//! globals.

use std::sync::{Arc, OnceLock};

use tas_checkpoint::CheckpointEngine;
use tas_threads::{InheritedFlags, ThreadHandle, ThreadRegistry};
use tas_timer::{DeterministicTimer, TimeHolder};

use crate::config::HarnessConfig;
use crate::error::CoreError;

static INSTALLED: OnceLock<&'static Core> = OnceLock::new();

/// Owns the three components that `FrameBoundary` drives every frame.
/// Constructed explicitly by the embedding harness, then handed to
/// `Core::install` exactly once.
pub struct Core {
    pub registry: Arc<ThreadRegistry>,
    pub timer: Arc<DeterministicTimer>,
    pub checkpoint: CheckpointEngine,
    pub config: HarnessConfig,
}

impl Core {
    pub fn new(config: HarnessConfig) -> Self {
        let timer = DeterministicTimer::new(TimeHolder::ZERO, config.default_fps);
        let checkpoint = CheckpointEngine::new(config.region_policy(), config.write_checkpoint_signal_offset);
        Self {
            registry: Arc::new(ThreadRegistry::with_suspend_signal_offset(config.suspend_signal_offset)),
            timer: Arc::new(timer),
            checkpoint,
            config,
        }
    }

    /// Stashes `core` in the per-process install slot, unblocks both
    /// reserved signals on the calling thread, installs the raw suspend
    /// signal handler, and marks the calling thread as the registry's
    /// `CheckpointThread`. Must be called exactly once, from what will be
    /// the game's main/render thread.
    ///
    /// Returns `Err(CoreError::AlreadyInstalled)` if called twice — the
    /// embedding harness is expected to call this once at load time, not
    /// guard every call site itself.
    pub fn install(core: &'static Core) -> Result<ThreadHandle, CoreError> {
        if INSTALLED.set(core).is_err() {
            return Err(CoreError::AlreadyInstalled);
        }
        install_suspend_handler(core.registry.quiesce_point().suspend_signal())?;
        unblock_signal(core.registry.quiesce_point().suspend_signal());
        unblock_signal(core.checkpoint.write_checkpoint_signal());
        let handle = core.registry.init_main();
        tracing::info!(
            suspend_signal = core.registry.quiesce_point().suspend_signal(),
            checkpoint_signal = core.checkpoint.write_checkpoint_signal(),
            "core installed"
        );
        Ok(handle)
    }

    /// Returns the installed `Core`, if `install` has already run.
    pub fn get() -> Option<&'static Core> {
        INSTALLED.get().copied()
    }

    /// Registers a newly created game thread. Must be called from the
    /// new thread's own context as its first act, not by its creator.
    pub fn register_thread(&self, inherit: InheritedFlags) -> ThreadHandle {
        self.registry.register_thread(inherit)
    }
}

fn unblock_signal(signal: libc::c_int) {
    // SAFETY: operates only on the calling thread's own signal mask.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

extern "C" fn suspend_trampoline(_sig: libc::c_int) {
    if let Some(core) = Core::get() {
        core.registry.run_suspend_handler_for_current_thread();
    }
}

/// Installs `suspend_trampoline` as the handler for `signal`, on the
/// thread's private alternate stack so it never aliases the thread's own
/// stack while that stack is being serialized. Unlike the
/// write-checkpoint signal, this handler is installed once, globally, at
/// `Core::install` time — every target thread receives the same signal
/// number and runs through the same registry lookup.
fn install_suspend_handler(signal: libc::c_int) -> Result<(), CoreError> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = suspend_trampoline as usize;
    action.sa_flags = libc::SA_ONSTACK | libc::SA_RESTART;
    // SAFETY: installs a process-wide handler for a signal reserved by
    // this harness; no previous disposition the game cares about is
    // clobbered because the signal number comes from the realtime range
    // the game is not expected to use.
    let rc = unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signal, &action, std::ptr::null_mut())
    };
    if rc != 0 {
        return Err(CoreError::Threads(tas_threads::ThreadsError::SignalDeliveryFailed {
            tid: 0,
            signal,
            errno: std::io::Error::last_os_error(),
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn new_core_times_zero_and_not_installed_yet() {
        let core = Core::new(HarnessConfig::default());
        assert_eq!(core.timer.get_ticks(), TimeHolder::ZERO);
    }
}
