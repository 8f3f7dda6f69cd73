//! Orchestrates a full save or load cycle: quiesce every other thread,
//! run the serializer/deserializer on a private alternate stack, resume.

use std::cell::Cell;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use tas_threads::ThreadRegistry;

use crate::error::CheckpointError;
use crate::format::CONTEXT_BLOB_LEN;
use crate::hooks::{AudioCloseHook, ThreadSyncGuardFactory};
use crate::region::RegionPolicy;
use crate::{deserializer, serializer};

/// What happened as a result of `CheckpointEngine::load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The snapshot was applied; every thread has been rewound.
    Loaded,
    /// The snapshot failed its preflight check (`check_restore`); per
    /// the resolved Open Question, the game keeps running untouched.
    Skipped,
}

thread_local! {
    /// Set for the duration of the write-checkpoint signal's delivery so
    /// the handler, which cannot otherwise receive a context pointer, can
    /// find the closure it must run. Thread-local rather than a
    /// process-wide `OnceLock` because a save/load only ever runs on the
    /// calling (checkpoint) thread, which raises the signal on itself.
    static PENDING_ACTION: Cell<Option<*mut dyn FnMut()>> = const { Cell::new(None) };
}

extern "C" fn write_checkpoint_trampoline(_sig: libc::c_int) {
    let action = PENDING_ACTION.with(|cell| cell.replace(None));
    if let Some(ptr) = action {
        // SAFETY: `ptr` was set by `run_on_alt_stack` immediately before
        // raising this same signal on this same thread, and is cleared
        // before the signal is raised again; the pointee outlives the
        // call because `run_on_alt_stack` does not return until the
        // handler has run.
        unsafe { (*ptr)() };
    }
}

/// Installs a one-shot handler for `signal`, switches to `altstack`,
/// raises `signal` on the calling thread (running `action` inside the
/// handler), then restores the previous handler and stack.
fn run_on_alt_stack(signal: libc::c_int, altstack: &mut [u8], action: &mut dyn FnMut()) {
    let mut new_stack = libc::stack_t {
        ss_sp: altstack.as_mut_ptr().cast(),
        ss_flags: 0,
        ss_size: altstack.len(),
    };
    let mut old_stack = std::mem::MaybeUninit::<libc::stack_t>::uninit();
    let mut old_action = std::mem::MaybeUninit::<libc::sigaction>::uninit();

    let mut new_action: libc::sigaction = unsafe { std::mem::zeroed() };
    new_action.sa_sigaction = write_checkpoint_trampoline as usize;
    new_action.sa_flags = libc::SA_ONSTACK;
    // SAFETY: installs the handler and swaps to the alternate stack; both
    // are restored before returning, and only the calling thread is
    // affected by `sigaltstack`.
    unsafe {
        libc::sigemptyset(&mut new_action.sa_mask);
        libc::sigaction(signal, &new_action, old_action.as_mut_ptr());
        libc::sigaltstack(&new_stack, old_stack.as_mut_ptr());
    }

    let fat_ptr: *mut dyn FnMut() = action;
    PENDING_ACTION.with(|cell| cell.set(Some(fat_ptr)));
    // SAFETY: raises `signal` on the calling thread only.
    unsafe {
        libc::raise(signal);
    }

    // SAFETY: restores whatever was previously registered.
    unsafe {
        libc::sigaction(signal, old_action.as_ptr(), std::ptr::null_mut());
        libc::sigaltstack(old_stack.as_ptr(), std::ptr::null_mut());
    }
    let _ = &mut new_stack;
}

/// Serializes and restores the full writable address space around a
/// quiesced thread registry.
pub struct CheckpointEngine {
    policy: RegionPolicy,
    write_checkpoint_signal: libc::c_int,
    altstack: std::sync::Mutex<Box<[u8]>>,
}

impl CheckpointEngine {
    /// `signal_offset` is added to `SIGRTMIN` to pick the concrete signal
    /// number; callers pass `HarnessConfig::write_checkpoint_signal_offset`
    /// so it can be shifted away from the default slot if a hosted game
    /// claims it independently.
    pub fn new(policy: RegionPolicy, signal_offset: i32) -> Self {
        // SAFETY: `SIGRTMIN` reads a libc constant table.
        let write_checkpoint_signal = unsafe { libc::SIGRTMIN() } + signal_offset;
        Self {
            policy,
            write_checkpoint_signal,
            altstack: std::sync::Mutex::new(vec![0u8; 64 * 1024].into_boxed_slice()),
        }
    }

    /// The realtime signal this engine self-raises on the checkpoint
    /// thread to run the serializer/deserializer on the alternate stack.
    /// `tas_core::Core::install` unblocks it on the main thread so a
    /// hosted game that happens to block realtime signals cannot starve
    /// it.
    pub fn write_checkpoint_signal(&self) -> libc::c_int {
        self.write_checkpoint_signal
    }

    /// Must be called on the checkpoint thread: acquire the runtime lock
    /// and close the audio device, quiesce every other thread, serialize
    /// the address space on the alternate stack, then resume and reopen
    /// audio. A failed write rolls back the partial file.
    pub fn save(
        &self,
        path: &Path,
        registry: &ThreadRegistry,
        thread_sync: &dyn ThreadSyncGuardFactory,
        audio: &dyn AudioCloseHook,
        context_blob: Box<[u8; CONTEXT_BLOB_LEN]>,
    ) -> Result<(), CheckpointError> {
        let _guard = thread_sync.acquire();
        audio.close();

        registry.suspend_all()?;

        // Enumerating /proc/self/maps, copying each kept region's bytes,
        // and classifying them against their backing files all allocate
        // and touch the filesystem. Every other thread is already
        // quiesced at this point, so it's safe to do that work here, on
        // the checkpoint thread's ordinary stack — not inside the
        // self-raised signal handler below, which must stay allocation-free.
        // SAFETY: `registry.suspend_all()` above has already blocked
        // every other thread on the resume lock.
        let prepare_result = unsafe { serializer::prepare_records(&self.policy) };

        let result = match prepare_result {
            Ok(records) => self.write_to(path, context_blob, &records),
            Err(e) => Err(e),
        };

        registry.resume_all();
        audio.reopen();

        if result.is_err() {
            let _ = std::fs::remove_file(path);
        }
        result
    }

    fn write_to(
        &self,
        path: &Path,
        context_blob: Box<[u8; CONTEXT_BLOB_LEN]>,
        records: &[crate::format::RegionRecord],
    ) -> Result<(), CheckpointError> {
        let file = File::create(path).map_err(|e| CheckpointError::Io {
            action: "creating",
            path: path.to_owned(),
            source: e,
        })?;
        let mut writer = BufWriter::new(file);

        let mut result = Ok(());
        let mut action = || {
            // SAFETY: `records` was already built by `prepare_records`
            // while every other thread was quiesced; this closure only
            // writes those already-computed bytes, and runs on the
            // checkpoint thread's dedicated alternate stack.
            result = serializer::write_prepared(&mut writer, context_blob_clone(&context_blob), records);
        };
        let mut altstack = self.altstack.lock().unwrap_or_else(|p| p.into_inner());
        run_on_alt_stack(self.write_checkpoint_signal, &mut altstack, &mut action);
        result
    }

    /// Mirror of `save`. On a preflight failure returns
    /// `Ok(LoadOutcome::Skipped)` without disturbing any thread.
    pub fn load(
        &self,
        path: &Path,
        registry: &ThreadRegistry,
        thread_sync: &dyn ThreadSyncGuardFactory,
        audio: &dyn AudioCloseHook,
    ) -> Result<LoadOutcome, CheckpointError> {
        let file = File::open(path).map_err(|e| CheckpointError::Io {
            action: "opening",
            path: path.to_owned(),
            source: e,
        })?;
        let mut reader = BufReader::new(file);
        let preamble = crate::format::Preamble::read(&mut reader)?;
        if deserializer::check_restore(&preamble).is_err() {
            tracing::warn!(path = %path.display(), "snapshot failed preflight check, continuing without loading");
            return Ok(LoadOutcome::Skipped);
        }

        // Reading every record out of the snapshot and opening each
        // FileBacked region's backing file is ordinary fallible I/O that
        // never touches live process memory, so it runs here, before any
        // thread is quiesced — not inside the signal handler below,
        // which must stay allocation-free.
        let prepared = match deserializer::prepare_restore(&mut reader, &preamble) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "snapshot failed to parse, continuing without loading");
                return Ok(LoadOutcome::Skipped);
            }
        };

        let _guard = thread_sync.acquire();
        audio.close();
        registry.suspend_all()?;

        registry.quiesce_point().set_restore_in_progress(true);
        let result = self.apply_prepared(&prepared);
        registry.quiesce_point().set_restore_in_progress(false);

        registry.resume_all();
        audio.reopen();

        result.map(|_| LoadOutcome::Loaded)
    }

    fn apply_prepared(&self, prepared: &[deserializer::PreparedRegion]) -> Result<(), CheckpointError> {
        let mut outcome = Ok(());
        let mut action = || {
            outcome = (|| {
                for region in prepared {
                    // SAFETY: every other thread is blocked on the
                    // resume lock; `region` was already opened/read by
                    // `prepare_restore`, so this only issues mmap calls
                    // and copies bytes already in hand. This closure
                    // runs on the checkpoint thread's dedicated
                    // alternate stack, and a failure here is treated as
                    // fatal by the caller.
                    unsafe { deserializer::restore_prepared(region)? };
                }
                Ok(())
            })();
        };
        let mut altstack = self.altstack.lock().unwrap_or_else(|p| p.into_inner());
        run_on_alt_stack(self.write_checkpoint_signal, &mut altstack, &mut action);

        if let Err(CheckpointError::FatalDuringOverwrite(ref msg)) = outcome {
            tracing::error!(msg, "fatal error while overwriting memory from a snapshot");
            std::process::abort();
        }
        outcome
    }

    pub fn path_preamble_context(path: &Path) -> Result<Box<[u8; CONTEXT_BLOB_LEN]>, CheckpointError> {
        let file = File::open(path).map_err(|e| CheckpointError::Io {
            action: "opening",
            path: path.to_owned(),
            source: e,
        })?;
        let mut reader = BufReader::new(file);
        let preamble = crate::format::Preamble::read(&mut reader)?;
        Ok(preamble.context_blob)
    }
}

fn context_blob_clone(blob: &[u8; CONTEXT_BLOB_LEN]) -> Box<[u8; CONTEXT_BLOB_LEN]> {
    Box::new(*blob)
}
