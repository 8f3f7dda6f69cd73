//! The per-frame rendezvous between the hosted game and the controller:
//! `FrameBoundary::enter` is the one place all blocking I/O to the
//! controller happens, so the rest of the game keeps running
//! concurrently with whatever the controller's UI is doing between
//! frames.

use std::io;
use std::path::Path;
use std::time::Instant;

use tas_checkpoint::{AudioCloseHook, LoadOutcome, NullAudioCloseHook, NullThreadSync, ThreadSyncGuardFactory};
use tas_protocol::{AllInputs, GameInfo, Message, SharedConfig};
use tas_threads::ThreadHandle;
use tas_timer::TimeHolder;

use crate::core::Core;
use crate::error::CoreError;
use crate::events::{DeferredEvent, EventSink};
use crate::fps::FpsCounter;

/// External collaborator that owns the actual framebuffer: capturing the
/// current frame's pixels and re-blitting a previously captured one
/// (`Expose` / `PreviewInputs`). Rendering itself is out of core; this
/// crate only describes when these two operations happen.
pub trait ScreenCapture: Send {
    fn capture(&mut self) -> Vec<u8>;
    fn redraw(&mut self, framebuffer: &[u8], osd_mask: u32);
}

/// A `ScreenCapture` that does nothing, for embedders and tests with no
/// real framebuffer to manage.
#[derive(Default)]
pub struct NullScreenCapture;

impl ScreenCapture for NullScreenCapture {
    fn capture(&mut self) -> Vec<u8> {
        Vec::new()
    }
    fn redraw(&mut self, _framebuffer: &[u8], _osd_mask: u32) {}
}

/// External collaborator that turns a movie-file input blob into the
/// concrete deferred events pushed to the game's emulated event queue.
/// Decoding the blob's actual layout belongs to the movie file format,
/// out of core; this crate only fixes the order in which the resulting
/// events are pushed.
pub trait InputTranslator: Send {
    fn translate(&mut self, inputs: &AllInputs, framecount: u64) -> Vec<DeferredEvent>;
}

/// An `InputTranslator` that produces no events, for embedders and tests
/// with no movie file wired up.
#[derive(Default)]
pub struct NullInputTranslator;

impl InputTranslator for NullInputTranslator {
    fn translate(&mut self, _inputs: &AllInputs, _framecount: u64) -> Vec<DeferredEvent> {
        Vec::new()
    }
}

const CONTEXT_BLOB_LEN: usize = tas_checkpoint::CONTEXT_BLOB_LEN;

/// Per-frame rendezvous with the controller. Owns everything `enter`
/// needs across calls: the running frame count, the rolling fps
/// estimate, the currently active `SharedConfig`, and the side buffer
/// used to re-blit a previous frame on `Expose`/`PreviewInputs`.
pub struct FrameBoundary {
    core: &'static Core,
    main_handle: ThreadHandle,
    framecount: u64,
    logical_advances: u64,
    fps: FpsCounter,
    last_fps: (f32, f32),
    alerts: Vec<String>,
    game_info: Option<GameInfo>,
    last_sent_game_info: Option<GameInfo>,
    dump_file: Option<String>,
    pending_inputs: Option<AllInputs>,
    framebuffer: Vec<u8>,
    exiting: bool,
    fastforward_counter: u32,
    capture: Box<dyn ScreenCapture>,
    translator: Box<dyn InputTranslator>,
    thread_sync: Box<dyn ThreadSyncGuardFactory>,
    audio: Box<dyn AudioCloseHook>,
    shared_config: SharedConfig,
}

impl FrameBoundary {
    pub fn new(core: &'static Core, main_handle: ThreadHandle) -> Self {
        Self {
            core,
            main_handle,
            framecount: 0,
            logical_advances: 0,
            fps: FpsCounter::new(Instant::now()),
            last_fps: (0.0, 0.0),
            alerts: Vec::new(),
            game_info: None,
            last_sent_game_info: None,
            dump_file: None,
            pending_inputs: None,
            framebuffer: Vec::new(),
            exiting: false,
            fastforward_counter: 0,
            capture: Box::new(NullScreenCapture),
            translator: Box::new(NullInputTranslator),
            thread_sync: Box::new(NullThreadSync),
            audio: Box::new(NullAudioCloseHook),
            shared_config: SharedConfig::default(),
        }
    }

    #[must_use]
    pub fn with_screen_capture(mut self, capture: Box<dyn ScreenCapture>) -> Self {
        self.capture = capture;
        self
    }

    #[must_use]
    pub fn with_input_translator(mut self, translator: Box<dyn InputTranslator>) -> Self {
        self.translator = translator;
        self
    }

    #[must_use]
    pub fn with_thread_sync(mut self, thread_sync: Box<dyn ThreadSyncGuardFactory>) -> Self {
        self.thread_sync = thread_sync;
        self
    }

    #[must_use]
    pub fn with_audio_hook(mut self, audio: Box<dyn AudioCloseHook>) -> Self {
        self.audio = audio;
        self
    }

    pub fn framecount(&self) -> u64 {
        self.framecount
    }

    pub fn shared_config(&self) -> SharedConfig {
        self.shared_config
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    /// Queues an alert to be drained to the controller at the start of
    /// the next `enter` call.
    pub fn push_alert(&mut self, message: impl Into<String>) {
        self.alerts.push(message.into());
    }

    /// Marks `info` dirty so it is sent (once) on the next `enter` call.
    pub fn set_game_info(&mut self, info: GameInfo) {
        self.game_info = Some(info);
    }

    /// Fastforward render-skip decision. `k` is the smallest power of two
    /// with `k >= fps/16`; a non-fastforward frame always draws,
    /// and a fastforward frame draws exactly one frame in every `k`.
    pub fn skip_draw(&mut self, target_fps: f32, fastforward: bool) -> bool {
        if !fastforward {
            self.fastforward_counter = 0;
            return false;
        }
        let k = smallest_pow2_at_least(target_fps / 16.0);
        let skip = self.fastforward_counter % k != 0;
        self.fastforward_counter = self.fastforward_counter.wrapping_add(1);
        skip
    }

    /// Called once per visual frame by the game's render loop: draw if
    /// asked, advance the virtual clock, drain alerts and dirty game info
    /// to the controller, read and apply one inbound command, then hand
    /// back whatever inputs are due this frame.
    pub fn enter(
        &mut self,
        stream: &mut (impl io::Read + io::Write),
        mut draw: impl FnMut(),
        should_draw: bool,
        sink: &mut dyn EventSink,
    ) -> Result<(), CoreError> {
        self.core.timer.enter_boundary();

        if should_draw {
            draw();
            if self.shared_config.screen_capture {
                self.framebuffer = self.capture.capture();
            }
        }

        self.emit_telemetry(stream)?;
        self.run_command_loop(stream)?;

        for event in self.translator.translate(
            self.pending_inputs.as_ref().unwrap_or(&AllInputs::default()),
            self.framecount,
        ) {
            sink.push(event);
        }

        self.framecount += 1;
        self.logical_advances += 1;
        self.core.timer.advance_frame();
        if let Some(sample) = self.fps.tick(Instant::now(), self.framecount, self.logical_advances) {
            self.last_fps = sample;
        }

        self.core.timer.exit_boundary();
        Ok(())
    }

    fn emit_telemetry(&mut self, stream: &mut (impl io::Read + io::Write)) -> Result<(), CoreError> {
        for alert in self.alerts.drain(..) {
            write_message(stream, Message::Alert(alert))?;
        }

        let ticks = self.core.timer.get_ticks();
        write_message(
            stream,
            Message::FramecountTime {
                framecount: self.framecount,
                sec: ticks.sec,
                nsec: ticks.nsec,
            },
        )?;

        if self.game_info.is_some() && self.game_info != self.last_sent_game_info {
            if let Some(info) = self.game_info {
                write_message(stream, Message::GameInfo(info))?;
                self.last_sent_game_info = Some(info);
            }
        }

        write_message(
            stream,
            Message::Fps {
                fps: self.last_fps.0,
                lfps: self.last_fps.1,
            },
        )?;
        write_message(stream, Message::StartBoundary)
    }

    fn run_command_loop(&mut self, stream: &mut (impl io::Read + io::Write)) -> Result<(), CoreError> {
        loop {
            let message = match Message::read(stream) {
                Ok(message) => message,
                Err(tas_protocol::ProtocolError::Truncated { .. }) => {
                    return Err(CoreError::ControllerDisconnected);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed message from controller, skipping to next boundary");
                    return Ok(());
                }
            };

            match message {
                Message::UserQuit => {
                    self.exiting = true;
                }
                Message::Config(config) => {
                    self.shared_config = config;
                    self.core.timer.set_frame_rate(config.fps);
                }
                Message::DumpFile(path) => {
                    self.dump_file = Some(path);
                }
                Message::AllInputs(inputs) => {
                    self.pending_inputs = Some(inputs);
                }
                Message::Expose => {
                    self.capture.redraw(&self.framebuffer, self.shared_config.osd_mask);
                }
                Message::PreviewInputs(_inputs) => {
                    self.capture.redraw(&self.framebuffer, self.shared_config.osd_mask);
                }
                Message::SaveState(path) => {
                    self.save_state(Path::new(&path))?;
                }
                Message::LoadState(path) => {
                    if self.load_state(Path::new(&path))? {
                        write_message(stream, Message::LoadingSucceeded)?;
                        if let Message::Config(config) = read_message(stream)? {
                            self.shared_config = config;
                        }
                        let ticks = self.core.timer.get_ticks();
                        write_message(
                            stream,
                            Message::FramecountTime {
                                framecount: self.framecount,
                                sec: ticks.sec,
                                nsec: ticks.nsec,
                            },
                        )?;
                    }
                }
                Message::StopEncode => {
                    self.dump_file = None;
                }
                Message::EndBoundary => return Ok(()),
                // Every other code only ever flows harness -> controller.
                Message::Alert(_)
                | Message::FramecountTime { .. }
                | Message::GameInfo(_)
                | Message::Fps { .. }
                | Message::StartBoundary
                | Message::LoadingSucceeded => {
                    tracing::warn!("received a harness->controller message code from the controller, ignoring");
                }
            }
        }
    }

    /// A write-checkpoint signal delivery failure means a target thread
    /// could not be reached to save its own context, which would leave
    /// the snapshot (or the restored process) inconsistent, so it is
    /// treated as fatal rather than a recoverable `Result`. Every other
    /// failure (a bad path, a full disk) is surfaced to the controller as
    /// an alert and treated as a no-op.
    fn save_state(&mut self, path: &Path) -> Result<(), CoreError> {
        let blob = self.encode_context_blob();
        match self
            .core
            .checkpoint
            .save(path, &self.core.registry, self.thread_sync.as_ref(), self.audio.as_ref(), blob)
        {
            Ok(()) => Ok(()),
            Err(tas_checkpoint::CheckpointError::Threads(tas_threads::ThreadsError::SignalDeliveryFailed {
                ..
            })) => {
                tracing::error!("signal delivery to a target thread failed during quiescence; aborting");
                std::process::abort();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "savestate failed");
                self.push_alert(format!("savestate failed: {e}"));
                Ok(())
            }
        }
    }

    /// Returns `true` iff the snapshot was actually applied (per the
    /// resolved Open Question (a): a failed preflight check is a no-op,
    /// the game keeps running, and no re-handshake happens).
    fn load_state(&mut self, path: &Path) -> Result<bool, CoreError> {
        let blob = match tas_checkpoint::CheckpointEngine::path_preamble_context(path) {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "loadstate preflight failed, continuing without loading");
                self.push_alert(format!("loadstate failed: {e}"));
                return Ok(false);
            }
        };
        match self
            .core
            .checkpoint
            .load(path, &self.core.registry, self.thread_sync.as_ref(), self.audio.as_ref())
        {
            Ok(LoadOutcome::Skipped) => Ok(false),
            Ok(LoadOutcome::Loaded) => {
                self.apply_context_blob(&blob);
                Ok(true)
            }
            Err(tas_checkpoint::CheckpointError::Threads(tas_threads::ThreadsError::SignalDeliveryFailed {
                ..
            })) => {
                tracing::error!("signal delivery to a target thread failed during quiescence; aborting");
                std::process::abort();
            }
            Err(tas_checkpoint::CheckpointError::SnapshotUnreadable { reason, .. }) => {
                self.push_alert(format!("snapshot unreadable: {reason}"));
                Ok(false)
            }
            Err(e) => Err(CoreError::from(e)),
        }
    }

    /// Packs the save-relevant logical state (framecount, virtual time,
    /// shared config) into the opaque context blob `CheckpointEngine`
    /// carries in the snapshot preamble. `tas_checkpoint` never looks
    /// inside it; only this crate, on both ends of a save/load cycle,
    /// agrees on the layout.
    fn encode_context_blob(&self) -> Box<[u8; CONTEXT_BLOB_LEN]> {
        let mut blob = Box::new([0u8; CONTEXT_BLOB_LEN]);
        let ticks = self.core.timer.get_ticks();
        let mut at = 0;
        write_u64(&mut blob, &mut at, self.framecount);
        write_i64(&mut blob, &mut at, ticks.sec);
        write_i64(&mut blob, &mut at, ticks.nsec);
        write_u32(&mut blob, &mut at, self.shared_config.fastforward as u32);
        write_u32(&mut blob, &mut at, self.shared_config.fps);
        write_u32(&mut blob, &mut at, self.shared_config.screen_capture as u32);
        write_u32(&mut blob, &mut at, self.shared_config.osd_mask);
        write_u32(&mut blob, &mut at, self.shared_config.av_dumping as u32);
        blob
    }

    fn apply_context_blob(&mut self, blob: &[u8; CONTEXT_BLOB_LEN]) {
        let mut at = 0;
        self.framecount = read_u64(blob, &mut at);
        let sec = read_i64(blob, &mut at);
        let nsec = read_i64(blob, &mut at);
        self.core.timer.restore_ticks(TimeHolder { sec, nsec });
        self.shared_config = SharedConfig {
            fastforward: read_u32(blob, &mut at) != 0,
            fps: read_u32(blob, &mut at),
            screen_capture: read_u32(blob, &mut at) != 0,
            osd_mask: read_u32(blob, &mut at),
            av_dumping: read_u32(blob, &mut at) != 0,
        };
        self.core.timer.set_frame_rate(self.shared_config.fps);
    }

    pub fn main_handle(&self) -> ThreadHandle {
        self.main_handle
    }
}

fn write_message(stream: &mut (impl io::Read + io::Write), message: Message) -> Result<(), CoreError> {
    message.write(stream).map_err(CoreError::ProtocolFraming)
}

/// Reads one message, treating a truncated stream as a disconnect rather
/// than a framing error the caller could log and skip past — used only
/// by the post-load handshake, which has no "next boundary" to defer to.
fn read_message(stream: &mut (impl io::Read + io::Write)) -> Result<Message, CoreError> {
    Message::read(stream).map_err(|e| match e {
        tas_protocol::ProtocolError::Truncated { .. } => CoreError::ControllerDisconnected,
        other => CoreError::ProtocolFraming(other),
    })
}

fn smallest_pow2_at_least(x: f32) -> u32 {
    let mut k = 1u32;
    while (k as f32) < x {
        k *= 2;
    }
    k
}

fn write_u64(blob: &mut [u8; CONTEXT_BLOB_LEN], at: &mut usize, v: u64) {
    blob[*at..*at + 8].copy_from_slice(&v.to_le_bytes());
    *at += 8;
}

fn write_i64(blob: &mut [u8; CONTEXT_BLOB_LEN], at: &mut usize, v: i64) {
    blob[*at..*at + 8].copy_from_slice(&v.to_le_bytes());
    *at += 8;
}

fn write_u32(blob: &mut [u8; CONTEXT_BLOB_LEN], at: &mut usize, v: u32) {
    blob[*at..*at + 4].copy_from_slice(&v.to_le_bytes());
    *at += 4;
}

fn read_u64(blob: &[u8; CONTEXT_BLOB_LEN], at: &mut usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&blob[*at..*at + 8]);
    *at += 8;
    u64::from_le_bytes(buf)
}

fn read_i64(blob: &[u8; CONTEXT_BLOB_LEN], at: &mut usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&blob[*at..*at + 8]);
    *at += 8;
    i64::from_le_bytes(buf)
}

fn read_u32(blob: &[u8; CONTEXT_BLOB_LEN], at: &mut usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&blob[*at..*at + 4]);
    *at += 4;
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn skip_draw_always_draws_without_fastforward() {
        let core: &'static Core = Box::leak(Box::new(Core::new(crate::config::HarnessConfig::default())));
        let handle = core.registry.init_main();
        let mut fb = FrameBoundary::new(core, handle);
        for _ in 0..5 {
            assert!(!fb.skip_draw(60.0, false));
        }
    }

    #[test]
    fn skip_draw_at_16fps_draws_every_frame() {
        let core: &'static Core = Box::leak(Box::new(Core::new(crate::config::HarnessConfig::default())));
        let handle = core.registry.init_main();
        let mut fb = FrameBoundary::new(core, handle);
        for _ in 0..10 {
            assert!(!fb.skip_draw(16.0, true));
        }
    }

    #[test]
    fn skip_draw_at_320fps_draws_one_in_32() {
        let core: &'static Core = Box::leak(Box::new(Core::new(crate::config::HarnessConfig::default())));
        let handle = core.registry.init_main();
        let mut fb = FrameBoundary::new(core, handle);
        let drawn = (0..64).filter(|_| !fb.skip_draw(320.0, true)).count();
        assert_eq!(drawn, 2);
    }

    #[test]
    fn context_blob_round_trips_framecount_and_time() {
        let core: &'static Core = Box::leak(Box::new(Core::new(crate::config::HarnessConfig::default())));
        let handle = core.registry.init_main();
        let mut fb = FrameBoundary::new(core, handle);
        fb.framecount = 30;
        let blob = fb.encode_context_blob();

        fb.framecount = 90;
        fb.apply_context_blob(&blob);
        assert_eq!(fb.framecount, 30);
    }
}
