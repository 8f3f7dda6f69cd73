//! Ties `tas-protocol`, `tas-timer`, `tas-threads`, and `tas-checkpoint`
//! together into the harness surface an embedding game links against:
//! `Core::install` once at load time, then `FrameBoundary::enter` once
//! per rendered frame.

pub mod config;
mod core;
mod error;
mod events;
mod frame;
mod fps;
pub mod logging;

pub use crate::core::Core;
pub use config::{ConfigOverrides, HarnessConfig};
pub use error::CoreError;
pub use events::{DeferredEvent, EventSink, NullEventSink, RecordingEventSink};
pub use frame::{FrameBoundary, InputTranslator, NullInputTranslator, NullScreenCapture, ScreenCapture};

pub use tas_checkpoint::{AudioCloseHook, NullAudioCloseHook, NullThreadSync, ThreadSyncGuard, ThreadSyncGuardFactory};
pub use tas_protocol::{AllInputs, GameInfo, Message, SharedConfig};
pub use tas_threads::{InheritedFlags, ThreadHandle};
pub use tas_timer::{QueryKind, ThreadKind, TimeHolder};
