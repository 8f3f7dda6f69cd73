//! Thread lifecycle tracking and the signal-based quiesce protocol used
//! to bring a process to a checkpoint-safe state.

mod descriptor;
mod error;
mod quiesce;
mod registry;

pub use descriptor::{AltStack, InheritedFlags, ThreadState};
pub use error::ThreadsError;
pub use quiesce::{QuiescePoint, Semaphore, UnixQuiescePoint};
pub use registry::{DescriptorRef, ThreadHandle, ThreadRegistry};
