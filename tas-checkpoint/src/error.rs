use std::path::PathBuf;

use thiserror::Error;

/// Errors from saving or loading a process snapshot.
///
/// `SnapshotUnreadable` is recoverable by design: per the resolved Open
/// Question in `DESIGN.md`, a corrupt or incompatible snapshot leaves the
/// game running rather than tearing it down. `FatalDuringOverwrite` is
/// the opposite: once the deserializer has started overwriting live
/// memory, a failure partway through cannot be unwound, and the one call
/// site that can observe this variant pairs it with
/// `std::process::abort()`.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("snapshot at {path} is unreadable: {reason}")]
    SnapshotUnreadable { path: PathBuf, reason: String },

    #[error("io error while {action} snapshot {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read process memory map: {0}")]
    MapsUnreadable(#[source] std::io::Error),

    #[error("thread registry reported an error during quiescence: {0}")]
    Threads(#[from] tas_threads::ThreadsError),

    #[error("memory overwrite failed partway through loading a snapshot; process state is no longer recoverable: {0}")]
    FatalDuringOverwrite(String),
}
