use thiserror::Error;

/// The top-level error type `FrameBoundary::enter` and the rest of
/// `tas-core`'s public surface return. Wraps every downstream crate's
/// error type via `#[from]`, following this codebase's one-enum-per-crate
/// convention.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("controller connection closed")]
    ControllerDisconnected,

    #[error("Core::install was called more than once")]
    AlreadyInstalled,

    #[error("malformed message from controller, skipping to next frame boundary: {0}")]
    ProtocolFraming(#[source] tas_protocol::ProtocolError),

    #[error(transparent)]
    Threads(#[from] tas_threads::ThreadsError),

    #[error(transparent)]
    Checkpoint(#[from] tas_checkpoint::CheckpointError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
