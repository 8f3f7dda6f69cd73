use thiserror::Error;

/// Errors from the thread registry and the quiesce protocol.
///
/// `ThreadRaceLost` is absorbed by callers (the target is reaped and
/// `suspend_all` keeps going). `InvalidTransition` and
/// `SignalDeliveryFailed` represent contract violations the registry
/// cannot recover from: the one call site that surfaces them converts
/// them to `std::process::abort()` rather than letting the caller retry.
#[derive(Debug, Error)]
pub enum ThreadsError {
    #[error("thread {tid} died while we were racing to suspend it")]
    ThreadRaceLost { tid: i32 },

    #[error("invalid state transition on thread {tid}: expected {expected}, found {found}")]
    InvalidTransition {
        tid: i32,
        expected: &'static str,
        found: &'static str,
    },

    #[error("failed to deliver signal {signal} to thread {tid}: {errno}")]
    SignalDeliveryFailed {
        tid: i32,
        signal: i32,
        errno: std::io::Error,
    },

    #[error("required platform symbol could not be resolved or invoked: {0}")]
    LinkFailed(&'static str),

    #[error("operation requires a handle for a thread that is no longer registered")]
    StaleHandle,
}
