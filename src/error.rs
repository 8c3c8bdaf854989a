/// Error taxonomy for the orchestration core.
///
/// Resource and queue failures stay local: callers get a `Result` (or a
/// `bool` at the query surface) and decide. Only [`Error::is_fatal`] errors
/// stop the orchestrator loop.
use thiserror::Error;

/// Shared resources that can be momentarily unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    RadioLock,
    EventQueue,
    RequestQueue,
    Provider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("resource unavailable: {0:?}")]
    ResourceUnavailable(Resource),

    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    #[error("registry at capacity, oldest entry evicted")]
    CapacityExceeded,

    #[error("action exceeded its time budget")]
    BoundedTimeout,

    #[error("heap exhausted while building a payload")]
    AllocationFailure,

    #[error("capability provider refused bring-up: {0}")]
    ProviderInit(&'static str),

    #[error("radio release kept failing; state cannot be trusted")]
    RadioDesync,
}

impl Error {
    /// Errors after which the orchestrator loop must stop and let the
    /// watchdog reset the device.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AllocationFailure | Error::RadioDesync)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
