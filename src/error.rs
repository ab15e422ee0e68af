use thiserror::Error;

use crate::registry::JobKind;

/// Errors reported by the station.
///
/// The scheduling protocol itself has no failure channel: once a job is
/// admitted its handle resolves with whatever the handler returned. These
/// errors only cover misconfiguration and calls that cannot be turned into
/// a job in the first place.
#[derive(Error, Debug)]
pub enum StationError {
    /// The worker pool would be empty.
    #[error("the worker pool must contain at least one worker")]
    NoWorkers,

    #[error("the local queue size must be at least 1")]
    ZeroLocalQueue,

    /// The fallback duration is negative or not a finite number.
    #[error("invalid fallback duration: {0}")]
    InvalidFallback(f64),

    #[error("no job type named {0:?} is registered")]
    UnknownJob(String),

    /// The job type exists but was registered with another kind of handler.
    #[error("job type {name:?} is registered as a {expected:?} job")]
    KindMismatch { name: String, expected: JobKind },

    #[error("workgroup call to {0:?} with a length of zero")]
    EmptyWorkgroup(String),

    #[error("job type {0:?} is already registered")]
    DuplicateJob(String),

    /// A worker or control thread could not be spawned.
    #[error("failed to spawn a station thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("the station is shut down")]
    ShutDown,
}

/// Result type alias for station operations.
pub type Result<T> = std::result::Result<T, StationError>;

#[test]
fn error_display() {
    let err = StationError::KindMismatch {
        name: "sum".to_string(),
        expected: JobKind::Workgroup,
    };
    assert_eq!(err.to_string(), "job type \"sum\" is registered as a Workgroup job");

    let err = StationError::UnknownJob("add".to_string());
    assert_eq!(err.to_string(), "no job type named \"add\" is registered");
}

#[test]
fn spawn_error_conversion() {
    let io_err = std::io::Error::new(std::io::ErrorKind::Other, "out of threads");
    let err: StationError = io_err.into();
    assert!(err.to_string().contains("out of threads"));
}
