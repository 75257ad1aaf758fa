// Error taxonomy for throttle construction and lifecycle misuse.
//
// Every configuration error is raised before the throttle (and, in queued
// mode, its scheduler task) comes into existence. Failures of the wrapped
// requests themselves are never represented here: synchronous modes hand
// them straight back to the caller, and the queued scheduler contains them.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleError {
    /// `requests` must be a positive integer.
    #[error("requests must be a positive integer")]
    InvalidRequests,

    /// `period` must be a positive duration.
    #[error("period must be a positive duration")]
    InvalidPeriod,

    /// `queue_capacity` must be a positive integer.
    #[error("queue_capacity must be a positive integer")]
    InvalidQueueCapacity,

    /// `bucket_capacity` must be a positive duration.
    #[error("bucket_capacity must be a positive duration")]
    InvalidBucketCapacity,

    /// Shutdown signals are accepted only when wrapping a queued-mode
    /// throttle.
    #[error("shutdown signals are valid only for a wrapped queued-mode throttle")]
    InvalidShutdownSignal,

    /// `start_shutdown` was called on a throttle with no scheduler to
    /// shut down.
    #[error("start_shutdown is valid only for a queued-mode throttle")]
    ShutdownNotApplicable,
}
