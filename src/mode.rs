// Throttle operating modes.
//
// Each mode carries exactly the parameters it needs, so "required
// parameter missing" and "parameter supplied for the wrong mode" are
// unrepresentable. What's left to validate at construction is only that
// the supplied values are positive.

use std::time::Duration;

use crate::error::ThrottleError;

/// Queue size used when `Mode::queued()` is built without an explicit
/// capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Selects how the throttle handles arrivals faster than the sustainable
/// rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Requests are queued and a background scheduler invokes them at the
    /// steady interval. `send` returns to the caller immediately; request
    /// outputs are discarded, so callers needing results must arrange an
    /// out-of-band channel.
    Async {
        /// Bounded size of the request queue. A full queue backpressures
        /// `send` rather than failing.
        queue_capacity: usize,
    },
    /// The caller is delayed in place until its request is on schedule;
    /// every early arrival waits.
    Sync,
    /// Like `Sync`, but up to `early_count` consecutive early arrivals
    /// pass undelayed before one is held back to realign the schedule.
    /// An `early_count` of 0 behaves exactly like `Sync`.
    SyncEarlyBurst { early_count: u32 },
    /// Like `Sync`, but idle time accrues up to `bucket_capacity` of
    /// burst credit that early arrivals can spend before waits kick in.
    SyncLeakyBucket { bucket_capacity: Duration },
}

impl Mode {
    /// Queued mode with the default queue capacity.
    pub fn queued() -> Self {
        Mode::Async {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ThrottleError> {
        match self {
            Mode::Async { queue_capacity: 0 } => Err(ThrottleError::InvalidQueueCapacity),
            Mode::SyncLeakyBucket { bucket_capacity } if bucket_capacity.is_zero() => {
                Err(ThrottleError::InvalidBucketCapacity)
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn is_queued(&self) -> bool {
        matches!(self, Mode::Async { .. })
    }
}
