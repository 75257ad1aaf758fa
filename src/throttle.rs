// The throttle facade.
//
// A `Throttle` regulates outbound requests so at most `requests` of them
// are issued per `period`. Callers share one instance across tasks (it
// only needs `&self`); which of the four modes it runs decides what
// happens to arrivals that are faster than the sustainable rate:
//
// - `Sync`, `SyncEarlyBurst`, `SyncLeakyBucket`: the caller is delayed in
//   place, then its request runs on the caller's own task and `send`
//   returns the request's output.
// - `Async`: the request is queued and a background scheduler invokes it
//   later at the steady interval; `send` returns without an output.
//
// The pacing state sits behind a std mutex that is held only while the
// wait is computed, never across a sleep or a request invocation.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{trace, warn};

use crate::error::ThrottleError;
use crate::mode::Mode;
use crate::pacing::{Algorithm, Pacing};
use crate::scheduler::{Lifecycle, Request, Scheduler};
use crate::wrap::ShutdownSignals;

/// How long one enqueue attempt blocks on a full queue before re-checking
/// for shutdown and retrying.
const ENQUEUE_RETRY: Duration = Duration::from_millis(500);

pub struct Throttle {
    requests: u32,
    period: Duration,
    target_interval: Duration,
    mode: Mode,
    /// Monotonic origin for the pacing arithmetic.
    origin: Instant,
    engine: Engine,
}

/// Mode-specific machinery. Sync modes carry only pacing state; queued
/// mode carries the queue sender, the shared lifecycle flag, and the
/// scheduler's join handle.
enum Engine {
    Gate {
        pacing: Mutex<Pacing>,
    },
    Queued {
        queue: mpsc::Sender<Request>,
        lifecycle: Arc<Lifecycle>,
        worker: AsyncMutex<Option<JoinHandle<()>>>,
    },
}

impl Throttle {
    /// Create a throttle. For `Mode::Async` this spawns the scheduler
    /// task, so it must be called within a tokio runtime.
    pub fn new(requests: u32, period: Duration, mode: Mode) -> Result<Self, ThrottleError> {
        Self::build(requests, period, mode, None)
    }

    pub(crate) fn build(
        requests: u32,
        period: Duration,
        mode: Mode,
        signals: Option<ShutdownSignals>,
    ) -> Result<Self, ThrottleError> {
        if requests == 0 {
            return Err(ThrottleError::InvalidRequests);
        }
        if period.is_zero() {
            return Err(ThrottleError::InvalidPeriod);
        }
        mode.validate()?;
        if signals.is_some() && !mode.is_queued() {
            return Err(ThrottleError::InvalidShutdownSignal);
        }

        let target_interval = period / requests;
        let engine = match mode {
            Mode::Async { queue_capacity } => {
                let (external_request, shutdown_complete) = match signals {
                    Some(signals) => (
                        Some(signals.shutdown_request),
                        Some(signals.shutdown_complete),
                    ),
                    None => (None, None),
                };
                let lifecycle = Arc::new(Lifecycle::new(external_request));
                let (queue, receiver) = mpsc::channel(queue_capacity);
                let scheduler = Scheduler::new(
                    receiver,
                    Arc::clone(&lifecycle),
                    target_interval,
                    shutdown_complete,
                );
                Engine::Queued {
                    queue,
                    lifecycle,
                    worker: AsyncMutex::new(Some(tokio::spawn(scheduler.run()))),
                }
            }
            Mode::Sync => Engine::Gate {
                pacing: Mutex::new(Pacing::new(
                    Algorithm::Interval,
                    target_interval.as_secs_f64(),
                )),
            },
            Mode::SyncEarlyBurst { early_count } => Engine::Gate {
                pacing: Mutex::new(Pacing::new(
                    Algorithm::EarlyBurst {
                        budget: early_count,
                    },
                    target_interval.as_secs_f64(),
                )),
            },
            Mode::SyncLeakyBucket { bucket_capacity } => Engine::Gate {
                pacing: Mutex::new(Pacing::new(
                    Algorithm::LeakyBucket {
                        capacity: bucket_capacity.as_secs_f64(),
                    },
                    target_interval.as_secs_f64(),
                )),
            },
        };

        Ok(Self {
            requests,
            period,
            target_interval,
            mode,
            origin: Instant::now(),
            engine,
        })
    }

    /// Send one request through the throttle.
    ///
    /// Synchronous modes delay as needed, run the request on the caller's
    /// task, and return `Some(output)`; failures of the request itself
    /// (error values, panics) reach the caller untouched. Queued mode
    /// enqueues the request and returns `None` — a full queue
    /// backpressures the caller rather than failing, and a request that
    /// arrives after shutdown is dropped silently.
    pub async fn send<F, Fut, T>(&self, request: F) -> Option<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match &self.engine {
            Engine::Gate { pacing } => {
                // Compute the wait under the lock, then drop it before
                // sleeping. Committing the schedule here (not after the
                // sleep) means concurrent callers each reserve their own
                // slot.
                let wait = {
                    let mut pacing = pacing.lock().unwrap();
                    pacing.admit(self.now_secs())
                };
                if wait > 0.0 {
                    trace!(wait_secs = wait, "delaying request to stay on schedule");
                    sleep(Duration::from_secs_f64(wait)).await;
                }
                let output = request().await;
                // Space the next admission from the completion time, so a
                // slow request cannot let its successor go out early as
                // observed by the service.
                pacing.lock().unwrap().finalize(self.now_secs());
                Some(output)
            }
            Engine::Queued {
                queue, lifecycle, ..
            } => {
                if lifecycle.is_shutdown() {
                    return None;
                }
                let mut request = Request::new(request);
                loop {
                    match queue.send_timeout(request, ENQUEUE_RETRY).await {
                        Ok(()) => break,
                        Err(SendTimeoutError::Timeout(returned)) => {
                            // Queue full: keep backpressuring unless
                            // shutdown arrived while we waited.
                            if lifecycle.is_shutdown() {
                                return None;
                            }
                            request = returned;
                        }
                        // Scheduler already exited and closed the queue.
                        Err(SendTimeoutError::Closed(_)) => return None,
                    }
                }
                None
            }
        }
    }

    /// Stop the scheduler: no further queued requests will be invoked
    /// once this returns. Anything still queued is discarded. Blocks
    /// until the scheduler task has fully exited; repeated and concurrent
    /// calls all return once that happens.
    ///
    /// Only meaningful in `Mode::Async`; other modes have no scheduler
    /// and return `ShutdownNotApplicable`.
    pub async fn start_shutdown(&self) -> Result<(), ThrottleError> {
        match &self.engine {
            Engine::Queued {
                lifecycle, worker, ..
            } => {
                lifecycle.begin_shutdown();
                // The handle slot stays locked across the join so a
                // second caller blocks until the first join completes.
                let mut slot = worker.lock().await;
                if let Some(handle) = slot.take() {
                    if handle.await.is_err() {
                        warn!("scheduler task did not exit cleanly");
                    }
                }
                Ok(())
            }
            Engine::Gate { .. } => Err(ThrottleError::ShutdownNotApplicable),
        }
    }

    /// Approximate number of queued, not-yet-invoked requests. Always 0
    /// for the synchronous modes.
    pub fn len(&self) -> usize {
        match &self.engine {
            Engine::Queued { queue, .. } => queue.max_capacity() - queue.capacity(),
            Engine::Gate { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn requests(&self) -> u32 {
        self.requests
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// The steady-state spacing `period / requests`.
    pub fn target_interval(&self) -> Duration {
        self.target_interval
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn now_secs(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

impl fmt::Display for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Throttle(requests={}, period={:?}",
            self.requests, self.period
        )?;
        match self.mode {
            Mode::Async { queue_capacity } => {
                write!(f, ", mode=Async, queue_capacity={queue_capacity}")?;
            }
            Mode::Sync => write!(f, ", mode=Sync")?,
            Mode::SyncEarlyBurst { early_count } => {
                write!(f, ", mode=SyncEarlyBurst, early_count={early_count}")?;
            }
            Mode::SyncLeakyBucket { bucket_capacity } => {
                write!(f, ", mode=SyncLeakyBucket, bucket_capacity={bucket_capacity:?}")?;
            }
        }
        write!(f, ")")
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        // A detached scheduler must not outlive the facade by more than a
        // dequeue timeout. The channel also closes when the sender drops;
        // the scheduler treats either as the signal to wind down.
        if let Engine::Queued { lifecycle, .. } = &self.engine {
            lifecycle.begin_shutdown();
        }
    }
}
