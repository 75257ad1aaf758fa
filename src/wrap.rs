// Function-wrapping adapter.
//
// `Throttled` binds a request function to its own throttle so call sites
// don't thread a `Throttle` around: build it once, then `call(args)`
// anywhere. It is a convenience layer only — all pacing, queuing, and
// shutdown behavior is the bound throttle's.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};

use crate::error::ThrottleError;
use crate::mode::Mode;
use crate::throttle::Throttle;

/// External shutdown coordination for a wrapped queued-mode throttle.
///
/// The caller keeps the `watch` sender and flips it to `true` to request
/// shutdown; the scheduler folds that signal into its shutdown checks.
/// When the scheduler has fully exited it fires `shutdown_complete` once,
/// and the caller awaits the paired receiver.
pub struct ShutdownSignals {
    pub shutdown_request: watch::Receiver<bool>,
    pub shutdown_complete: oneshot::Sender<()>,
}

pub struct Throttled<F> {
    throttle: Throttle,
    request_fn: Arc<F>,
}

impl<F> Throttled<F> {
    /// Wrap `request_fn` with a throttle of its own.
    pub fn new(
        request_fn: F,
        requests: u32,
        period: Duration,
        mode: Mode,
    ) -> Result<Self, ThrottleError> {
        Ok(Self {
            throttle: Throttle::new(requests, period, mode)?,
            request_fn: Arc::new(request_fn),
        })
    }

    /// Wrap `request_fn` with a queued-mode throttle driven by external
    /// shutdown signals. This is the only constructor that accepts the
    /// signal pair; any mode other than `Mode::Async` is rejected with
    /// `InvalidShutdownSignal`.
    pub fn with_shutdown_signals(
        request_fn: F,
        requests: u32,
        period: Duration,
        mode: Mode,
        signals: ShutdownSignals,
    ) -> Result<Self, ThrottleError> {
        Ok(Self {
            throttle: Throttle::build(requests, period, mode, Some(signals))?,
            request_fn: Arc::new(request_fn),
        })
    }

    /// Invoke the wrapped function through the throttle. Returns the
    /// function's output in the synchronous modes, `None` in queued mode.
    pub async fn call<A, Fut, T>(&self, args: A) -> Option<T>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        A: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let request_fn = Arc::clone(&self.request_fn);
        self.throttle.send(move || (*request_fn)(args)).await
    }

    /// The bound throttle, for `len`, `start_shutdown`, and diagnostics.
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::{sleep, Instant};

    #[tokio::test(start_paused = true)]
    async fn wrapped_call_forwards_args_and_output() {
        let wrapped = Throttled::new(
            |n: u32| async move { n * 7 },
            10,
            Duration::from_secs(1),
            Mode::Sync,
        )
        .unwrap();
        assert_eq!(wrapped.call(6).await, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn wrapped_calls_are_throttled() {
        let wrapped =
            Throttled::new(|_: ()| async {}, 1, Duration::from_secs(1), Mode::Sync).unwrap();
        let start = Instant::now();
        wrapped.call(()).await;
        wrapped.call(()).await;
        assert!(
            start.elapsed() >= Duration::from_millis(950),
            "second call should have waited, elapsed {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn signals_rejected_outside_queued_mode() {
        let (_request_tx, request_rx) = watch::channel(false);
        let (complete_tx, _complete_rx) = oneshot::channel();
        let result = Throttled::with_shutdown_signals(
            |_: ()| async {},
            1,
            Duration::from_secs(1),
            Mode::Sync,
            ShutdownSignals {
                shutdown_request: request_rx,
                shutdown_complete: complete_tx,
            },
        );
        assert_eq!(result.err(), Some(ThrottleError::InvalidShutdownSignal));
    }

    #[tokio::test(start_paused = true)]
    async fn external_signals_drive_shutdown() {
        let (request_tx, request_rx) = watch::channel(false);
        let (complete_tx, complete_rx) = oneshot::channel();

        let invoked = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&invoked);
        let wrapped = Throttled::with_shutdown_signals(
            move |_: ()| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
            10,
            Duration::from_secs(1),
            Mode::Async { queue_capacity: 64 },
            ShutdownSignals {
                shutdown_request: request_rx,
                shutdown_complete: complete_tx,
            },
        )
        .unwrap();

        for _ in 0..20 {
            wrapped.call(()).await;
        }
        sleep(Duration::from_millis(250)).await;

        request_tx.send(true).unwrap();
        complete_rx.await.unwrap();

        let ran_before_shutdown = invoked.load(Ordering::SeqCst);
        assert!(
            ran_before_shutdown < 20,
            "shutdown should strand the queue tail"
        );

        // Everything after the signal is dropped on the floor.
        wrapped.call(()).await;
        sleep(Duration::from_secs(3)).await;
        assert_eq!(invoked.load(Ordering::SeqCst), ran_before_shutdown);
    }
}
