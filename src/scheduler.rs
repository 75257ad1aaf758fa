// The background scheduler behind queued-mode throttles.
//
// One scheduler task per throttle, spawned at construction. It pops
// requests off the bounded queue in arrival order, invokes them, and
// sleeps the target interval between invocations. Dequeues and pacing
// sleeps are bounded to ~1s slices so a shutdown request never waits
// long to be noticed.
//
// The scheduler owns only what it needs — the queue receiver, the shared
// lifecycle flag, and the optional completion signal — never the facade,
// so dropping the `Throttle` while the scheduler is mid-sleep is sound:
// the sender side closes, the next dequeue returns `None`, and the task
// winds itself down.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// How long a dequeue attempt blocks before re-checking for shutdown.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on one pacing-sleep slice. Long intervals are slept in
/// slices so a shutdown request aborts the remaining wait promptly.
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(1);

type BoxedRequestFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A queued request: the deferred call, with its arguments captured and
/// its output discarded. Created on enqueue, consumed on dequeue.
pub(crate) struct Request {
    call: Box<dyn FnOnce() -> BoxedRequestFuture + Send>,
}

impl Request {
    pub(crate) fn new<F, Fut>(request: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
    {
        Self {
            call: Box::new(move || {
                let fut = request();
                Box::pin(async move {
                    let _ = fut.await;
                })
            }),
        }
    }

    fn into_future(self) -> BoxedRequestFuture {
        (self.call)()
    }
}

/// Shared active/shutdown state for a queued-mode throttle.
///
/// Single writer (whoever requests shutdown), read by the scheduler and
/// by `send`; the transition is one-way, so a plain atomic is enough.
pub(crate) struct Lifecycle {
    shutdown: AtomicBool,
    external_request: Option<watch::Receiver<bool>>,
}

impl Lifecycle {
    pub(crate) fn new(external_request: Option<watch::Receiver<bool>>) -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            external_request,
        }
    }

    /// Whether shutdown has been requested, directly or through the
    /// client's external signal. Observing the external signal latches
    /// the internal flag.
    pub(crate) fn is_shutdown(&self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(request) = &self.external_request {
            if *request.borrow() {
                self.shutdown.store(true, Ordering::SeqCst);
                return true;
            }
        }
        false
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct Scheduler {
    queue: mpsc::Receiver<Request>,
    lifecycle: Arc<Lifecycle>,
    target_interval: Duration,
    shutdown_complete: Option<oneshot::Sender<()>>,
}

impl Scheduler {
    pub(crate) fn new(
        queue: mpsc::Receiver<Request>,
        lifecycle: Arc<Lifecycle>,
        target_interval: Duration,
        shutdown_complete: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            queue,
            lifecycle,
            target_interval,
            shutdown_complete,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(interval = ?self.target_interval, "request scheduler started");
        while !self.lifecycle.is_shutdown() {
            let request = match timeout(DEQUEUE_TIMEOUT, self.queue.recv()).await {
                Err(_) => continue, // timed out; the loop re-checks for shutdown
                Ok(None) => break,  // facade dropped; nothing more will arrive
                Ok(Some(request)) => request,
            };
            invoke(request).await;
            self.pace().await;
        }
        self.drain();
        if let Some(complete) = self.shutdown_complete.take() {
            let _ = complete.send(());
        }
        debug!("request scheduler stopped");
    }

    /// Sleep the target interval in shutdown-aware slices.
    async fn pace(&self) {
        let mut remaining = self.target_interval;
        while !remaining.is_zero() && !self.lifecycle.is_shutdown() {
            let slice = remaining.min(MAX_SLEEP_SLICE);
            sleep(slice).await;
            remaining -= slice;
        }
    }

    /// Discard whatever is still queued without invoking it. The receiver
    /// is closed first, so a `send` that wins the enqueue race either
    /// fails with `Closed` or leaves its descriptor to be destroyed with
    /// the channel — it is never invoked.
    fn drain(&mut self) {
        self.queue.close();
        let mut dropped = 0usize;
        while self.queue.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded queued requests at shutdown");
        }
    }
}

/// Run one queued request, containing any panic it raises. A single bad
/// request must not take the scheduler down with it.
async fn invoke(request: Request) {
    if let Err(payload) = AssertUnwindSafe(request.into_future()).catch_unwind().await {
        warn!(error = panic_message(payload.as_ref()), "queued request panicked");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
