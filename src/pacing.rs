// Pacing arithmetic for the synchronous throttle modes.
//
// This is the pure core of the throttle: given "now" on a monotonic clock,
// decide how long the caller must wait before its request is on schedule,
// and advance the schedule. No I/O, no locking, no sleeping — the facade
// owns the mutex and performs the actual sleep.
//
// Times are f64 seconds measured from the owning throttle's creation
// instant. The one piece of state shared by all algorithms is
// `expected_arrival_time`: the earliest instant at which the next request
// counts as on-schedule. It never decreases.

/// Which admission algorithm a pacer runs.
///
/// The queued (async) mode never consults a pacer; its scheduler simply
/// sleeps the target interval between dequeues.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Algorithm {
    /// Pure interval spacing: every early arrival waits.
    Interval,
    /// Up to `budget` consecutive early arrivals pass undelayed, then one
    /// arrival is held back to realign with the schedule.
    EarlyBurst { budget: u32 },
    /// A virtual bucket of `capacity` seconds leaks at the sustained rate;
    /// each admission adds one target interval of fill. Arrivals that
    /// would overflow wait until the bucket has leaked enough room.
    LeakyBucket { capacity: f64 },
}

#[derive(Debug)]
pub(crate) struct Pacing {
    algorithm: Algorithm,
    target_interval: f64,
    expected_arrival_time: f64,
    early_arrival_count: u32,
}

impl Pacing {
    pub(crate) fn new(algorithm: Algorithm, target_interval: f64) -> Self {
        // The bucket starts with full burst credit: an arrival is admitted
        // undelayed while the fill (expected - now) stays within capacity,
        // so the schedule begins one full capacity in the past.
        let expected_arrival_time = match algorithm {
            Algorithm::LeakyBucket { capacity } => -capacity,
            _ => 0.0,
        };
        Self {
            algorithm,
            target_interval,
            expected_arrival_time,
            early_arrival_count: 0,
        }
    }

    /// Admit one request arriving at `now`, reserving its slot in the
    /// schedule. Returns the wait in seconds (0 when the arrival may
    /// proceed immediately). The state is committed here, before any
    /// sleeping, so concurrent callers each reserve a distinct slot.
    pub(crate) fn admit(&mut self, now: f64) -> f64 {
        match self.algorithm {
            Algorithm::Interval => {
                let wait = (self.expected_arrival_time - now).max(0.0);
                self.expected_arrival_time =
                    now.max(self.expected_arrival_time) + self.target_interval;
                wait
            }
            Algorithm::EarlyBurst { budget } => {
                if now >= self.expected_arrival_time {
                    // On-time or late arrivals restart the burst budget.
                    self.early_arrival_count = 0;
                    self.expected_arrival_time = now + self.target_interval;
                    0.0
                } else {
                    self.early_arrival_count += 1;
                    let wait = if self.early_arrival_count <= budget {
                        0.0
                    } else {
                        self.early_arrival_count = 0;
                        self.expected_arrival_time - now
                    };
                    self.expected_arrival_time += self.target_interval;
                    wait
                }
            }
            Algorithm::LeakyBucket { capacity } => {
                let wait = (self.expected_arrival_time - now).max(0.0);
                // Clamp at (now - capacity): idle time refills burst credit
                // up to the bucket's capacity, never beyond it.
                self.expected_arrival_time =
                    (now - capacity).max(self.expected_arrival_time) + self.target_interval;
                wait
            }
        }
    }

    /// Account for the request's completion time. A request that ran
    /// longer than the target interval pushes the schedule out so the
    /// next arrival is spaced from the completion, not from the plan —
    /// otherwise a slow request would let its successor go out early as
    /// observed by the service.
    pub(crate) fn finalize(&mut self, completed_at: f64) {
        let floor = match self.algorithm {
            Algorithm::LeakyBucket { capacity } => {
                completed_at - capacity + self.target_interval
            }
            _ => completed_at + self.target_interval,
        };
        self.expected_arrival_time = self.expected_arrival_time.max(floor);
    }

    #[cfg(test)]
    fn expected_arrival_time(&self) -> f64 {
        self.expected_arrival_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    /// Issue `n` back-to-back instantaneous requests starting at `start`,
    /// returning the admission times. Models a single caller that fires
    /// its next request the moment the previous one returns.
    fn admissions(pacing: &mut Pacing, n: usize, start: f64) -> Vec<f64> {
        let mut now = start;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let wait = pacing.admit(now);
            let admitted = now + wait;
            pacing.finalize(admitted);
            out.push(admitted);
            now = admitted;
        }
        out
    }

    fn assert_times(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!(
                (a - e).abs() < EPS,
                "admission {i}: expected {e}, got {a} (all: {actual:?})"
            );
        }
    }

    #[test]
    fn interval_first_request_is_immediate() {
        let mut p = Pacing::new(Algorithm::Interval, 1.0);
        assert!(p.admit(0.0).abs() < EPS);
    }

    #[test]
    fn interval_spaces_back_to_back_requests() {
        let mut p = Pacing::new(Algorithm::Interval, 1.0);
        let times = admissions(&mut p, 3, 0.0);
        assert_times(&times, &[0.0, 1.0, 2.0]);
    }

    #[test]
    fn interval_late_arrival_restarts_from_now() {
        let mut p = Pacing::new(Algorithm::Interval, 1.0);
        admissions(&mut p, 2, 0.0);
        // Long idle gap, then two more: no credit is carried over.
        let times = admissions(&mut p, 2, 50.0);
        assert_times(&times, &[50.0, 51.0]);
    }

    #[test]
    fn interval_slow_request_spaces_from_completion() {
        let mut p = Pacing::new(Algorithm::Interval, 1.0);
        assert!(p.admit(0.0).abs() < EPS);
        // The request itself took 2.5s.
        p.finalize(2.5);
        let wait = p.admit(2.5);
        assert!((wait - 1.0).abs() < EPS, "got wait {wait}");
    }

    #[test]
    fn early_burst_admits_budget_then_realigns() {
        // 4 requests per 2s (interval 0.5), budget 2: bursts of three
        // every 1.5s, the realigning request eating the whole delay.
        let mut p = Pacing::new(Algorithm::EarlyBurst { budget: 2 }, 0.5);
        let times = admissions(&mut p, 8, 0.0);
        assert_times(&times, &[0.0, 0.0, 0.0, 1.5, 1.5, 1.5, 3.0, 3.0]);
    }

    #[test]
    fn early_burst_zero_budget_matches_interval() {
        let mut burst = Pacing::new(Algorithm::EarlyBurst { budget: 0 }, 0.7);
        let mut plain = Pacing::new(Algorithm::Interval, 0.7);
        let a = admissions(&mut burst, 6, 0.0);
        let b = admissions(&mut plain, 6, 0.0);
        assert_times(&a, &b);
    }

    #[test]
    fn early_burst_on_time_arrival_resets_count() {
        let mut p = Pacing::new(Algorithm::EarlyBurst { budget: 2 }, 1.0);
        // Two early arrivals spend the budget...
        assert_times(&admissions(&mut p, 3, 0.0), &[0.0, 0.0, 0.0]);
        // ...but an on-time arrival restores it in full.
        let wait = p.admit(10.0);
        assert!(wait.abs() < EPS);
        p.finalize(10.0);
        let times = admissions(&mut p, 2, 10.0);
        assert_times(&times, &[10.0, 10.0]);
    }

    #[test]
    fn leaky_bucket_starts_with_full_credit() {
        // capacity 1.0, interval 0.5: two intervals of credit plus the
        // on-schedule slot admit three undelayed, then steady spacing.
        let mut p = Pacing::new(Algorithm::LeakyBucket { capacity: 1.0 }, 0.5);
        let times = admissions(&mut p, 6, 0.0);
        assert_times(&times, &[0.0, 0.0, 0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn leaky_bucket_idle_refills_credit_up_to_capacity() {
        let mut p = Pacing::new(Algorithm::LeakyBucket { capacity: 1.0 }, 0.5);
        admissions(&mut p, 6, 0.0);
        // Idle long past the drain point: credit caps at capacity, so the
        // follow-up burst looks exactly like the initial one.
        let times = admissions(&mut p, 5, 60.0);
        assert_times(&times, &[60.0, 60.0, 60.0, 60.5, 61.0]);
    }

    #[test]
    fn leaky_bucket_near_interval_capacity_allows_one_double() {
        // Capacity just under one interval: the second request slips in
        // almost immediately, everything after runs at full spacing.
        let mut p = Pacing::new(Algorithm::LeakyBucket { capacity: 0.4 }, 0.5);
        let times = admissions(&mut p, 4, 0.0);
        assert_times(&times, &[0.0, 0.1, 0.6, 1.1]);
    }

    #[test]
    fn expected_arrival_time_never_decreases() {
        for algorithm in [
            Algorithm::Interval,
            Algorithm::EarlyBurst { budget: 3 },
            Algorithm::LeakyBucket { capacity: 2.0 },
        ] {
            let mut p = Pacing::new(algorithm, 0.25);
            let mut last = p.expected_arrival_time();
            for now in [0.0, 0.0, 0.1, 5.0, 5.0, 5.0, 5.0, 12.0] {
                let wait = p.admit(now);
                p.finalize(now + wait);
                assert!(
                    p.expected_arrival_time() >= last,
                    "schedule moved backwards under {algorithm:?}"
                );
                last = p.expected_arrival_time();
            }
        }
    }
}
