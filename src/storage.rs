//! Windowed success/error counters backing the breaker's error-rate decision.
//!
//! Two variants are provided, matching `spec.md` §4.1: a lock-free
//! [`TumblingWindow`] that resets instantaneously at its boundary, and a
//! mutex-protected [`SlidingWindow`] that evicts per-second buckets older
//! than the window width. Both implement [`Storage`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// A time-bucketed success/error counter that answers [`error_rate`](Storage::error_rate).
pub trait Storage: Send + Sync {
    /// Record a successful observation at wall-clock time `t`.
    fn add_success(&self, t: Instant);
    /// Record an error observation at wall-clock time `t`.
    fn add_error(&self, t: Instant);
    /// Current error rate in `[0.0, 1.0]`. `0.0` when no errors have been observed.
    fn error_rate(&self) -> f64;
}

fn rate(successes: u64, errors: u64) -> f64 {
    if errors == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let rate = errors as f64 / (successes + errors) as f64;
    rate
}

/// Single window that resets to zero once the observation clock crosses
/// `end_of_window`, advancing the boundary by exactly one `window` before
/// the next increment is applied.
///
/// The reset is a single-winner compare-and-swap on an atomic "end of
/// window" timestamp (stored as nanoseconds since an internal base
/// instant) so the hot path never takes a lock.
pub struct TumblingWindow {
    base: Instant,
    window_nanos: u64,
    end_of_window_nanos: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
}

impl TumblingWindow {
    /// Create a new tumbling window of the given duration, starting now.
    ///
    /// `window` must be positive; validated upstream by
    /// [`crate::config::BreakerConfig::validate`].
    pub fn new(window: Duration) -> Self {
        debug_assert!(window > Duration::ZERO, "window duration must be positive");
        let base = Instant::now();
        let window_nanos = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
        Self {
            base,
            window_nanos,
            end_of_window_nanos: AtomicU64::new(window_nanos),
            successes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn nanos_since_base(&self, t: Instant) -> u64 {
        // Clock going backwards relative to `base` folds into the current
        // window instead of panicking.
        t.checked_duration_since(self.base)
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    /// Reset the window if `t` has crossed the current boundary. At most one
    /// concurrent caller performs the reset; the rest proceed straight to
    /// incrementing the (possibly freshly reset) counters.
    fn maybe_reset(&self, t_nanos: u64) {
        loop {
            let end = self.end_of_window_nanos.load(Ordering::Acquire);
            if t_nanos <= end {
                return;
            }
            let new_end = t_nanos.saturating_add(self.window_nanos);
            if self
                .end_of_window_nanos
                .compare_exchange(end, new_end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.successes.store(0, Ordering::Release);
                self.errors.store(0, Ordering::Release);
                return;
            }
            // Lost the race: loop and re-check against the winner's new boundary.
        }
    }
}

impl Storage for TumblingWindow {
    fn add_success(&self, t: Instant) {
        let nanos = self.nanos_since_base(t);
        self.maybe_reset(nanos);
        self.successes.fetch_add(1, Ordering::AcqRel);
    }

    fn add_error(&self, t: Instant) {
        let nanos = self.nanos_since_base(t);
        self.maybe_reset(nanos);
        self.errors.fetch_add(1, Ordering::AcqRel);
    }

    fn error_rate(&self) -> f64 {
        rate(
            self.successes.load(Ordering::Acquire),
            self.errors.load(Ordering::Acquire),
        )
    }
}

#[derive(Default)]
struct SlidingBuckets {
    successes: HashMap<u64, u64>,
    errors: HashMap<u64, u64>,
}

/// Continuously advancing window made of one-second buckets, keyed by
/// seconds elapsed since an internal base instant. Buckets older than the
/// window width are swept out on every update.
///
/// `spec.md` §9 requires the eviction sweep to be unconditional (no
/// reliance on ordered map iteration), so every update does a full
/// `retain` pass over both bucket maps.
pub struct SlidingWindow {
    base: Instant,
    window_secs: u64,
    buckets: Mutex<SlidingBuckets>,
}

impl SlidingWindow {
    /// Create a new sliding window of the given duration, starting now.
    pub fn new(window: Duration) -> Self {
        debug_assert!(window > Duration::ZERO, "window duration must be positive");
        Self {
            base: Instant::now(),
            window_secs: window.as_secs().max(1),
            buckets: Mutex::new(SlidingBuckets::default()),
        }
    }

    fn bucket_key(&self, t: Instant) -> u64 {
        t.checked_duration_since(self.base)
            .map_or(0, |d| d.as_secs())
    }

    fn evict_and_increment(&self, t: Instant, errors: bool) {
        let key = self.bucket_key(t);
        let cutoff = key.saturating_sub(self.window_secs);

        let mut buckets = self.buckets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        buckets.successes.retain(|k, _| *k >= cutoff);
        buckets.errors.retain(|k, _| *k >= cutoff);

        let map = if errors {
            &mut buckets.errors
        } else {
            &mut buckets.successes
        };
        *map.entry(key).or_insert(0) += 1;
    }
}

impl Storage for SlidingWindow {
    fn add_success(&self, t: Instant) {
        self.evict_and_increment(t, false);
    }

    fn add_error(&self, t: Instant) {
        self.evict_and_increment(t, true);
    }

    fn error_rate(&self) -> f64 {
        let buckets = self.buckets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let successes: u64 = buckets.successes.values().sum();
        let errors: u64 = buckets.errors.values().sum();
        rate(successes, errors)
    }
}
