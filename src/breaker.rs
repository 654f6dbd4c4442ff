//! The circuit breaker state machine: `Closed` -> `Open` -> `HalfOpen` ->
//! `{Closed|Open}`, driven by both the request path (outcome recording) and
//! a single background task (timed transitions), per `spec.md` §4.2.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{BreakerSettings, StorageKind};
use crate::storage::{SlidingWindow, Storage, TumblingWindow};

/// The three states of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Normal operation — requests flow through.
    Closed,
    /// Error rate exceeded the threshold — requests are rejected immediately.
    Open,
    /// Recovery probe — a single admitted request decides the next transition.
    HalfOpen,
}

impl Status {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

struct Inner {
    status: AtomicU8,
    /// Bumped on every status write. A scheduled timer carries the
    /// generation observed at schedule time; on wakeup the task discards
    /// the timer if the generation has since moved on, rather than
    /// blindly re-applying a transition for whatever status it finds.
    generation: AtomicU64,
    storage: Box<dyn Storage>,
    max_error_rate: f64,
    time_to_halfopen: std::time::Duration,
    time_to_closed: std::time::Duration,
    /// Serializes all writes to `status` (and the scheduling that goes with
    /// them); reads of `status` never take this lock.
    mu: AsyncMutex<()>,
}

impl Inner {
    fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Write a new status and bump the generation. Callers must hold `mu`.
    /// Returns the new generation, to be attached to whatever timer this
    /// transition schedules.
    fn transition_to(&self, s: Status) -> u64 {
        self.status.store(s.as_u8(), Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// The circuit breaker. Owns its windowed counter storage and a single
/// background task that drives timed `Open -> HalfOpen -> Closed`
/// transitions independently of request traffic.
pub struct Breaker {
    inner: Arc<Inner>,
    schedule_tx: mpsc::Sender<(Instant, u64)>,
    stop_tx: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Breaker {
    /// Build a breaker from validated settings and spawn its transition task.
    pub fn new(settings: &BreakerSettings) -> Self {
        let storage: Box<dyn Storage> = match settings.storage_kind {
            StorageKind::Tumbling => Box::new(TumblingWindow::new(settings.time_window)),
            StorageKind::Sliding => Box::new(SlidingWindow::new(settings.time_window)),
        };

        let inner = Arc::new(Inner {
            status: AtomicU8::new(Status::Closed.as_u8()),
            generation: AtomicU64::new(0),
            storage,
            max_error_rate: settings.max_error_rate,
            time_to_halfopen: settings.time_to_halfopen,
            time_to_closed: settings.time_to_closed,
            mu: AsyncMutex::new(()),
        });

        // Capacity of 2 mirrors the teacher-adjacent original's buffered
        // channel: at most one outstanding schedule plus one in flight.
        let (schedule_tx, schedule_rx) = mpsc::channel(2);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task_inner = Arc::clone(&inner);
        let task_schedule_tx = schedule_tx.clone();
        let task = tokio::spawn(Self::run(task_inner, schedule_rx, stop_rx, task_schedule_tx));

        Self {
            inner,
            schedule_tx,
            stop_tx,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Background transition task: consumes one scheduled `(instant,
    /// generation)` pair at a time and sleeps until it fires. A newly
    /// scheduled pair that arrives while already sleeping is picked up on
    /// the *next* wakeup, not the current one — an accepted latency bound
    /// of one outstanding schedule.
    async fn run(
        inner: Arc<Inner>,
        mut schedule_rx: mpsc::Receiver<(Instant, u64)>,
        mut stop_rx: watch::Receiver<bool>,
        schedule_tx: mpsc::Sender<(Instant, u64)>,
    ) {
        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return;
                    }
                }
                received = schedule_rx.recv() => {
                    let Some((target, generation)) = received else { return };
                    tokio::select! {
                        () = tokio::time::sleep_until(target) => {
                            Self::apply_timer_transition(&inner, &schedule_tx, generation).await;
                        }
                        changed = stop_rx.changed() => {
                            if changed.is_err() || *stop_rx.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Apply the timer-driven transition this schedule was enqueued for,
    /// unless `expected_generation` is stale — i.e. a status write (a probe
    /// outcome, typically) has happened since this timer was scheduled. A
    /// stale wakeup is discarded rather than re-evaluated against whatever
    /// status happens to be current, since that status may belong to a
    /// later episode entirely.
    async fn apply_timer_transition(
        inner: &Arc<Inner>,
        schedule_tx: &mpsc::Sender<(Instant, u64)>,
        expected_generation: u64,
    ) {
        let _guard = inner.mu.lock().await;
        if inner.generation() != expected_generation {
            return;
        }
        match inner.status() {
            Status::Open => {
                let rate = inner.storage.error_rate();
                Self::log_transition(Status::Open, Status::HalfOpen, rate);
                let generation = inner.transition_to(Status::HalfOpen);
                let _ = schedule_tx
                    .send((Instant::now() + inner.time_to_closed, generation))
                    .await;
            }
            Status::HalfOpen => {
                let rate = inner.storage.error_rate();
                Self::log_transition(Status::HalfOpen, Status::Closed, rate);
                inner.transition_to(Status::Closed);
            }
            Status::Closed => {
                // Unreachable in practice: the generation check above
                // already guarantees status hasn't moved since this timer
                // was scheduled, and no schedule is ever enqueued for a
                // Closed status. Kept as a defensive no-op.
            }
        }
    }

    fn log_transition(from: Status, to: Status, error_rate: f64) {
        debug!(old_status = %from, new_status = %to, error_rate, "circuit breaker state transition");
    }

    /// Whether a request should be admitted. `false` iff the breaker is
    /// currently `Open`. This read is a plain atomic load — it is
    /// deliberately not synchronized with concurrent writers; staleness of
    /// at most one transition boundary is acceptable (see `spec.md` §5).
    pub fn allow_request(&self) -> bool {
        self.inner.status() != Status::Open
    }

    /// Record a successful observation. Never triggers a transition on its
    /// own — closing from `HalfOpen` only happens via the timer.
    pub fn add_success(&self, t: Instant) {
        self.inner.storage.add_success(t);
    }

    /// Record an error observation, possibly tripping the breaker open.
    pub async fn add_error(&self, t: Instant) {
        self.inner.storage.add_error(t);

        let _guard = self.inner.mu.lock().await;
        match self.inner.status() {
            Status::Closed => {
                let rate = self.inner.storage.error_rate();
                if rate >= self.inner.max_error_rate {
                    Self::log_transition(Status::Closed, Status::Open, rate);
                    let generation = self.inner.transition_to(Status::Open);
                    let _ = self
                        .schedule_tx
                        .send((t + self.inner.time_to_halfopen, generation))
                        .await;
                }
            }
            Status::HalfOpen => {
                let rate = self.inner.storage.error_rate();
                Self::log_transition(Status::HalfOpen, Status::Open, rate);
                let generation = self.inner.transition_to(Status::Open);
                let _ = self
                    .schedule_tx
                    .send((t + self.inner.time_to_halfopen, generation))
                    .await;
            }
            Status::Open => {
                // No rule for Open + error: already shielding the downstream,
                // and re-scheduling here would keep extending the open window.
            }
        }
    }

    /// Diagnostic read of the current status.
    pub fn status(&self) -> Status {
        self.inner.status()
    }

    /// Signal the transition task to stop and wait for it to join.
    /// Idempotent: calling this again after the task has already been
    /// joined is a no-op.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.task.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
