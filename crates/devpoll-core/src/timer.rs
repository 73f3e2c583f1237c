//! Recurring-task scheduling and the per-device poll timer.
//!
//! The scheduler is injected rather than global: the agent shares one
//! [`TokioScheduler`] across all devices, tests drive a [`ManualScheduler`]
//! by hand.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Future produced by one tick.
pub type TickFuture = BoxFuture<'static, ()>;

/// Callback invoked on every tick.
pub type TickFn = Arc<dyn Fn() -> TickFuture + Send + Sync>;

/// A live recurring-task registration.
pub trait Registration: Send + Sync {
    /// Cancel the next scheduled run. A run already in progress completes.
    /// Idempotent.
    fn cancel(&self);

    /// Whether [`Registration::cancel`] has been called.
    fn is_cancelled(&self) -> bool;
}

/// Executes recurring tasks.
pub trait PollScheduler: Send + Sync {
    /// Run `tick` immediately and then again `period` after each run
    /// completes, until the returned registration is cancelled or dropped.
    fn schedule_recurring(&self, period: Duration, tick: TickFn) -> Box<dyn Registration>;
}

/// The single recurring poll registration of one device.
///
/// Cancel-and-discard: there is no pause and no in-place period change.
/// Dropping the timer cancels it.
pub struct PollTimer {
    period: Duration,
    registration: Box<dyn Registration>,
}

impl PollTimer {
    /// Register a new recurring tick with the scheduler.
    #[must_use]
    pub fn start(scheduler: &dyn PollScheduler, period: Duration, tick: TickFn) -> Self {
        let registration = scheduler.schedule_recurring(period, tick);
        Self {
            period,
            registration,
        }
    }

    /// Period the timer was started with.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Cancel and discard.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        self.registration.cancel();
    }
}

impl std::fmt::Debug for PollTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollTimer")
            .field("period", &self.period)
            .field("cancelled", &self.registration.is_cancelled())
            .finish()
    }
}

/// Scheduler backed by the tokio runtime; one task per registration so a
/// slow device never stalls another.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Scheduler on the given runtime.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

struct TokioRegistration {
    cancel_tx: watch::Sender<bool>,
}

impl Registration for TokioRegistration {
    fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

impl PollScheduler for TokioScheduler {
    fn schedule_recurring(&self, period: Duration, tick: TickFn) -> Box<dyn Registration> {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        self.handle.spawn(async move {
            loop {
                if *cancel_rx.borrow() {
                    break;
                }

                // Not raced against cancellation: an in-flight tick completes.
                tick().await;

                tokio::select! {
                    () = tokio::time::sleep(period) => {}
                    _ = cancel_rx.changed() => break,
                }
            }
            tracing::trace!(?period, "Recurring task finished");
        });

        Box::new(TokioRegistration { cancel_tx })
    }
}

/// Deterministic scheduler for tests: records registrations and only runs a
/// tick when asked to.
#[derive(Default, Clone)]
pub struct ManualScheduler {
    entries: Arc<Mutex<Vec<ManualEntry>>>,
}

struct ManualEntry {
    period: Duration,
    tick: TickFn,
    cancelled: Arc<AtomicBool>,
}

struct ManualRegistration {
    cancelled: Arc<AtomicBool>,
}

impl Registration for ManualRegistration {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl PollScheduler for ManualScheduler {
    fn schedule_recurring(&self, period: Duration, tick: TickFn) -> Box<dyn Registration> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.entries.lock().push(ManualEntry {
            period,
            tick,
            cancelled: Arc::clone(&cancelled),
        });
        Box::new(ManualRegistration { cancelled })
    }
}

impl ManualScheduler {
    /// New scheduler with no registrations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total registrations ever made.
    #[must_use]
    pub fn registrations(&self) -> usize {
        self.entries.lock().len()
    }

    /// Periods of registrations that have not been cancelled.
    #[must_use]
    pub fn active_periods(&self) -> Vec<Duration> {
        self.entries
            .lock()
            .iter()
            .filter(|e| !e.cancelled.load(Ordering::SeqCst))
            .map(|e| e.period)
            .collect()
    }

    /// Number of registrations that have not been cancelled.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active_periods().len()
    }

    /// Run one tick of every active registration, in registration order.
    pub async fn fire(&self) {
        let ticks: Vec<TickFn> = self
            .entries
            .lock()
            .iter()
            .filter(|e| !e.cancelled.load(Ordering::SeqCst))
            .map(|e| Arc::clone(&e.tick))
            .collect();

        for tick in ticks {
            tick().await;
        }
    }

    /// Tick callback of the most recent registration, cancelled or not.
    /// Used to simulate a tick that was already in flight when its timer
    /// was stopped.
    #[must_use]
    pub fn last_tick(&self) -> Option<TickFn> {
        self.entries.lock().last().map(|e| Arc::clone(&e.tick))
    }
}
