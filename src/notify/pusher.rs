use crate::bus_master::BusMaster;
use crate::command::{SearchBusCmd, SearchCriteria};
use crate::error::CommandError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Drives periodic pushes at a period chosen by a coordinator.
pub trait PeriodicPusher: Send + Sync {
    /// Sets the push period; `None` disables pushing. Returns `true` when the
    /// change caused a push to start immediately.
    fn adjust_period(&self, period: Option<Duration>) -> bool;

    fn current_period(&self) -> Option<Duration>;
}

struct TimerState {
    period: Option<Duration>,
    last_push: Option<Instant>,
    cancel: Option<CancellationToken>,
}

/// Idle/armed timer shared by pusher implementations.
///
/// Armed, it fires once after a computed delay and then every period. The
/// delay is what is left of the period since the last push, so tightening the
/// period right after a push does not cause a redundant back-to-back push.
pub struct PushTimer {
    runtime: Handle,
    state: Mutex<TimerState>,
}

impl PushTimer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            state: Mutex::new(TimerState {
                period: None,
                last_push: None,
                cancel: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)arms the timer to call `tick` every `period`, or disarms it on
    /// `None`. Returns whether the first tick is due immediately.
    pub fn adjust<F>(&self, period: Option<Duration>, tick: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self.lock();
        if state.period == period {
            return false;
        }

        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        state.period = period;

        let Some(period) = period else {
            debug!("push timer idle");
            return false;
        };

        let delay = match state.last_push {
            Some(last) => period.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        };

        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());
        self.runtime
            .spawn(run_timer(delay, period, cancel, Arc::new(tick)));

        debug!(period = ?period, delay = ?delay, "push timer armed");
        delay.is_zero()
    }

    pub fn current_period(&self) -> Option<Duration> {
        self.lock().period
    }

    pub fn is_idle(&self) -> bool {
        self.lock().period.is_none()
    }

    pub fn mark_pushed(&self) {
        self.lock().last_push = Some(Instant::now());
    }

    pub fn last_push(&self) -> Option<Instant> {
        self.lock().last_push
    }
}

impl Drop for PushTimer {
    fn drop(&mut self) {
        if let Some(cancel) = self.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

async fn run_timer(
    delay: Duration,
    period: Duration,
    cancel: CancellationToken,
    tick: Arc<dyn Fn() + Send + Sync>,
) {
    let start = tokio::time::Instant::now() + delay;
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Bus I/O blocks, keep it off the async workers.
        let tick = Arc::clone(&tick);
        if let Err(e) = tokio::task::spawn_blocking(move || tick()).await {
            warn!(error = %e, "push task failed");
        }
    }
}

/// Pusher that executes a search command against the bus on every tick.
///
/// The command reports successful results to the bus's coordinator itself.
/// One command instance is reused while the pusher is armed and released
/// once it goes idle. It refers to the bus weakly, so dropping the last
/// handle to the bus drops its coordinators and stops this pusher's timer.
pub struct PusherByCommand {
    bus: Weak<BusMaster>,
    criteria: SearchCriteria,
    timer: PushTimer,
    in_flight: AtomicBool,
    retained: Mutex<Option<Arc<SearchBusCmd>>>,
    pushes: AtomicU64,
    weak_self: Weak<PusherByCommand>,
}

impl PusherByCommand {
    pub fn new(bus: Weak<BusMaster>, criteria: SearchCriteria, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            bus,
            criteria,
            timer: PushTimer::new(runtime),
            in_flight: AtomicBool::new(false),
            retained: Mutex::new(None),
            pushes: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    pub fn criteria(&self) -> SearchCriteria {
        self.criteria
    }

    /// Number of searches this pusher has executed.
    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    pub fn has_retained_command(&self) -> bool {
        self.lock_retained().is_some()
    }

    fn lock_retained(&self) -> MutexGuard<'_, Option<Arc<SearchBusCmd>>> {
        self.retained.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one search unless another push is still in flight, in which case
    /// this call returns at once.
    pub fn push(&self) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(criteria = %self.criteria, "push already in flight");
            return;
        }

        self.timer.mark_pushed();

        if self.bus.strong_count() > 0 {
            let command = self.command();
            self.pushes.fetch_add(1, Ordering::Relaxed);
            match command.execute() {
                Ok(result) => trace!(criteria = %self.criteria, ?result, "push finished"),
                Err(CommandError::Busy) => warn!(criteria = %self.criteria, "search command busy"),
            }
        } else {
            trace!(criteria = %self.criteria, "bus dropped, push skipped");
        }

        self.in_flight.store(false, Ordering::Release);

        if self.timer.is_idle() || self.bus.strong_count() == 0 {
            self.lock_retained().take();
        }
    }

    fn command(&self) -> Arc<SearchBusCmd> {
        let mut retained = self.lock_retained();
        Arc::clone(retained.get_or_insert_with(|| {
            Arc::new(SearchBusCmd::detached(
                self.bus.clone(),
                self.criteria,
                false,
            ))
        }))
    }
}

impl PeriodicPusher for PusherByCommand {
    fn adjust_period(&self, period: Option<Duration>) -> bool {
        let weak = self.weak_self.clone();
        let immediate = self.timer.adjust(period, move || {
            if let Some(pusher) = weak.upgrade() {
                pusher.push();
            }
        });

        if period.is_none() && !self.in_flight.load(Ordering::Acquire) {
            self.lock_retained().take();
        }

        immediate
    }

    fn current_period(&self) -> Option<Duration> {
        self.timer.current_period()
    }
}
