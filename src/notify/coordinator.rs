use super::{NotifyScope, PeriodicPusher, Subscriber, SubscriberId};
use crate::bus_master::TimeSource;
use crate::error::ScheduleError;
use crate::search_result::SearchResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyStats {
    pub results_received: u64,
    pub results_suppressed: u64,
    pub fan_outs: u64,
    pub cached_deliveries: u64,
    pub currently_scheduled: usize,
}

struct Subscription {
    subscriber: Subscriber,
    min_period_msec: u64,
}

struct CoordinatorState {
    subscriptions: HashMap<SubscriberId, Subscription>,
    last_result: Option<Arc<SearchResult>>,
    stats: NotifyStats,
}

impl CoordinatorState {
    fn effective_period_msec(&self) -> Option<u64> {
        self.subscriptions
            .values()
            .map(|subscription| subscription.min_period_msec)
            .min()
    }

    fn snapshot(&self) -> Vec<Subscriber> {
        self.subscriptions
            .values()
            .map(|subscription| subscription.subscriber.clone())
            .collect()
    }
}

/// Subscription table and last delivered result for one search scope.
///
/// All public methods are cheap and non-blocking; they run under a single
/// lock so the table and the derived period never disagree. Bus I/O happens
/// on the pusher's timer, and delivery on a separate blocking task per batch.
pub struct NotifySearchCoordinator {
    scope: NotifyScope,
    pusher: Arc<dyn PeriodicPusher>,
    clock: Arc<dyn TimeSource>,
    runtime: Handle,
    state: Mutex<CoordinatorState>,
}

impl NotifySearchCoordinator {
    pub fn new(
        scope: NotifyScope,
        pusher: Arc<dyn PeriodicPusher>,
        clock: Arc<dyn TimeSource>,
        runtime: Handle,
    ) -> Self {
        Self {
            scope,
            pusher,
            clock,
            runtime,
            state: Mutex::new(CoordinatorState {
                subscriptions: HashMap::new(),
                last_result: None,
                stats: NotifyStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn scope(&self) -> NotifyScope {
        self.scope
    }

    pub fn pusher(&self) -> &Arc<dyn PeriodicPusher> {
        &self.pusher
    }

    /// Registers `subscriber` to hear about results at least every
    /// `min_period_msec` milliseconds.
    pub fn schedule_search_notify_for(
        &self,
        subscriber: &Subscriber,
        min_period_msec: u64,
    ) -> Result<(), ScheduleError> {
        if min_period_msec == 0 {
            return Err(ScheduleError::InvalidPeriod);
        }

        let id = subscriber.id();
        let mut state = self.lock();
        if state.subscriptions.contains_key(&id) {
            return Err(ScheduleError::AlreadyScheduled(id));
        }

        state.subscriptions.insert(
            id,
            Subscription {
                subscriber: subscriber.clone(),
                min_period_msec,
            },
        );
        state.stats.currently_scheduled = state.subscriptions.len();

        let effective = state.effective_period_msec();
        let immediate = self.pusher.adjust_period(effective.map(Duration::from_millis));

        if immediate {
            // A fresh search is already on its way; the cached one must not
            // pre-empt it, and everyone hears the fresh one even if unchanged.
            state.last_result = None;
        } else if let Some(cached) = state.last_result.clone() {
            let age = self
                .clock
                .current_time_millis()
                .saturating_sub(cached.write_ctm());
            if age <= min_period_msec {
                state.stats.cached_deliveries += 1;
                self.fan_out(vec![subscriber.clone()], cached);
            }
        }

        info!(
            scope = %self.scope,
            subscriber = %id,
            label = subscriber.label(),
            period_ms = min_period_msec,
            effective_ms = effective,
            immediate,
            "search notify scheduled"
        );
        Ok(())
    }

    pub fn update_scheduled_search_notify_for(
        &self,
        subscriber: SubscriberId,
        min_period_msec: u64,
    ) -> Result<(), ScheduleError> {
        let mut state = self.lock();
        let Some(subscription) = state.subscriptions.get_mut(&subscriber) else {
            return Err(ScheduleError::NotScheduled(subscriber));
        };

        if min_period_msec == 0 {
            return Err(ScheduleError::InvalidPeriod);
        }
        if subscription.min_period_msec == min_period_msec {
            return Err(ScheduleError::PeriodUnchanged {
                subscriber,
                period_msec: min_period_msec,
            });
        }

        subscription.min_period_msec = min_period_msec;

        let effective = state.effective_period_msec();
        let immediate = self.pusher.adjust_period(effective.map(Duration::from_millis));
        if immediate {
            state.last_result = None;
        }

        info!(
            scope = %self.scope,
            %subscriber,
            period_ms = min_period_msec,
            effective_ms = effective,
            immediate,
            "search notify updated"
        );
        Ok(())
    }

    pub fn cancel_scheduled_search_notify_for(
        &self,
        subscriber: SubscriberId,
    ) -> Result<(), ScheduleError> {
        let mut state = self.lock();
        if state.subscriptions.remove(&subscriber).is_none() {
            return Err(ScheduleError::NotScheduled(subscriber));
        }
        state.stats.currently_scheduled = state.subscriptions.len();

        let effective = state.effective_period_msec();
        self.pusher.adjust_period(effective.map(Duration::from_millis));

        info!(
            scope = %self.scope,
            %subscriber,
            effective_ms = effective,
            "search notify cancelled"
        );
        Ok(())
    }

    /// Drops every subscription and disables the pusher. Returns whether
    /// anything was scheduled.
    pub fn cancel_all_scheduled_search_notify_for(&self) -> bool {
        let mut state = self.lock();
        let cancelled = !state.subscriptions.is_empty();
        state.subscriptions.clear();
        state.stats.currently_scheduled = 0;
        self.pusher.adjust_period(None);

        if cancelled {
            info!(scope = %self.scope, "all search notifies cancelled");
        }
        cancelled
    }

    /// Accepts a successful search. Cached unconditionally; delivered to a
    /// snapshot of current subscribers only when the fingerprint changed.
    pub fn notify_search_result(&self, result: Arc<SearchResult>) {
        let mut state = self.lock();
        state.stats.results_received += 1;

        let changed = state
            .last_result
            .as_ref()
            .map(|previous| previous.fingerprint())
            != Some(result.fingerprint());
        state.last_result = Some(Arc::clone(&result));

        if !changed {
            state.stats.results_suppressed += 1;
            trace!(scope = %self.scope, fingerprint = result.fingerprint(), "search result unchanged");
            return;
        }
        if state.subscriptions.is_empty() {
            return;
        }

        let snapshot = state.snapshot();
        state.stats.fan_outs += 1;
        drop(state);

        debug!(
            scope = %self.scope,
            subscribers = snapshot.len(),
            devices = result.len(),
            fingerprint = result.fingerprint(),
            "search result changed"
        );
        self.fan_out(snapshot, result);
    }

    fn fan_out(&self, subscribers: Vec<Subscriber>, result: Arc<SearchResult>) {
        drop(self.runtime.spawn_blocking(move || {
            for subscriber in &subscribers {
                subscriber.deliver(&result);
            }
        }));
    }

    /// Minimum of all requested periods, or `None` when nobody is scheduled.
    pub fn effective_period(&self) -> Option<Duration> {
        self.lock().effective_period_msec().map(Duration::from_millis)
    }

    pub fn is_scheduled(&self, subscriber: SubscriberId) -> bool {
        self.lock().subscriptions.contains_key(&subscriber)
    }

    pub fn scheduled_period_msec(&self, subscriber: SubscriberId) -> Option<u64> {
        self.lock()
            .subscriptions
            .get(&subscriber)
            .map(|subscription| subscription.min_period_msec)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn last_result(&self) -> Option<Arc<SearchResult>> {
        self.lock().last_result.clone()
    }

    pub fn stats(&self) -> NotifyStats {
        self.lock().stats
    }
}

impl std::fmt::Debug for NotifySearchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifySearchCoordinator")
            .field("scope", &self.scope)
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}
