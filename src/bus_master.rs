//! The bus master façade and the contract a bus driver implements.
//!
//! A [`BusDriver`] owns the transport (real adapter or [`crate::sim::SimulatedBus`])
//! and performs one wire operation per call, reporting anything other than
//! success as a [`BusFault`]. [`BusMaster`] wraps a driver, tracks whether the
//! bus is started, hands out fresh command instances and hosts the two search
//! notification coordinators (general and alarm).

use crate::address::DeviceAddress;
use crate::command::{
    ConvertTCmd, ReadPowerSupplyCmd, ReadScratchpadCmd, SearchBusCmd, SearchCriteria,
    StartBusCmd, StopBusCmd, WriteScratchpadCmd,
};
use crate::error::{BusFault, ScheduleError};
use crate::logger::Logger;
use crate::notify::{
    NotifyScope, NotifySearchCoordinator, NotifyStats, PusherByCommand, Subscriber, SubscriberId,
};
use crate::search_result::SearchResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Bus-local clock. Every `write_ctm` is comparable against it.
pub trait TimeSource: Send + Sync {
    /// Milliseconds on the bus clock; always greater than zero.
    fn current_time_millis(&self) -> u64;
}

/// Wire-level operations a bus driver supplies.
///
/// Each call performs one complete operation (reset, ROM select/search,
/// function command) and translates the wire outcome into `Ok` or a
/// [`BusFault`]. Drivers may log progress into the supplied logger.
pub trait BusDriver: TimeSource {
    fn name(&self) -> &str;

    fn open(&self, log: &dyn Logger) -> Result<(), BusFault>;

    fn close(&self, log: &dyn Logger) -> Result<(), BusFault>;

    /// Addresses in discovery order.
    fn search(&self, criteria: SearchCriteria, log: &dyn Logger)
        -> Result<Vec<DeviceAddress>, BusFault>;

    /// Starts a temperature conversion on one device, or on all of them.
    fn convert_t(&self, target: Option<&DeviceAddress>, log: &dyn Logger) -> Result<(), BusFault>;

    /// `true` when the device is externally powered, `false` when parasitic.
    fn read_power_supply(&self, target: &DeviceAddress, log: &dyn Logger) -> Result<bool, BusFault>;

    fn read_scratchpad(
        &self,
        target: &DeviceAddress,
        len: usize,
        log: &dyn Logger,
    ) -> Result<Vec<u8>, BusFault>;

    fn write_scratchpad(
        &self,
        target: &DeviceAddress,
        data: &[u8],
        log: &dyn Logger,
    ) -> Result<(), BusFault>;
}

pub struct BusMaster {
    driver: Arc<dyn BusDriver>,
    started: AtomicBool,
    lifecycle: Mutex<()>,
    general: NotifySearchCoordinator,
    alarm: NotifySearchCoordinator,
}

impl BusMaster {
    /// Wraps `driver`. Timers and notification fan-out run on `runtime`.
    pub fn new<D: BusDriver + 'static>(driver: Arc<D>, runtime: Handle) -> Arc<Self> {
        let clock: Arc<dyn TimeSource> = driver.clone();
        let driver: Arc<dyn BusDriver> = driver;

        Arc::new_cyclic(|weak: &Weak<BusMaster>| {
            let general_pusher =
                PusherByCommand::new(weak.clone(), SearchCriteria::All, runtime.clone());
            let alarm_pusher =
                PusherByCommand::new(weak.clone(), SearchCriteria::Alarming, runtime.clone());

            Self {
                driver,
                started: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                general: NotifySearchCoordinator::new(
                    NotifyScope::General,
                    general_pusher,
                    Arc::clone(&clock),
                    runtime.clone(),
                ),
                alarm: NotifySearchCoordinator::new(
                    NotifyScope::Alarm,
                    alarm_pusher,
                    clock,
                    runtime,
                ),
            }
        })
    }

    pub fn name(&self) -> &str {
        self.driver.name()
    }

    pub fn current_time_millis(&self) -> u64 {
        self.driver.current_time_millis()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn driver(&self) -> &dyn BusDriver {
        self.driver.as_ref()
    }

    /// Opens the bus. No-op when already started.
    pub fn start_bus(&self, log: &dyn Logger) -> Result<(), BusFault> {
        let _guard = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_started() {
            log.debug("bus already started");
            return Ok(());
        }

        self.driver.open(log)?;
        self.started.store(true, Ordering::Release);
        info!(bus = self.name(), "bus started");
        Ok(())
    }

    /// Closes the bus. No-op when already stopped.
    pub fn stop_bus(&self, log: &dyn Logger) -> Result<(), BusFault> {
        let _guard = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_started() {
            log.debug("bus already stopped");
            return Ok(());
        }

        self.started.store(false, Ordering::Release);
        self.driver.close(log)?;
        info!(bus = self.name(), "bus stopped");
        Ok(())
    }

    // Command factories. Every call returns a fresh instance.

    pub fn query_start_bus_cmd(self: &Arc<Self>, log: bool) -> StartBusCmd {
        StartBusCmd::new(Arc::clone(self), log)
    }

    pub fn query_stop_bus_cmd(self: &Arc<Self>, log: bool) -> StopBusCmd {
        StopBusCmd::new(Arc::clone(self), log)
    }

    pub fn query_search_cmd(self: &Arc<Self>, criteria: SearchCriteria, log: bool) -> SearchBusCmd {
        SearchBusCmd::new(Arc::clone(self), criteria, log)
    }

    pub fn query_search_by_alarm_cmd(self: &Arc<Self>, log: bool) -> SearchBusCmd {
        self.query_search_cmd(SearchCriteria::Alarming, log)
    }

    pub fn query_search_by_family_cmd(self: &Arc<Self>, family_code: u8, log: bool) -> SearchBusCmd {
        self.query_search_cmd(SearchCriteria::Family(family_code), log)
    }

    /// Conversion on `target`, or on every device when `None`.
    pub fn query_convert_t_cmd(self: &Arc<Self>, target: Option<DeviceAddress>, log: bool) -> ConvertTCmd {
        ConvertTCmd::new(Arc::clone(self), target, log)
    }

    pub fn query_read_power_supply_cmd(self: &Arc<Self>, target: DeviceAddress, log: bool) -> ReadPowerSupplyCmd {
        ReadPowerSupplyCmd::new(Arc::clone(self), target, log)
    }

    pub fn query_read_scratchpad_cmd(
        self: &Arc<Self>,
        target: DeviceAddress,
        len: usize,
        log: bool,
    ) -> ReadScratchpadCmd {
        ReadScratchpadCmd::new(Arc::clone(self), target, len, log)
    }

    pub fn query_write_scratchpad_cmd(
        self: &Arc<Self>,
        target: DeviceAddress,
        data: &[u8],
        log: bool,
    ) -> WriteScratchpadCmd {
        WriteScratchpadCmd::new(Arc::clone(self), target, data, log)
    }

    // Search notification scheduling.

    pub fn coordinator(&self, scope: NotifyScope) -> &NotifySearchCoordinator {
        match scope {
            NotifyScope::General => &self.general,
            NotifyScope::Alarm => &self.alarm,
        }
    }

    pub fn schedule_search_notify_for(
        &self,
        scope: NotifyScope,
        subscriber: &Subscriber,
        min_period_msec: u64,
    ) -> Result<(), ScheduleError> {
        self.coordinator(scope)
            .schedule_search_notify_for(subscriber, min_period_msec)
    }

    pub fn update_scheduled_search_notify_for(
        &self,
        scope: NotifyScope,
        subscriber: SubscriberId,
        min_period_msec: u64,
    ) -> Result<(), ScheduleError> {
        self.coordinator(scope)
            .update_scheduled_search_notify_for(subscriber, min_period_msec)
    }

    pub fn cancel_scheduled_search_notify_for(
        &self,
        scope: NotifyScope,
        subscriber: SubscriberId,
    ) -> Result<(), ScheduleError> {
        self.coordinator(scope)
            .cancel_scheduled_search_notify_for(subscriber)
    }

    /// Cancels every subscription in both scopes. Returns whether anything
    /// was scheduled.
    pub fn cancel_all_scheduled_search_notify(&self) -> bool {
        let general = self.general.cancel_all_scheduled_search_notify_for();
        let alarm = self.alarm.cancel_all_scheduled_search_notify_for();
        general || alarm
    }

    pub fn notify_stats(&self, scope: NotifyScope) -> NotifyStats {
        self.coordinator(scope).stats()
    }

    /// Called by a search command after a successful run.
    pub(crate) fn notify_search_result(&self, criteria: SearchCriteria, result: Arc<SearchResult>) {
        let scope = match criteria {
            SearchCriteria::All => NotifyScope::General,
            SearchCriteria::Alarming => NotifyScope::Alarm,
            SearchCriteria::Family(_) => return,
        };

        debug!(
            bus = self.name(),
            ?scope,
            devices = result.len(),
            fingerprint = result.fingerprint(),
            "search result"
        );
        self.coordinator(scope).notify_search_result(result);
    }
}

impl std::fmt::Debug for BusMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusMaster")
            .field("name", &self.name())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}
