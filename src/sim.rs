//! In-process bus driver.
//!
//! Keeps a device table that tests and tools can change while the bus runs,
//! and can inject communication errors either deterministically
//! (`fail_next_operations`) or at a configured rate from a seeded generator.

use crate::address::DeviceAddress;
use crate::bus_master::{BusDriver, TimeSource};
use crate::command::SearchCriteria;
use crate::config::{SimBusConfig, SimDeviceConfig, SimFaultConfig};
use crate::error::BusFault;
use crate::logger::Logger;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Value read back from scratchpad cells that were never written.
const UNWRITTEN_BYTE: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDevice {
    pub address: DeviceAddress,
    pub alarm: bool,
    pub externally_powered: bool,
    /// Every operation addressed to a faulty device fails with a device fault.
    pub faulty: bool,
    pub scratchpad: Vec<u8>,
    pub conversions: u32,
}

impl SimDevice {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            alarm: false,
            externally_powered: true,
            faulty: false,
            scratchpad: Vec::new(),
            conversions: 0,
        }
    }

    pub fn with_alarm(mut self, alarm: bool) -> Self {
        self.alarm = alarm;
        self
    }

    pub fn with_externally_powered(mut self, externally_powered: bool) -> Self {
        self.externally_powered = externally_powered;
        self
    }

    pub fn with_scratchpad(mut self, scratchpad: &[u8]) -> Self {
        self.scratchpad = scratchpad.to_vec();
        self
    }

    pub fn with_faulty(mut self, faulty: bool) -> Self {
        self.faulty = faulty;
        self
    }

    fn matches(&self, criteria: SearchCriteria) -> bool {
        match criteria {
            SearchCriteria::All => true,
            SearchCriteria::Alarming => self.alarm,
            SearchCriteria::Family(code) => self.address.family_code() == code,
        }
    }
}

impl From<&SimDeviceConfig> for SimDevice {
    fn from(config: &SimDeviceConfig) -> Self {
        SimDevice::new(config.address)
            .with_alarm(config.alarm)
            .with_externally_powered(config.externally_powered)
            .with_scratchpad(&config.scratchpad)
            .with_faulty(config.faulty)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimFaultStats {
    pub operations: u64,
    pub injected_communication_errors: u64,
    pub forced_failures: u64,
    pub injected_panics: u64,
}

#[derive(Debug)]
struct FaultInjector {
    config: SimFaultConfig,
    // Linear congruential generator, reproducible from the seed
    rng_state: u64,
    forced_failures: u32,
    panic_next: bool,
    stats: SimFaultStats,
}

enum InjectedFault {
    Communication(&'static str),
    Panic,
}

impl FaultInjector {
    fn new(config: SimFaultConfig) -> Self {
        Self {
            rng_state: config.seed,
            config,
            forced_failures: 0,
            panic_next: false,
            stats: SimFaultStats::default(),
        }
    }

    fn next_random(&mut self) -> u64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.rng_state
    }

    fn random_float(&mut self) -> f32 {
        // Top 24 bits give a uniform value in [0, 1)
        (self.next_random() >> 40) as f32 / (1u64 << 24) as f32
    }

    fn check(&mut self) -> Option<InjectedFault> {
        self.stats.operations += 1;

        if self.panic_next {
            self.panic_next = false;
            self.stats.injected_panics += 1;
            return Some(InjectedFault::Panic);
        }

        if self.forced_failures > 0 {
            self.forced_failures -= 1;
            self.stats.forced_failures += 1;
            return Some(InjectedFault::Communication("forced failure"));
        }

        if self.config.enabled
            && self.random_float() * 100.0 < self.config.communication_error_rate_percent
        {
            self.stats.injected_communication_errors += 1;
            return Some(InjectedFault::Communication("no presence pulse"));
        }

        None
    }
}

pub struct SimulatedBus {
    name: String,
    open: AtomicBool,
    latency_ms: AtomicU64,
    devices: Mutex<Vec<SimDevice>>,
    faults: Mutex<FaultInjector>,
}

impl SimulatedBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(&SimBusConfig {
            name: name.into(),
            ..SimBusConfig::default()
        })
    }

    /// Builds a bus from an already validated configuration.
    pub fn from_config(config: &SimBusConfig) -> Self {
        Self {
            name: config.name.clone(),
            open: AtomicBool::new(false),
            latency_ms: AtomicU64::new(config.latency_ms),
            devices: Mutex::new(config.devices.iter().map(SimDevice::from).collect()),
            faults: Mutex::new(FaultInjector::new(config.faults.clone())),
        }
    }

    fn lock_devices(&self) -> MutexGuard<'_, Vec<SimDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_faults(&self) -> MutexGuard<'_, FaultInjector> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Returns `false` when a device with the same address is already present.
    pub fn add_device(&self, device: SimDevice) -> bool {
        let mut devices = self.lock_devices();
        if devices.iter().any(|d| d.address == device.address) {
            return false;
        }
        debug!(bus = %self.name, address = %device.address, "device attached");
        devices.push(device);
        true
    }

    pub fn remove_device(&self, address: &DeviceAddress) -> bool {
        let mut devices = self.lock_devices();
        let before = devices.len();
        devices.retain(|d| d.address != *address);
        before != devices.len()
    }

    pub fn set_alarm(&self, address: &DeviceAddress, alarm: bool) -> bool {
        self.update_device(address, |device| device.alarm = alarm)
    }

    pub fn set_faulty(&self, address: &DeviceAddress, faulty: bool) -> bool {
        self.update_device(address, |device| device.faulty = faulty)
    }

    fn update_device<F: FnOnce(&mut SimDevice)>(&self, address: &DeviceAddress, f: F) -> bool {
        match self.lock_devices().iter_mut().find(|d| d.address == *address) {
            Some(device) => {
                f(device);
                true
            }
            None => false,
        }
    }

    pub fn device(&self, address: &DeviceAddress) -> Option<SimDevice> {
        self.lock_devices()
            .iter()
            .find(|d| d.address == *address)
            .cloned()
    }

    pub fn devices(&self) -> Vec<SimDevice> {
        self.lock_devices().clone()
    }

    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::Relaxed);
    }

    /// The next `count` operations fail with a communication error.
    pub fn fail_next_operations(&self, count: u32) {
        self.lock_faults().forced_failures = count;
    }

    /// The next operation panics inside the driver.
    pub fn inject_panic_next(&self) {
        self.lock_faults().panic_next = true;
    }

    pub fn fault_stats(&self) -> SimFaultStats {
        self.lock_faults().stats
    }

    fn begin_operation(&self, operation: &str, log: &dyn Logger) -> Result<(), BusFault> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            thread::sleep(Duration::from_millis(latency));
        }

        if !self.is_open() {
            return Err(BusFault::Communication("bus adapter is closed".to_string()));
        }

        let injected = self.lock_faults().check();
        match injected {
            None => {
                trace!(bus = %self.name, operation, "bus operation");
                Ok(())
            }
            Some(InjectedFault::Communication(reason)) => {
                if log.is_enabled() {
                    log.warning(&format!("{operation}: {reason}"));
                }
                Err(BusFault::Communication(reason.to_string()))
            }
            Some(InjectedFault::Panic) => panic!("injected driver panic during {operation}"),
        }
    }

    fn with_device<T, F>(&self, address: &DeviceAddress, log: &dyn Logger, f: F) -> Result<T, BusFault>
    where
        F: FnOnce(&mut SimDevice) -> T,
    {
        let mut devices = self.lock_devices();
        let Some(device) = devices.iter_mut().find(|d| d.address == *address) else {
            if log.is_enabled() {
                log.info(&format!("no presence for {address}"));
            }
            return Err(BusFault::DeviceNotFound(*address));
        };

        if device.faulty {
            return Err(BusFault::DeviceFault {
                address: *address,
                reason: "CRC mismatch on device response".to_string(),
            });
        }

        Ok(f(device))
    }
}

impl TimeSource for SimulatedBus {
    fn current_time_millis(&self) -> u64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        u64::try_from(millis).unwrap_or(u64::MAX).max(1)
    }
}

impl BusDriver for SimulatedBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, log: &dyn Logger) -> Result<(), BusFault> {
        let injected = self.lock_faults().check();
        if let Some(InjectedFault::Communication(reason)) = injected {
            return Err(BusFault::Communication(reason.to_string()));
        }
        if let Some(InjectedFault::Panic) = injected {
            panic!("injected driver panic during open");
        }

        self.open.store(true, Ordering::Release);
        log.debug("adapter opened");
        Ok(())
    }

    fn close(&self, log: &dyn Logger) -> Result<(), BusFault> {
        self.open.store(false, Ordering::Release);
        log.debug("adapter closed");
        Ok(())
    }

    fn search(&self, criteria: SearchCriteria, log: &dyn Logger) -> Result<Vec<DeviceAddress>, BusFault> {
        self.begin_operation("search", log)?;

        let found: Vec<DeviceAddress> = self
            .lock_devices()
            .iter()
            .filter(|d| d.matches(criteria))
            .map(|d| d.address)
            .collect();

        if log.is_enabled() {
            for address in &found {
                log.debug(&format!("found {address}"));
            }
        }
        Ok(found)
    }

    fn convert_t(&self, target: Option<&DeviceAddress>, log: &dyn Logger) -> Result<(), BusFault> {
        self.begin_operation("convert_t", log)?;

        match target {
            Some(address) => self.with_device(address, log, |device| {
                device.conversions = device.conversions.saturating_add(1);
            }),
            None => {
                for device in self.lock_devices().iter_mut() {
                    device.conversions = device.conversions.saturating_add(1);
                }
                Ok(())
            }
        }
    }

    fn read_power_supply(&self, target: &DeviceAddress, log: &dyn Logger) -> Result<bool, BusFault> {
        self.begin_operation("read_power_supply", log)?;
        self.with_device(target, log, |device| device.externally_powered)
    }

    fn read_scratchpad(
        &self,
        target: &DeviceAddress,
        len: usize,
        log: &dyn Logger,
    ) -> Result<Vec<u8>, BusFault> {
        self.begin_operation("read_scratchpad", log)?;
        self.with_device(target, log, |device| {
            (0..len)
                .map(|i| device.scratchpad.get(i).copied().unwrap_or(UNWRITTEN_BYTE))
                .collect()
        })
    }

    fn write_scratchpad(
        &self,
        target: &DeviceAddress,
        data: &[u8],
        log: &dyn Logger,
    ) -> Result<(), BusFault> {
        self.begin_operation("write_scratchpad", log)?;
        self.with_device(target, log, |device| {
            if device.scratchpad.len() < data.len() {
                device.scratchpad.resize(data.len(), UNWRITTEN_BYTE);
            }
            device.scratchpad[..data.len()].copy_from_slice(data);
        })
    }
}
