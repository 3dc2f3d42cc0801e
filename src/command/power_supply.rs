use super::{CommandCore, CommandResult, CommandState};
use crate::address::DeviceAddress;
use crate::bus_master::BusMaster;
use crate::error::{BusFault, CommandError, ResultError};
use crate::logger::LogEntry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPowerSupplyResult {
    Success,
    BusNotStarted,
    DeviceNotFound,
    DeviceFault,
    CommunicationError,
    GenericError,
}

impl CommandResult for ReadPowerSupplyResult {
    const SUCCESS: Self = ReadPowerSupplyResult::Success;
    const GENERIC_ERROR: Self = ReadPowerSupplyResult::GenericError;
    const BUS_NOT_STARTED: Option<Self> = Some(ReadPowerSupplyResult::BusNotStarted);

    fn from_fault(fault: &BusFault) -> Self {
        match fault {
            BusFault::DeviceNotFound(_) => ReadPowerSupplyResult::DeviceNotFound,
            BusFault::DeviceFault { .. } => ReadPowerSupplyResult::DeviceFault,
            BusFault::Communication(_) => ReadPowerSupplyResult::CommunicationError,
            BusFault::Other(_) => ReadPowerSupplyResult::GenericError,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ReadPowerSupplyResult::Success => "success",
            ReadPowerSupplyResult::BusNotStarted => "bus_not_started",
            ReadPowerSupplyResult::DeviceNotFound => "device_not_found",
            ReadPowerSupplyResult::DeviceFault => "device_fault",
            ReadPowerSupplyResult::CommunicationError => "communication_error",
            ReadPowerSupplyResult::GenericError => "generic_error",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PowerSupplyReading {
    externally_powered: bool,
    write_ctm: u64,
}

/// Asks one device whether it is externally powered or parasitic.
pub struct ReadPowerSupplyCmd {
    bus: Arc<BusMaster>,
    target: DeviceAddress,
    core: CommandCore<ReadPowerSupplyResult, PowerSupplyReading>,
}

impl ReadPowerSupplyCmd {
    pub(crate) fn new(bus: Arc<BusMaster>, target: DeviceAddress, log: bool) -> Self {
        Self {
            bus,
            target,
            core: CommandCore::new("read_power_supply", log),
        }
    }

    pub fn target(&self) -> DeviceAddress {
        self.target
    }

    pub fn execute(&self) -> Result<ReadPowerSupplyResult, CommandError> {
        let bus = &self.bus;
        let target = self.target;

        self.core.execute(bus, |log| {
            let write_ctm = bus.current_time_millis();
            let externally_powered = bus.driver().read_power_supply(&target, log)?;
            Ok(PowerSupplyReading {
                externally_powered,
                write_ctm,
            })
        })
    }

    pub fn result(&self) -> CommandState<ReadPowerSupplyResult> {
        self.core.state()
    }

    pub fn result_externally_powered(&self) -> Result<bool, ResultError> {
        self.core.payload().map(|reading| reading.externally_powered)
    }

    pub fn result_write_ctm(&self) -> Result<u64, ResultError> {
        self.core.payload().map(|reading| reading.write_ctm)
    }

    pub fn has_log(&self) -> bool {
        self.core.has_log()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.core.log_entries()
    }
}
