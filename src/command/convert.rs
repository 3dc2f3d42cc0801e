use super::{CommandCore, CommandResult, CommandState};
use crate::address::DeviceAddress;
use crate::bus_master::BusMaster;
use crate::error::{BusFault, CommandError, ResultError};
use crate::logger::LogEntry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvertTResult {
    Success,
    BusNotStarted,
    DeviceNotFound,
    CommunicationError,
    GenericError,
}

impl CommandResult for ConvertTResult {
    const SUCCESS: Self = ConvertTResult::Success;
    const GENERIC_ERROR: Self = ConvertTResult::GenericError;
    const BUS_NOT_STARTED: Option<Self> = Some(ConvertTResult::BusNotStarted);

    fn from_fault(fault: &BusFault) -> Self {
        match fault {
            BusFault::DeviceNotFound(_) => ConvertTResult::DeviceNotFound,
            BusFault::Communication(_) => ConvertTResult::CommunicationError,
            BusFault::DeviceFault { .. } | BusFault::Other(_) => ConvertTResult::GenericError,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ConvertTResult::Success => "success",
            ConvertTResult::BusNotStarted => "bus_not_started",
            ConvertTResult::DeviceNotFound => "device_not_found",
            ConvertTResult::CommunicationError => "communication_error",
            ConvertTResult::GenericError => "generic_error",
        }
    }
}

/// Starts a temperature conversion on one device or on the whole bus.
pub struct ConvertTCmd {
    bus: Arc<BusMaster>,
    target: Option<DeviceAddress>,
    core: CommandCore<ConvertTResult, u64>,
}

impl ConvertTCmd {
    pub(crate) fn new(bus: Arc<BusMaster>, target: Option<DeviceAddress>, log: bool) -> Self {
        Self {
            bus,
            target,
            core: CommandCore::new("convert_t", log),
        }
    }

    pub fn target(&self) -> Option<DeviceAddress> {
        self.target
    }

    pub fn execute(&self) -> Result<ConvertTResult, CommandError> {
        let bus = &self.bus;
        let target = self.target;

        self.core.execute(bus, |log| {
            let write_ctm = bus.current_time_millis();
            bus.driver().convert_t(target.as_ref(), log)?;
            Ok(write_ctm)
        })
    }

    pub fn result(&self) -> CommandState<ConvertTResult> {
        self.core.state()
    }

    /// Bus time at which the conversion was triggered.
    pub fn result_write_ctm(&self) -> Result<u64, ResultError> {
        self.core.payload()
    }

    pub fn has_log(&self) -> bool {
        self.core.has_log()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.core.log_entries()
    }
}
