use super::{CommandCore, CommandResult, CommandState};
use crate::bus_master::BusMaster;
use crate::error::{BusFault, CommandError};
use crate::logger::LogEntry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartBusResult {
    Success,
    CommunicationError,
    GenericError,
}

impl CommandResult for StartBusResult {
    const SUCCESS: Self = StartBusResult::Success;
    const GENERIC_ERROR: Self = StartBusResult::GenericError;
    const BUS_NOT_STARTED: Option<Self> = None;

    fn from_fault(fault: &BusFault) -> Self {
        match fault {
            BusFault::Communication(_) => StartBusResult::CommunicationError,
            _ => StartBusResult::GenericError,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            StartBusResult::Success => "success",
            StartBusResult::CommunicationError => "communication_error",
            StartBusResult::GenericError => "generic_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBusResult {
    Success,
    CommunicationError,
    GenericError,
}

impl CommandResult for StopBusResult {
    const SUCCESS: Self = StopBusResult::Success;
    const GENERIC_ERROR: Self = StopBusResult::GenericError;
    const BUS_NOT_STARTED: Option<Self> = None;

    fn from_fault(fault: &BusFault) -> Self {
        match fault {
            BusFault::Communication(_) => StopBusResult::CommunicationError,
            _ => StopBusResult::GenericError,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            StopBusResult::Success => "success",
            StopBusResult::CommunicationError => "communication_error",
            StopBusResult::GenericError => "generic_error",
        }
    }
}

/// Opens the bus. Succeeds without touching the driver when already started.
pub struct StartBusCmd {
    bus: Arc<BusMaster>,
    core: CommandCore<StartBusResult, ()>,
}

impl StartBusCmd {
    pub(crate) fn new(bus: Arc<BusMaster>, log: bool) -> Self {
        Self {
            bus,
            core: CommandCore::new("start_bus", log),
        }
    }

    pub fn execute(&self) -> Result<StartBusResult, CommandError> {
        let bus = &self.bus;
        self.core.execute(bus, |log| bus.start_bus(log))
    }

    pub fn result(&self) -> CommandState<StartBusResult> {
        self.core.state()
    }

    pub fn has_log(&self) -> bool {
        self.core.has_log()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.core.log_entries()
    }
}

/// Closes the bus. Succeeds without touching the driver when already stopped.
pub struct StopBusCmd {
    bus: Arc<BusMaster>,
    core: CommandCore<StopBusResult, ()>,
}

impl StopBusCmd {
    pub(crate) fn new(bus: Arc<BusMaster>, log: bool) -> Self {
        Self {
            bus,
            core: CommandCore::new("stop_bus", log),
        }
    }

    pub fn execute(&self) -> Result<StopBusResult, CommandError> {
        let bus = &self.bus;
        self.core.execute(bus, |log| bus.stop_bus(log))
    }

    pub fn result(&self) -> CommandState<StopBusResult> {
        self.core.state()
    }

    pub fn has_log(&self) -> bool {
        self.core.has_log()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.core.log_entries()
    }
}
