use super::{CommandCore, CommandResult, CommandState};
use crate::address::DeviceAddress;
use crate::bus_master::BusMaster;
use crate::error::{BusFault, CommandError, ResultError};
use crate::logger::LogEntry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Largest scratchpad transfer accepted in either direction.
pub const MAX_SCRATCHPAD_LEN: usize = 32;

type ScratchpadBuffer = heapless::Vec<u8, MAX_SCRATCHPAD_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadScratchpadResult {
    Success,
    BusNotStarted,
    DeviceNotFound,
    DeviceFault,
    CommunicationError,
    GenericError,
}

impl CommandResult for ReadScratchpadResult {
    const SUCCESS: Self = ReadScratchpadResult::Success;
    const GENERIC_ERROR: Self = ReadScratchpadResult::GenericError;
    const BUS_NOT_STARTED: Option<Self> = Some(ReadScratchpadResult::BusNotStarted);

    fn from_fault(fault: &BusFault) -> Self {
        match fault {
            BusFault::DeviceNotFound(_) => ReadScratchpadResult::DeviceNotFound,
            BusFault::DeviceFault { .. } => ReadScratchpadResult::DeviceFault,
            BusFault::Communication(_) => ReadScratchpadResult::CommunicationError,
            BusFault::Other(_) => ReadScratchpadResult::GenericError,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ReadScratchpadResult::Success => "success",
            ReadScratchpadResult::BusNotStarted => "bus_not_started",
            ReadScratchpadResult::DeviceNotFound => "device_not_found",
            ReadScratchpadResult::DeviceFault => "device_fault",
            ReadScratchpadResult::CommunicationError => "communication_error",
            ReadScratchpadResult::GenericError => "generic_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteScratchpadResult {
    Success,
    BusNotStarted,
    DeviceNotFound,
    DeviceFault,
    CommunicationError,
    GenericError,
}

impl CommandResult for WriteScratchpadResult {
    const SUCCESS: Self = WriteScratchpadResult::Success;
    const GENERIC_ERROR: Self = WriteScratchpadResult::GenericError;
    const BUS_NOT_STARTED: Option<Self> = Some(WriteScratchpadResult::BusNotStarted);

    fn from_fault(fault: &BusFault) -> Self {
        match fault {
            BusFault::DeviceNotFound(_) => WriteScratchpadResult::DeviceNotFound,
            BusFault::DeviceFault { .. } => WriteScratchpadResult::DeviceFault,
            BusFault::Communication(_) => WriteScratchpadResult::CommunicationError,
            BusFault::Other(_) => WriteScratchpadResult::GenericError,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            WriteScratchpadResult::Success => "success",
            WriteScratchpadResult::BusNotStarted => "bus_not_started",
            WriteScratchpadResult::DeviceNotFound => "device_not_found",
            WriteScratchpadResult::DeviceFault => "device_fault",
            WriteScratchpadResult::CommunicationError => "communication_error",
            WriteScratchpadResult::GenericError => "generic_error",
        }
    }
}

#[derive(Debug, Clone)]
struct ScratchpadReading {
    data: ScratchpadBuffer,
    write_ctm: u64,
}

/// Reads `len` bytes of one device's scratchpad.
pub struct ReadScratchpadCmd {
    bus: Arc<BusMaster>,
    target: DeviceAddress,
    len: usize,
    core: CommandCore<ReadScratchpadResult, ScratchpadReading>,
}

impl ReadScratchpadCmd {
    pub(crate) fn new(bus: Arc<BusMaster>, target: DeviceAddress, len: usize, log: bool) -> Self {
        Self {
            bus,
            target,
            len,
            core: CommandCore::new("read_scratchpad", log),
        }
    }

    pub fn target(&self) -> DeviceAddress {
        self.target
    }

    pub fn requested_len(&self) -> usize {
        self.len
    }

    pub fn execute(&self) -> Result<ReadScratchpadResult, CommandError> {
        let bus = &self.bus;
        let target = self.target;
        let len = self.len;

        self.core.execute(bus, |log| {
            if len > MAX_SCRATCHPAD_LEN {
                return Err(BusFault::Other(format!(
                    "scratchpad length {len} exceeds {MAX_SCRATCHPAD_LEN}"
                )));
            }

            let write_ctm = bus.current_time_millis();
            let bytes = bus.driver().read_scratchpad(&target, len, log)?;
            if bytes.len() != len {
                return Err(BusFault::DeviceFault {
                    address: target,
                    reason: format!("expected {len} bytes, got {}", bytes.len()),
                });
            }

            let data = ScratchpadBuffer::from_slice(&bytes)
                .map_err(|()| BusFault::Other("scratchpad buffer overflow".to_string()))?;
            Ok(ScratchpadReading { data, write_ctm })
        })
    }

    pub fn result(&self) -> CommandState<ReadScratchpadResult> {
        self.core.state()
    }

    pub fn result_data(&self) -> Result<Vec<u8>, ResultError> {
        self.core.payload().map(|reading| reading.data.to_vec())
    }

    /// Bus time at which the read command was written.
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

/// Writes bytes into one device's scratchpad.
pub struct WriteScratchpadCmd {
    bus: Arc<BusMaster>,
    target: DeviceAddress,
    data: Vec<u8>,
    core: CommandCore<WriteScratchpadResult, u64>,
}

impl WriteScratchpadCmd {
    pub(crate) fn new(bus: Arc<BusMaster>, target: DeviceAddress, data: &[u8], log: bool) -> Self {
        Self {
            bus,
            target,
            data: data.to_vec(),
            core: CommandCore::new("write_scratchpad", log),
        }
    }

    pub fn target(&self) -> DeviceAddress {
        self.target
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn execute(&self) -> Result<WriteScratchpadResult, CommandError> {
        let bus = &self.bus;
        let target = self.target;
        let data = &self.data;

        self.core.execute(bus, |log| {
            if data.len() > MAX_SCRATCHPAD_LEN {
                return Err(BusFault::Other(format!(
                    "scratchpad length {} exceeds {MAX_SCRATCHPAD_LEN}",
                    data.len()
                )));
            }

            let write_ctm = bus.current_time_millis();
            bus.driver().write_scratchpad(&target, data, log)?;
            Ok(write_ctm)
        })
    }

    pub fn result(&self) -> CommandState<WriteScratchpadResult> {
        self.core.state()
    }

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
