use super::{CommandCore, CommandResult, CommandState};
use crate::address::DeviceAddress;
use crate::bus_master::BusMaster;
use crate::error::{BusFault, CommandError, ResultError};
use crate::logger::LogEntry;
use crate::search_result::SearchResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};

/// Which devices a search enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchCriteria {
    All,
    /// Only devices currently signaling an alarm.
    Alarming,
    /// Only devices of one family code.
    Family(u8),
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchCriteria::All => f.write_str("all"),
            SearchCriteria::Alarming => f.write_str("alarming"),
            SearchCriteria::Family(code) => write!(f, "family {code:02X}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchBusResult {
    Success,
    BusNotStarted,
    CommunicationError,
    GenericError,
}

impl CommandResult for SearchBusResult {
    const SUCCESS: Self = SearchBusResult::Success;
    const GENERIC_ERROR: Self = SearchBusResult::GenericError;
    const BUS_NOT_STARTED: Option<Self> = Some(SearchBusResult::BusNotStarted);

    fn from_fault(fault: &BusFault) -> Self {
        match fault {
            BusFault::Communication(_) => SearchBusResult::CommunicationError,
            _ => SearchBusResult::GenericError,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            SearchBusResult::Success => "success",
            SearchBusResult::BusNotStarted => "bus_not_started",
            SearchBusResult::CommunicationError => "communication_error",
            SearchBusResult::GenericError => "generic_error",
        }
    }
}

enum BusHandle {
    Shared(Arc<BusMaster>),
    /// Held by commands the bus itself retains, so they never keep it alive.
    Detached(Weak<BusMaster>),
}

impl BusHandle {
    fn upgrade(&self) -> Option<Arc<BusMaster>> {
        match self {
            BusHandle::Shared(bus) => Some(Arc::clone(bus)),
            BusHandle::Detached(bus) => bus.upgrade(),
        }
    }
}

/// Enumerates devices on the bus.
///
/// A successful general or alarm search is also pushed to the matching
/// notification coordinator, which is how scheduled subscribers learn about
/// inventory changes.
pub struct SearchBusCmd {
    bus: BusHandle,
    criteria: SearchCriteria,
    core: CommandCore<SearchBusResult, Arc<SearchResult>>,
}

impl SearchBusCmd {
    pub(crate) fn new(bus: Arc<BusMaster>, criteria: SearchCriteria, log: bool) -> Self {
        Self::with_handle(BusHandle::Shared(bus), criteria, log)
    }

    /// A search that only weakly refers to its bus. Once the bus is gone,
    /// `execute` reports a generic error without touching any driver.
    pub(crate) fn detached(bus: Weak<BusMaster>, criteria: SearchCriteria, log: bool) -> Self {
        Self::with_handle(BusHandle::Detached(bus), criteria, log)
    }

    fn with_handle(bus: BusHandle, criteria: SearchCriteria, log: bool) -> Self {
        Self {
            bus,
            criteria,
            core: CommandCore::new("search", log),
        }
    }

    pub fn criteria(&self) -> SearchCriteria {
        self.criteria
    }

    pub fn execute(&self) -> Result<SearchBusResult, CommandError> {
        let Some(bus) = self.bus.upgrade() else {
            return Ok(SearchBusResult::GenericError);
        };
        let criteria = self.criteria;

        let result = self.core.execute(&bus, |log| {
            let write_ctm = bus.current_time_millis();
            let addresses = bus.driver().search(criteria, log)?;
            if log.is_enabled() {
                log.debug(&format!("search {criteria}: {} device(s)", addresses.len()));
            }
            SearchResult::new(addresses, write_ctm)
                .map(Arc::new)
                .map_err(|e| BusFault::Other(e.to_string()))
        })?;

        if result == SearchBusResult::Success {
            if let Ok(search) = self.core.payload() {
                bus.notify_search_result(criteria, search);
            }
        }

        Ok(result)
    }

    pub fn result(&self) -> CommandState<SearchBusResult> {
        self.core.state()
    }

    pub fn result_search(&self) -> Result<Arc<SearchResult>, ResultError> {
        self.core.payload()
    }

    pub fn result_list(&self) -> Result<Vec<DeviceAddress>, ResultError> {
        self.core.payload().map(|search| search.addresses().to_vec())
    }

    pub fn result_write_ctm(&self) -> Result<u64, ResultError> {
        self.core.payload().map(|search| search.write_ctm())
    }

    pub fn has_log(&self) -> bool {
        self.core.has_log()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.core.log_entries()
    }
}
