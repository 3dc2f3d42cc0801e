//! Single-flight bus commands.
//!
//! Every command follows the same execution template:
//!
//! 1. Atomically move from `NotStarted`/`Done` to `Busy`, failing fast with
//!    [`CommandError::Busy`] if another caller holds the instance, and drop
//!    any payload from the previous run.
//! 2. Clear the command's log sink.
//! 3. Gated commands stop with their `BusNotStarted` value when the bus is
//!    not started.
//! 4. Run the driver hook. A [`BusFault`] maps onto the command's own result
//!    enum; a panic becomes the generic error value. Nothing escapes.
//! 5. Store and return the terminal result.
//!
//! Payload accessors return [`ResultError::NoResult`] while the command has
//! not finished and [`ResultError::NoResultData`] after a non-success result.

mod convert;
mod power_supply;
mod scratchpad;
mod search;
mod start_stop;

pub use convert::{ConvertTCmd, ConvertTResult};
pub use power_supply::{ReadPowerSupplyCmd, ReadPowerSupplyResult};
pub use scratchpad::{
    ReadScratchpadCmd, ReadScratchpadResult, WriteScratchpadCmd, WriteScratchpadResult,
    MAX_SCRATCHPAD_LEN,
};
pub use search::{SearchBusCmd, SearchBusResult, SearchCriteria};
pub use start_stop::{StartBusCmd, StartBusResult, StopBusCmd, StopBusResult};

use crate::bus_master::BusMaster;
use crate::error::{BusFault, CommandError, ResultError};
use crate::logger::{CommandLog, LogEntry, Logger, SilentLogger};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

/// Lifecycle of one command instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandState<R> {
    NotStarted,
    Busy,
    Done(R),
}

impl<R: Copy> CommandState<R> {
    pub fn is_busy(&self) -> bool {
        matches!(self, CommandState::Busy)
    }

    pub fn done(&self) -> Option<R> {
        match self {
            CommandState::Done(result) => Some(*result),
            _ => None,
        }
    }
}

/// Closed result taxonomy of one command type.
pub trait CommandResult: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    const SUCCESS: Self;
    const GENERIC_ERROR: Self;
    /// Stored without running the driver when the bus is not started.
    /// `None` for commands that may run on a stopped bus.
    const BUS_NOT_STARTED: Option<Self>;

    /// Never returns `SUCCESS`.
    fn from_fault(fault: &BusFault) -> Self;

    fn as_str(self) -> &'static str;
}

struct Slot<R, P> {
    state: CommandState<R>,
    payload: Option<P>,
}

/// Shared state and execution template behind every command type.
pub(crate) struct CommandCore<R, P> {
    name: &'static str,
    slot: Mutex<Slot<R, P>>,
    log: Option<CommandLog>,
}

impl<R: CommandResult, P: Clone> CommandCore<R, P> {
    pub(crate) fn new(name: &'static str, with_log: bool) -> Self {
        Self {
            name,
            slot: Mutex::new(Slot {
                state: CommandState::NotStarted,
                payload: None,
            }),
            log: with_log.then(CommandLog::new),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<R, P>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn logger(&self) -> &dyn Logger {
        match &self.log {
            Some(log) => log,
            None => &SilentLogger,
        }
    }

    pub(crate) fn execute<F>(&self, bus: &BusMaster, hook: F) -> Result<R, CommandError>
    where
        F: FnOnce(&dyn Logger) -> Result<P, BusFault>,
    {
        self.begin()?;
        if let Some(log) = &self.log {
            log.clear();
        }

        let logger = self.logger();
        let (result, payload) = match R::BUS_NOT_STARTED {
            Some(not_started) if !bus.is_started() => {
                logger.warning("bus not started");
                (not_started, None)
            }
            _ => self.run_hook(bus, logger, hook),
        };

        let mut slot = self.lock();
        slot.state = CommandState::Done(result);
        slot.payload = payload;
        Ok(result)
    }

    fn begin(&self) -> Result<(), CommandError> {
        let mut slot = self.lock();
        if slot.state.is_busy() {
            return Err(CommandError::Busy);
        }
        slot.state = CommandState::Busy;
        slot.payload = None;
        Ok(())
    }

    fn run_hook<F>(&self, bus: &BusMaster, logger: &dyn Logger, hook: F) -> (R, Option<P>)
    where
        F: FnOnce(&dyn Logger) -> Result<P, BusFault>,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| hook(logger))) {
            Ok(Ok(payload)) => (R::SUCCESS, Some(payload)),
            Ok(Err(fault)) => {
                let result = R::from_fault(&fault);
                debug_assert!(result != R::SUCCESS, "fault mapped to success");
                if logger.is_enabled() {
                    logger.warning(&fault.to_string());
                }
                debug!(command = self.name, bus = bus.name(), %fault, "command failed");
                (result, None)
            }
            Err(panic_payload) => {
                let reason = panic_message(panic_payload.as_ref());
                if logger.is_enabled() {
                    logger.error(&format!("driver panicked: {reason}"));
                }
                error!(command = self.name, bus = bus.name(), %reason, "driver panicked");
                (R::GENERIC_ERROR, None)
            }
        }
    }

    pub(crate) fn state(&self) -> CommandState<R> {
        self.lock().state
    }

    pub(crate) fn payload(&self) -> Result<P, ResultError> {
        let slot = self.lock();
        match slot.state {
            CommandState::NotStarted | CommandState::Busy => Err(ResultError::NoResult),
            CommandState::Done(result) if result != R::SUCCESS => {
                Err(ResultError::NoResultData(result.as_str()))
            }
            CommandState::Done(result) => slot
                .payload
                .clone()
                .ok_or(ResultError::NoResultData(result.as_str())),
        }
    }

    pub(crate) fn has_log(&self) -> bool {
        self.log.is_some()
    }

    pub(crate) fn log_entries(&self) -> Vec<LogEntry> {
        self.log.as_ref().map(CommandLog::entries).unwrap_or_default()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
