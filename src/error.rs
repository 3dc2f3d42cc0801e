use crate::address::DeviceAddress;
use crate::notify::SubscriberId;
use thiserror::Error;

/// Usage errors of the search notification scheduling API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("minimum period must be greater than zero")]
    InvalidPeriod,

    #[error("subscriber {0} is already scheduled")]
    AlreadyScheduled(SubscriberId),

    #[error("subscriber {0} is not scheduled")]
    NotScheduled(SubscriberId),

    #[error("subscriber {subscriber} is already scheduled at {period_msec} ms")]
    PeriodUnchanged {
        subscriber: SubscriberId,
        period_msec: u64,
    },
}

/// Raised by `execute()` when the same command instance is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command is busy")]
    Busy,
}

/// Raised by result accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResultError {
    /// The command has not finished: never executed, or currently busy.
    #[error("no result: command has not finished")]
    NoResult,

    /// The command finished, but not successfully.
    #[error("no result data: command finished with {0}")]
    NoResultData(&'static str),
}

/// Outcome reported by a bus driver when a wire operation does not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusFault {
    #[error("communication error: {0}")]
    Communication(String),

    #[error("device {0} not found")]
    DeviceNotFound(DeviceAddress),

    #[error("device {address} fault: {reason}")]
    DeviceFault {
        address: DeviceAddress,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must be 16 hex digits, got {0}")]
    InvalidLength(usize),

    #[error("address is not valid hex: {0}")]
    InvalidHex(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SearchResultError {
    #[error("write timestamp must be greater than zero")]
    InvalidWriteTime,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration value: {0}")]
    Invalid(String),
}
