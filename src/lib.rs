//! # owbus
//!
//! A 1-Wire style bus master built around two ideas:
//!
//! - **Single-flight commands**: every bus operation is a reusable command
//!   object with a closed result enum. Running one instance twice at once
//!   fails fast instead of queueing, and nothing a driver does (error or
//!   panic) escapes `execute()`.
//! - **Adaptive search notification**: subscribers ask to hear about the bus
//!   inventory at least every N milliseconds; one timer per scope searches at
//!   the tightest requested period and only changed results are delivered.
//!
//! ## Quick Start
//!
//! ```rust
//! use owbus::{BusMaster, DeviceAddress, SearchCriteria, SimDevice, SimulatedBus};
//! use std::sync::Arc;
//!
//! let runtime = tokio::runtime::Runtime::new()?;
//!
//! let driver = Arc::new(SimulatedBus::new("sim0"));
//! driver.add_device(SimDevice::new(DeviceAddress::new(0x28, 0x0102_0304_0506)));
//!
//! let bus = BusMaster::new(driver, runtime.handle().clone());
//! bus.query_start_bus_cmd(false).execute()?;
//!
//! let search = bus.query_search_cmd(SearchCriteria::All, false);
//! search.execute()?;
//! assert_eq!(search.result_list()?.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - [`bus_master`] - Bus façade and the driver contract
//! - [`command`] - Command template and the concrete commands
//! - [`notify`] - Search notification coordinators and pushers
//! - [`sim`] - In-process simulated driver
//! - [`config`] - Simulated bus configuration

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod bus_master;
pub mod command;
pub mod config;
pub mod crc;
pub mod error;
pub mod logger;
pub mod notify;
pub mod search_result;
pub mod sim;

// Re-export main public types for convenience
pub use address::DeviceAddress;
pub use bus_master::{BusDriver, BusMaster, TimeSource};
pub use command::{CommandResult, CommandState, SearchCriteria};
pub use config::SimBusConfig;
pub use error::{BusFault, CommandError, ResultError, ScheduleError};
pub use logger::{LogEntry, LogLevel, Logger};
pub use notify::{NotifyScope, Subscriber, SubscriberId};
pub use search_result::SearchResult;
pub use sim::{SimDevice, SimulatedBus};
