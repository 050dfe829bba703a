//! # sensorbus
//!
//! Application layer over the sensorbus crates: configuration, logging,
//! sessions that build sensors from configuration, and the polling loop
//! that turns readings into samples.
//!
//! ## Crate Layout
//!
//! - `sensorbus-core` - readings, capability traits, connection strings, errors
//! - `sensorbus-hal` - board, device proxies, interrupt adapter, platforms
//! - `sensorbus-drivers` - driver factories and the registry
//! - `sensorbus` (this crate) - config, logging, sessions, polling, sinks, CLI
//!
//! ## Example
//!
//! ```no_run
//! use sensorbus::{config::AppConfig, session::Session, acquisition::shutdown_channel};
//!
//! # async fn example() -> sensorbus::error::AppResult<()> {
//! let config = AppConfig::load()?;
//! let session = Session::start(config).await?;
//!
//! let (_handle, shutdown) = shutdown_channel();
//! let summary = session.polling_loop().run(shutdown).await?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod sink;

pub use acquisition::{
    shutdown_channel, AcquisitionSummary, PollingConfig, PollingLoop, ShutdownHandle, StopReason,
};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use session::Session;
pub use sink::{ChannelSink, ConsoleSink, CsvRecorder, SampleSink};

pub use sensorbus_core as core;
pub use sensorbus_drivers as drivers;
pub use sensorbus_hal as hal;
