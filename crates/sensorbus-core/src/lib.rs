//! # sensorbus-core
//!
//! Shared vocabulary for the sensorbus workspace:
//!
//! - [`error`]: the [`SensorError`] taxonomy every layer propagates
//! - [`connection`]: connection-string parsing (`g:3:in:rising,i:1:0x18`)
//! - [`reading`]: [`Reading`] values and timestamped [`Sample`]s
//! - [`capabilities`]: the [`Sensor`], [`Switchable`] and [`EventCounter`] traits
//!
//! This crate has no hardware access. Bus handles live in `sensorbus-hal`,
//! concrete sensors in `sensorbus-drivers`.

pub mod capabilities;
pub mod connection;
pub mod error;
pub mod reading;

pub use capabilities::{Capability, EventCounter, Sensor, SwitchCommand, Switchable};
pub use connection::{Connection, ConnectionString, ConnectionSummary, Edge, GpioOptions};
pub use error::{ErrorKind, Result, SensorError};
pub use reading::{Reading, Sample};
