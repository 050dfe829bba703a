//! Hardware access for sensorbus.
//!
//! This crate binds device proxies to bus resources on a [`Platform`]:
//!
//! ## Device Access
//! - [`Board`] - platform handle plus the resource claim table
//! - [`Gpio`], [`AnalogInput`], [`I2cDevice`], [`SpiDevice`], [`Uart`] -
//!   scoped proxies, each bound to one resource and released on drop
//!
//! ## Interrupts
//! - [`InterruptLine`] - bounded edge channel with one armed consumer
//! - [`EdgeHandler`] - user logic run on the line's dispatcher thread
//!
//! ## Platforms
//! - [`SimPlatform`] - in-memory, with fault injection
//! - [`LinuxPlatform`] - sysfs GPIO, IIO, i2c-dev, spidev, serial ports
//! - [`NativeLibrary`] - vendor shared libraries held for the board's lifetime
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use sensorbus_hal::{Board, SimPlatform};
//!
//! let sim = SimPlatform::new();
//! let board = Board::new(Arc::new(sim.clone()));
//!
//! sim.set_analog(0, 1023);
//! let adc = board.analog(0)?;
//! assert!((adc.read_volts()? - 5.0).abs() < 1e-9);
//!
//! // Claimed until dropped
//! assert!(board.analog(0).is_err());
//! drop(adc);
//! assert!(board.analog(0).is_ok());
//! # Ok::<(), sensorbus_core::SensorError>(())
//! ```

pub mod board;
pub mod device;
pub mod interrupt;
pub mod library;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod platform;
pub mod sim;

pub use board::{Board, Claim};
pub use device::{AnalogInput, Device, Gpio, I2cDevice, SpiDevice, Uart};
pub use interrupt::{
    CallbackFault, EdgeEvent, EdgeHandler, EdgeKind, EdgeSink, EdgeSubscription, HandlerId,
    InterruptConfig, InterruptLine, InterruptStats, OverflowPolicy, Registration,
};
pub use library::NativeLibrary;
#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;
pub use platform::{LinuxConfig, Platform, Resource};
pub use sim::SimPlatform;
