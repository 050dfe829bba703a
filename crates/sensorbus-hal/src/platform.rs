//! Platform abstraction: the native layer device proxies sit on.
//!
//! A [`Platform`] opens raw backends for one bus resource each. Backends
//! are blocking and single-owner; the proxies in [`crate::device`] add
//! claims, locking and logging on top.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use sensorbus_core::connection::{Direction, Edge, I2cSpeed, PullMode};
use sensorbus_core::{Result, SensorError};
use serde::{Deserialize, Serialize};

use crate::interrupt::EdgeSink;

/// A claimable bus resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Gpio(u32),
    Analog(u32),
    I2c { bus: u32, address: u16 },
    Spi { bus: u32, chip_select: u32 },
    Uart(String),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Gpio(pin) => write!(f, "gpio{}", pin),
            Resource::Analog(pin) => write!(f, "aio{}", pin),
            Resource::I2c { bus, address } => write!(f, "i2c-{}@0x{:02x}", bus, address),
            Resource::Spi { bus, chip_select } => write!(f, "spi{}.{}", bus, chip_select),
            Resource::Uart(port) => write!(f, "{}", port),
        }
    }
}

/// Digital pin backend.
pub trait GpioBackend: Send {
    fn set_direction(&mut self, direction: Direction) -> Result<()>;

    fn set_pull(&mut self, pull: PullMode) -> Result<()>;

    fn set_active_low(&mut self, active_low: bool) -> Result<()>;

    /// Logical level.
    fn read(&mut self) -> Result<bool>;

    /// Drive the logical level.
    fn write(&mut self, level: bool) -> Result<()>;

    /// Start feeding qualifying edges into `sink`.
    ///
    /// Calling again replaces the edge selection and the sink.
    fn watch_edges(&mut self, edge: Edge, sink: EdgeSink) -> Result<()>;

    /// Stop edge detection. Safe to call when not watching.
    fn unwatch(&mut self) -> Result<()>;
}

/// Analog input backend.
pub trait AnalogBackend: Send {
    /// ADC resolution in bits.
    fn resolution_bits(&self) -> u8;

    /// Raw ADC counts.
    fn read_raw(&mut self) -> Result<u32>;
}

/// I2C bus backend, bound to one slave address at a time.
pub trait I2cBackend: Send {
    fn set_address(&mut self, address: u16) -> Result<()>;

    fn set_speed(&mut self, speed: I2cSpeed) -> Result<()>;

    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Write then read without releasing the bus where supported.
    fn write_read(&mut self, data: &[u8], buf: &mut [u8]) -> Result<()> {
        self.write(data)?;
        self.read(buf)
    }
}

/// SPI device backend.
pub trait SpiBackend: Send {
    fn configure(&mut self, mode: u8, frequency_hz: Option<u32>) -> Result<()>;

    /// Clock out `tx` and return as many bytes clocked in.
    fn transfer(&mut self, tx: &[u8]) -> Result<Vec<u8>>;
}

/// Serial port backend.
pub trait UartBackend: Send {
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Read what arrives within `timeout`. `Ok(0)` means nothing arrived.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Wait up to `timeout` for received bytes.
    fn data_available(&mut self, timeout: Duration) -> Result<bool>;
}

/// Native abstraction layer.
pub trait Platform: Send + Sync {
    /// Backend name used in logs (`sim`, `linux`).
    fn name(&self) -> &str;

    fn open_gpio(&self, pin: u32) -> Result<Box<dyn GpioBackend>>;

    fn open_analog(&self, pin: u32) -> Result<Box<dyn AnalogBackend>>;

    fn open_i2c(&self, bus: u32) -> Result<Box<dyn I2cBackend>>;

    fn open_spi(&self, bus: u32, chip_select: u32) -> Result<Box<dyn SpiBackend>>;

    fn open_uart(&self, port: &str, baud: u32) -> Result<Box<dyn UartBackend>>;
}

/// Filesystem locations used by the Linux platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxConfig {
    /// sysfs GPIO class directory
    pub gpio_root: PathBuf,
    /// IIO device directory holding `in_voltage<N>_raw`
    pub iio_device: PathBuf,
    /// Directory holding `i2c-N` and `spidevB.C` nodes
    pub dev_root: PathBuf,
    /// ADC resolution reported for IIO channels
    pub adc_bits: u8,
}

impl Default for LinuxConfig {
    fn default() -> Self {
        Self {
            gpio_root: PathBuf::from("/sys/class/gpio"),
            iio_device: PathBuf::from("/sys/bus/iio/devices/iio:device0"),
            dev_root: PathBuf::from("/dev"),
            adc_bits: 12,
        }
    }
}

/// Error for an operation the platform does not offer.
pub fn unsupported(platform: &str, what: impl fmt::Display) -> SensorError {
    SensorError::config(format!("{} is not supported by the {} platform", what, platform))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_labels() {
        assert_eq!(Resource::Gpio(3).to_string(), "gpio3");
        assert_eq!(Resource::Analog(0).to_string(), "aio0");
        assert_eq!(
            Resource::I2c {
                bus: 1,
                address: 0x18
            }
            .to_string(),
            "i2c-1@0x18"
        );
        assert_eq!(
            Resource::Spi {
                bus: 0,
                chip_select: 1
            }
            .to_string(),
            "spi0.1"
        );
        assert_eq!(Resource::Uart("/dev/ttyS0".into()).to_string(), "/dev/ttyS0");
    }
}
