//! Linux platform: sysfs GPIO, IIO ADC, i2c-dev, spidev and serial ports.
//!
//! Paths are configurable so the backends can be pointed at a fake sysfs
//! tree in tests.

mod aio;
mod gpio;
mod i2c;
mod spi;
#[cfg(feature = "serial")]
mod uart;

use sensorbus_core::Result;
use tracing::info;

use crate::platform::{
    AnalogBackend, GpioBackend, I2cBackend, LinuxConfig, Platform, SpiBackend, UartBackend,
};

/// Platform backed by Linux kernel interfaces.
#[derive(Debug, Clone, Default)]
pub struct LinuxPlatform {
    config: LinuxConfig,
}

impl LinuxPlatform {
    pub fn new(config: LinuxConfig) -> Self {
        info!(
            gpio_root = %config.gpio_root.display(),
            iio_device = %config.iio_device.display(),
            dev_root = %config.dev_root.display(),
            "Linux platform configured"
        );
        Self { config }
    }

    pub fn config(&self) -> &LinuxConfig {
        &self.config
    }
}

impl Platform for LinuxPlatform {
    fn name(&self) -> &str {
        "linux"
    }

    fn open_gpio(&self, pin: u32) -> Result<Box<dyn GpioBackend>> {
        Ok(Box::new(gpio::SysfsGpio::open(&self.config.gpio_root, pin)?))
    }

    fn open_analog(&self, pin: u32) -> Result<Box<dyn AnalogBackend>> {
        Ok(Box::new(aio::IioAnalog::open(
            &self.config.iio_device,
            pin,
            self.config.adc_bits,
        )?))
    }

    fn open_i2c(&self, bus: u32) -> Result<Box<dyn I2cBackend>> {
        Ok(Box::new(i2c::I2cDev::open(&self.config.dev_root, bus)?))
    }

    fn open_spi(&self, bus: u32, chip_select: u32) -> Result<Box<dyn SpiBackend>> {
        Ok(Box::new(spi::SpiDev::open(
            &self.config.dev_root,
            bus,
            chip_select,
        )?))
    }

    #[cfg(feature = "serial")]
    fn open_uart(&self, port: &str, baud: u32) -> Result<Box<dyn UartBackend>> {
        Ok(Box::new(uart::SerialUart::open(port, baud)?))
    }

    #[cfg(not(feature = "serial"))]
    fn open_uart(&self, port: &str, _baud: u32) -> Result<Box<dyn UartBackend>> {
        Err(crate::platform::unsupported(
            self.name(),
            format!("UART '{}' (built without the `serial` feature)", port),
        ))
    }
}
