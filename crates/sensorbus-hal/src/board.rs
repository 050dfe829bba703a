//! Board: a platform plus the table of claimed resources.
//!
//! Every device proxy holds a [`Claim`] on the resource it is bound to. A
//! second claim on a live resource is a configuration error; dropping the
//! proxy releases the claim.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use sensorbus_core::connection::{Connection, GpioOptions, I2cSpeed};
use sensorbus_core::{Result, SensorError};
use tracing::{debug, info};

use crate::device::{AnalogInput, Device, Gpio, I2cDevice, SpiDevice, Uart};
use crate::interrupt::InterruptConfig;
use crate::library::NativeLibrary;
use crate::platform::{unsupported, Platform, Resource};

type ClaimTable = Arc<Mutex<BTreeSet<Resource>>>;

/// Exclusive hold on one resource, released on drop.
pub struct Claim {
    table: ClaimTable,
    resource: Resource,
}

impl Claim {
    /// The claimed resource.
    pub fn resource(&self) -> &Resource {
        &self.resource
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.table.lock().remove(&self.resource);
        debug!(resource = %self.resource, "Released claim");
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Claim").field(&self.resource).finish()
    }
}

/// Entry point for opening device proxies.
///
/// Cheap to clone; clones share the platform and the claim table.
#[derive(Clone)]
pub struct Board {
    platform: Arc<dyn Platform>,
    claims: ClaimTable,
    interrupts: InterruptConfig,
    libraries: Arc<Vec<NativeLibrary>>,
}

impl Board {
    /// Create a board over `platform` with default interrupt settings.
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        info!(platform = platform.name(), "Opened board");
        Self {
            platform,
            claims: Arc::new(Mutex::new(BTreeSet::new())),
            interrupts: InterruptConfig::default(),
            libraries: Arc::new(Vec::new()),
        }
    }

    /// Interrupt queue settings for GPIO lines opened after this call.
    pub fn with_interrupts(mut self, config: InterruptConfig) -> Self {
        self.interrupts = config;
        self
    }

    /// Keep vendor libraries loaded for the board's lifetime.
    pub fn with_libraries(mut self, libraries: Vec<NativeLibrary>) -> Self {
        self.libraries = Arc::new(libraries);
        self
    }

    /// Platform name.
    pub fn platform_name(&self) -> &str {
        self.platform.name()
    }

    /// Names of the loaded vendor libraries.
    pub fn libraries(&self) -> Vec<&str> {
        self.libraries.iter().map(NativeLibrary::name).collect()
    }

    /// Interrupt settings applied to new GPIO lines.
    pub fn interrupt_config(&self) -> InterruptConfig {
        self.interrupts
    }

    /// Currently claimed resources, in order.
    pub fn claimed(&self) -> Vec<Resource> {
        self.claims.lock().iter().cloned().collect()
    }

    /// Check whether `resource` is held by a live proxy.
    pub fn is_claimed(&self, resource: &Resource) -> bool {
        self.claims.lock().contains(resource)
    }

    pub(crate) fn claim(&self, resource: Resource) -> Result<Claim> {
        let mut table = self.claims.lock();
        if !table.insert(resource.clone()) {
            return Err(SensorError::config(format!(
                "{} is already claimed by another handle",
                resource
            )));
        }
        debug!(resource = %resource, "Claimed");
        Ok(Claim {
            table: Arc::clone(&self.claims),
            resource,
        })
    }

    /// Open a GPIO pin with default settings.
    pub fn gpio(&self, pin: u32) -> Result<Gpio> {
        self.gpio_with(pin, &GpioOptions::default())
    }

    /// Open a GPIO pin and apply connection-string options.
    pub fn gpio_with(&self, pin: u32, options: &GpioOptions) -> Result<Gpio> {
        let claim = self.claim(Resource::Gpio(pin))?;
        let backend = self.platform.open_gpio(pin)?;
        let gpio = Gpio::new(pin, backend, claim, self.interrupts);
        gpio.apply(options)?;
        Ok(gpio)
    }

    /// Open an analog input pin.
    pub fn analog(&self, pin: u32) -> Result<AnalogInput> {
        let claim = self.claim(Resource::Analog(pin))?;
        let backend = self.platform.open_analog(pin)?;
        Ok(AnalogInput::new(pin, backend, claim))
    }

    /// Open an I2C device at a 7-bit `address`.
    pub fn i2c(&self, bus: u32, address: u16, speed: Option<I2cSpeed>) -> Result<I2cDevice> {
        if address > 0x7F {
            return Err(SensorError::config(format!(
                "I2C address 0x{:x} is not a 7-bit address",
                address
            )));
        }
        let claim = self.claim(Resource::I2c { bus, address })?;
        let mut backend = self.platform.open_i2c(bus)?;
        backend.set_address(address)?;
        if let Some(speed) = speed {
            backend.set_speed(speed)?;
        }
        Ok(I2cDevice::new(bus, address, backend, claim))
    }

    /// Open an SPI device.
    pub fn spi(
        &self,
        bus: u32,
        chip_select: u32,
        mode: u8,
        frequency_hz: Option<u32>,
    ) -> Result<SpiDevice> {
        let claim = self.claim(Resource::Spi { bus, chip_select })?;
        let mut backend = self.platform.open_spi(bus, chip_select)?;
        backend.configure(mode, frequency_hz)?;
        Ok(SpiDevice::new(bus, chip_select, mode, backend, claim))
    }

    /// Open a serial port.
    pub fn uart(&self, port: &str, baud: u32) -> Result<Uart> {
        let claim = self.claim(Resource::Uart(port.to_string()))?;
        let backend = self.platform.open_uart(port, baud)?;
        Ok(Uart::new(port, baud, backend, claim))
    }

    /// Open the proxy a parsed connection entry describes.
    ///
    /// I2C entries without an address take `default_address`.
    pub fn open(&self, connection: &Connection, default_address: Option<u16>) -> Result<Device> {
        match connection {
            Connection::Analog { pin } => self.analog(*pin).map(Device::Analog),
            Connection::Gpio { pin, options } => self.gpio_with(*pin, options).map(Device::Gpio),
            Connection::I2c {
                bus,
                address,
                speed,
            } => {
                let address = address.or(default_address).ok_or_else(|| {
                    SensorError::config(format!("{} has no I2C address", connection))
                })?;
                self.i2c(*bus, address, *speed).map(Device::I2c)
            }
            Connection::Spi {
                bus,
                chip_select,
                mode,
                frequency_hz,
            } => self
                .spi(*bus, *chip_select, *mode, *frequency_hz)
                .map(Device::Spi),
            Connection::Uart { port, baud } => self.uart(port, *baud).map(Device::Uart),
            Connection::Pwm { pin } => Err(unsupported(
                self.platform.name(),
                format!("PWM output on pin {}", pin),
            )),
        }
    }
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Board")
            .field("platform", &self.platform.name())
            .field("claimed", &self.claimed())
            .field("libraries", &self.libraries())
            .finish()
    }
}
