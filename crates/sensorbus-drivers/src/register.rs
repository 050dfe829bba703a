//! Register-mapped sensors on I2C or SPI.
//!
//! Reads `width` bytes starting at `register`, assembles them into an
//! unsigned word, then masks, shifts, sign-extends and scales it. This
//! covers the common single-value chips (temperature, light, pressure
//! ADC words) without a dedicated driver per part.
//!
//! # Example Configuration
//!
//! ```toml
//! # TMP102: 12-bit left-justified two's complement, 0.0625 °C/LSB
//! [[sensors]]
//! id = "board_temp"
//! driver = "register"
//! connection = "i:1:0x48"
//! options = { register = 0x00, width = 2, big_endian = true, shift = 4, signed_bits = 12, scale = 0.0625, unit = "C" }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sensorbus_core::{Capability, Reading, Result, Sensor, SensorError};
use sensorbus_hal::{Board, Device, I2cDevice, SpiDevice};
use serde::Deserialize;
use tracing::trace;

use crate::factory::{blocking, DriverFactory, SensorComponents, SensorSpec};

// =============================================================================
// Configuration Types
// =============================================================================

/// Options for `register`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterConfig {
    /// First register to read
    pub register: u8,

    /// Bytes to read: 1 or 2 (default: 1)
    #[serde(default = "default_width")]
    pub width: u8,

    /// Most significant byte first
    #[serde(default)]
    pub big_endian: bool,

    /// Bits kept from the assembled word
    #[serde(default)]
    pub mask: Option<u16>,

    /// Right shift applied after masking
    #[serde(default)]
    pub shift: u8,

    /// Treat the value as two's complement of this many bits
    #[serde(default)]
    pub signed_bits: Option<u8>,

    #[serde(default = "default_scale")]
    pub scale: f64,

    #[serde(default)]
    pub offset: f64,

    #[serde(default)]
    pub unit: String,

    /// I2C address when the connection string has none
    #[serde(default)]
    pub address: Option<u16>,

    /// OR-ed into the register byte for SPI reads (e.g. 0x80)
    #[serde(default)]
    pub read_flag: u8,
}

fn default_width() -> u8 {
    1
}

fn default_scale() -> f64 {
    1.0
}

impl RegisterConfig {
    fn validate(&self, id: &str) -> Result<()> {
        let bits = u32::from(self.width) * 8;
        if !matches!(self.width, 1 | 2) {
            return Err(SensorError::config(format!(
                "sensor '{}': width must be 1 or 2 bytes, got {}",
                id, self.width
            )));
        }
        if u32::from(self.shift) >= bits {
            return Err(SensorError::config(format!(
                "sensor '{}': shift {} leaves no bits of a {}-bit word",
                id, self.shift, bits
            )));
        }
        if let Some(n) = self.signed_bits {
            if n == 0 || u32::from(n) > bits {
                return Err(SensorError::config(format!(
                    "sensor '{}': signed_bits must be 1-{}, got {}",
                    id, bits, n
                )));
            }
        }
        if !self.scale.is_finite() || !self.offset.is_finite() {
            return Err(SensorError::config(format!(
                "sensor '{}': scale and offset must be finite",
                id
            )));
        }
        Ok(())
    }

    /// Turn register bytes into the scaled value.
    pub fn decode(&self, bytes: &[u8]) -> Result<f64> {
        let word = match (self.width, bytes) {
            (1, [b, ..]) => u16::from(*b),
            (2, [hi, lo, ..]) if self.big_endian => u16::from_be_bytes([*hi, *lo]),
            (2, [lo, hi, ..]) => u16::from_le_bytes([*lo, *hi]),
            _ => {
                return Err(SensorError::transient(
                    "register",
                    format!("short read: wanted {} bytes, got {}", self.width, bytes.len()),
                ))
            }
        };

        let masked = self.mask.map_or(word, |m| word & m) >> self.shift;
        let value = match self.signed_bits {
            Some(n) => {
                let raw = i32::from(masked) & ((1i32 << n) - 1);
                if raw & (1 << (n - 1)) != 0 {
                    raw - (1 << n)
                } else {
                    raw
                }
            }
            None => i32::from(masked),
        };
        Ok(f64::from(value) * self.scale + self.offset)
    }
}

// =============================================================================
// Driver
// =============================================================================

#[derive(Clone)]
enum RegisterBus {
    I2c(Arc<I2cDevice>),
    Spi(Arc<SpiDevice>),
}

/// One register-mapped value.
pub struct RegisterSensor {
    id: String,
    bus: RegisterBus,
    config: RegisterConfig,
}

impl RegisterSensor {
    /// Wrap an opened I2C or SPI device.
    pub fn new(id: &str, device: Device, config: RegisterConfig) -> Result<Self> {
        config.validate(id)?;
        let bus = match device {
            Device::I2c(dev) => RegisterBus::I2c(Arc::new(dev)),
            Device::Spi(dev) => RegisterBus::Spi(Arc::new(dev)),
            other => {
                return Err(SensorError::config(format!(
                    "sensor '{}': register needs an I2C or SPI connection, got {}",
                    id,
                    other.protocol()
                )))
            }
        };
        Ok(Self {
            id: id.to_string(),
            bus,
            config,
        })
    }
}

impl RegisterBus {
    fn read(&self, register: u8, read_flag: u8, len: usize) -> Result<Vec<u8>> {
        match self {
            RegisterBus::I2c(dev) => dev.read_block(register, len),
            RegisterBus::Spi(dev) => dev.read_register(register | read_flag, len),
        }
    }
}

#[async_trait]
impl Sensor for RegisterSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "register"
    }

    async fn read(&self) -> Result<Reading> {
        let bus = self.bus.clone();
        let (register, read_flag) = (self.config.register, self.config.read_flag);
        let len = usize::from(self.config.width);
        let bytes = blocking(&self.id, move || bus.read(register, read_flag, len)).await?;
        trace!(sensor = %self.id, ?bytes, "Register read");

        let value = self.config.decode(&bytes).map_err(|_| {
            SensorError::transient(&self.id, format!("short read: {} bytes", bytes.len()))
        })?;
        Ok(Reading::scalar(value, self.config.unit.clone()))
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Factory for `register`.
pub struct RegisterFactory;

static CAPABILITIES: &[Capability] = &[Capability::Readable];

impl DriverFactory for RegisterFactory {
    fn driver_type(&self) -> &'static str {
        "register"
    }

    fn name(&self) -> &'static str {
        "Register-Mapped Sensor"
    }

    fn description(&self) -> &'static str {
        "Register read over I2C or SPI, scaled to a value"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn validate(&self, spec: &SensorSpec) -> Result<()> {
        let cfg: RegisterConfig = spec.options()?;
        cfg.validate(&spec.id)?;
        let connection = spec.connection_any(&["I2C", "SPI"])?;
        if let sensorbus_core::Connection::I2c { address: None, .. } = connection {
            if cfg.address.is_none() {
                return Err(SensorError::config(format!(
                    "sensor '{}': I2C address missing from both connection and options",
                    spec.id
                )));
            }
        }
        Ok(())
    }

    fn build(&self, board: Board, spec: SensorSpec) -> BoxFuture<'static, Result<SensorComponents>> {
        Box::pin(async move {
            let cfg: RegisterConfig = spec.options()?;
            let connection = spec.connection_any(&["I2C", "SPI"])?.clone();
            let address = cfg.address;

            let device = blocking(&spec.id, move || board.open(&connection, address)).await?;
            let driver = RegisterSensor::new(&spec.id, device, cfg)?;
            Ok(SensorComponents::new(Arc::new(driver)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(options: &str) -> RegisterConfig {
        toml::from_str(options).unwrap()
    }

    #[test]
    fn test_decode_single_byte() {
        let cfg = config("register = 0\nscale = 0.5");
        assert_eq!(cfg.decode(&[200]).unwrap(), 100.0);
    }

    #[test]
    fn test_decode_endianness() {
        let le = config("register = 0\nwidth = 2");
        let be = config("register = 0\nwidth = 2\nbig_endian = true");
        assert_eq!(le.decode(&[0x34, 0x12]).unwrap(), f64::from(0x1234u16));
        assert_eq!(be.decode(&[0x12, 0x34]).unwrap(), f64::from(0x1234u16));
    }

    #[test]
    fn test_decode_tmp102_negative() {
        // -25 °C = 0xE70 in 12-bit two's complement, left-justified
        let cfg = config(
            "register = 0\nwidth = 2\nbig_endian = true\nshift = 4\nsigned_bits = 12\nscale = 0.0625",
        );
        assert_eq!(cfg.decode(&[0xE7, 0x00]).unwrap(), -25.0);
        assert_eq!(cfg.decode(&[0x19, 0x00]).unwrap(), 25.0);
    }

    #[test]
    fn test_decode_mask_and_offset() {
        let cfg = config("register = 0\nmask = 0x0F\noffset = -1.0");
        assert_eq!(cfg.decode(&[0xF3]).unwrap(), 2.0);
    }

    #[test]
    fn test_short_read_is_transient() {
        let cfg = config("register = 0\nwidth = 2");
        assert!(cfg.decode(&[0x01]).unwrap_err().is_transient());
    }

    #[test]
    fn test_validation() {
        assert!(config("register = 0\nwidth = 3").validate("t").is_err());
        assert!(config("register = 0\nsigned_bits = 9").validate("t").is_err());
        assert!(config("register = 0\nshift = 8").validate("t").is_err());
        assert!(config("register = 0\nwidth = 2\nsigned_bits = 16").validate("t").is_ok());
    }
}
