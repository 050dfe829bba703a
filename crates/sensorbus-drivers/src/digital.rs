//! Digital input and output drivers.
//!
//! Buttons, touch pads and PIR motion sensors are `digital_input`; relays
//! and LEDs are `digital_output`.
//!
//! # Example Configuration
//!
//! ```toml
//! [[sensors]]
//! id = "button"
//! driver = "digital_input"
//! connection = "g:17:pullup"
//!
//! [[sensors]]
//! id = "relay"
//! driver = "digital_output"
//! connection = "g:27"
//! options = { initial = false }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sensorbus_core::connection::{Direction, GpioOptions, InputMode};
use sensorbus_core::{Capability, Connection, Reading, Result, Sensor, SensorError, Switchable};
use sensorbus_hal::{Board, Gpio};
use serde::Deserialize;
use tracing::debug;

use crate::factory::{blocking, DriverFactory, SensorComponents, SensorSpec};

// =============================================================================
// Configuration Types
// =============================================================================

/// Options for `digital_input`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DigitalInputConfig {
    /// Report the inverted level (overrides the connection's input mode)
    #[serde(default)]
    pub active_low: Option<bool>,
}

/// Options for `digital_output`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DigitalOutputConfig {
    /// Level driven when the driver is built
    #[serde(default)]
    pub initial: Option<bool>,
}

fn gpio_connection(spec: &SensorSpec) -> Result<(u32, GpioOptions)> {
    match spec.connection("GPIO")? {
        Connection::Gpio { pin, options } => Ok((*pin, *options)),
        _ => Err(SensorError::config(format!(
            "sensor '{}': expected a GPIO connection",
            spec.id
        ))),
    }
}

// =============================================================================
// Digital Input
// =============================================================================

/// A GPIO pin read as a logic level.
pub struct DigitalInput {
    id: String,
    gpio: Arc<Gpio>,
}

impl DigitalInput {
    /// Configure `pin` as an input and wrap it.
    pub fn open(id: &str, board: &Board, pin: u32, options: GpioOptions) -> Result<Self> {
        let options = GpioOptions {
            direction: Some(Direction::In),
            ..options
        };
        let gpio = board.gpio_with(pin, &options)?;
        Ok(Self {
            id: id.to_string(),
            gpio: Arc::new(gpio),
        })
    }

    pub fn gpio(&self) -> &Gpio {
        &self.gpio
    }
}

#[async_trait]
impl Sensor for DigitalInput {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "digital_input"
    }

    async fn read(&self) -> Result<Reading> {
        let gpio = self.gpio.clone();
        let level = blocking(&self.id, move || gpio.read()).await?;
        Ok(Reading::Digital { level })
    }
}

// =============================================================================
// Digital Output
// =============================================================================

/// A GPIO pin driven as an on/off output.
pub struct DigitalOutput {
    id: String,
    gpio: Arc<Gpio>,
}

impl DigitalOutput {
    /// Configure `pin` as an output, optionally driving an initial level.
    pub fn open(
        id: &str,
        board: &Board,
        pin: u32,
        options: GpioOptions,
        initial: Option<bool>,
    ) -> Result<Self> {
        let direction = match initial {
            Some(true) => Direction::OutHigh,
            Some(false) => Direction::OutLow,
            None => match options.direction {
                Some(d) if d.is_output() => d,
                _ => Direction::Out,
            },
        };
        let options = GpioOptions {
            direction: Some(direction),
            ..options
        };
        let gpio = board.gpio_with(pin, &options)?;
        Ok(Self {
            id: id.to_string(),
            gpio: Arc::new(gpio),
        })
    }

    pub fn gpio(&self) -> &Gpio {
        &self.gpio
    }
}

#[async_trait]
impl Sensor for DigitalOutput {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "digital_output"
    }

    async fn read(&self) -> Result<Reading> {
        Ok(Reading::Digital {
            level: self.is_on().await?,
        })
    }
}

#[async_trait]
impl Switchable for DigitalOutput {
    async fn set(&self, on: bool) -> Result<()> {
        let gpio = self.gpio.clone();
        blocking(&self.id, move || gpio.write(on)).await?;
        debug!(sensor = %self.id, on, "Output set");
        Ok(())
    }

    async fn is_on(&self) -> Result<bool> {
        let gpio = self.gpio.clone();
        blocking(&self.id, move || gpio.read()).await
    }
}

// =============================================================================
// Factories
// =============================================================================

/// Factory for `digital_input`.
pub struct DigitalInputFactory;

static INPUT_CAPABILITIES: &[Capability] = &[Capability::Readable];

impl DriverFactory for DigitalInputFactory {
    fn driver_type(&self) -> &'static str {
        "digital_input"
    }

    fn name(&self) -> &'static str {
        "Digital Input"
    }

    fn description(&self) -> &'static str {
        "GPIO input level"
    }

    fn capabilities(&self) -> &'static [Capability] {
        INPUT_CAPABILITIES
    }

    fn validate(&self, spec: &SensorSpec) -> Result<()> {
        gpio_connection(spec)?;
        spec.options::<DigitalInputConfig>()?;
        Ok(())
    }

    fn build(&self, board: Board, spec: SensorSpec) -> BoxFuture<'static, Result<SensorComponents>> {
        Box::pin(async move {
            let cfg: DigitalInputConfig = spec.options()?;
            let (pin, mut options) = gpio_connection(&spec)?;
            if let Some(active_low) = cfg.active_low {
                options.input_mode = Some(if active_low {
                    InputMode::ActiveLow
                } else {
                    InputMode::ActiveHigh
                });
            }

            let id = spec.id.clone();
            let driver = blocking(&spec.id, move || DigitalInput::open(&id, &board, pin, options)).await?;
            Ok(SensorComponents::new(Arc::new(driver)))
        })
    }
}

/// Factory for `digital_output`.
pub struct DigitalOutputFactory;

static OUTPUT_CAPABILITIES: &[Capability] = &[Capability::Readable, Capability::Switchable];

impl DriverFactory for DigitalOutputFactory {
    fn driver_type(&self) -> &'static str {
        "digital_output"
    }

    fn name(&self) -> &'static str {
        "Digital Output"
    }

    fn description(&self) -> &'static str {
        "GPIO output that can be switched on and off"
    }

    fn capabilities(&self) -> &'static [Capability] {
        OUTPUT_CAPABILITIES
    }

    fn validate(&self, spec: &SensorSpec) -> Result<()> {
        let (_, options) = gpio_connection(spec)?;
        if options.direction == Some(Direction::In) {
            return Err(SensorError::config(format!(
                "sensor '{}': digital_output cannot use an 'in' connection",
                spec.id
            )));
        }
        spec.options::<DigitalOutputConfig>()?;
        Ok(())
    }

    fn build(&self, board: Board, spec: SensorSpec) -> BoxFuture<'static, Result<SensorComponents>> {
        Box::pin(async move {
            let cfg: DigitalOutputConfig = spec.options()?;
            let (pin, options) = gpio_connection(&spec)?;

            let id = spec.id.clone();
            let driver = Arc::new(
                blocking(&spec.id, move || {
                    DigitalOutput::open(&id, &board, pin, options, cfg.initial)
                })
                .await?,
            );
            Ok(SensorComponents::new(driver.clone()).with_switch(driver))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorbus_core::ConnectionString;

    #[test]
    fn test_output_rejects_input_direction() {
        let spec = SensorSpec::new(
            "relay",
            "digital_output",
            ConnectionString::parse("g:4:in").unwrap(),
        );
        assert!(DigitalOutputFactory.validate(&spec).is_err());
    }

    #[test]
    fn test_input_rejects_unknown_options() {
        let spec = SensorSpec::new(
            "button",
            "digital_input",
            ConnectionString::parse("g:4").unwrap(),
        )
        .with_options(toml::from_str("debounce = 5").unwrap());
        assert!(DigitalInputFactory.validate(&spec).is_err());
    }

    #[test]
    fn test_capabilities() {
        assert!(DigitalOutputFactory
            .capabilities()
            .contains(&Capability::Switchable));
        assert_eq!(DigitalInputFactory.capabilities(), &[Capability::Readable]);
    }
}
