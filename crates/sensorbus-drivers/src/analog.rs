//! Analog input driver: ADC counts scaled to a physical value.
//!
//! `value = volts * scale + offset`, where `volts` is the normalized ADC
//! reading times `aref`. A 10 mV/°C temperature sensor on a 5 V board is
//! `scale = 100.0, unit = "C"`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sensorbus_core::{Capability, Connection, Reading, Result, Sensor, SensorError};
use sensorbus_hal::device::DEFAULT_AREF;
use sensorbus_hal::{AnalogInput, Board};
use serde::Deserialize;
use tracing::trace;

use crate::factory::{blocking, DriverFactory, SensorComponents, SensorSpec};

// =============================================================================
// Configuration Types
// =============================================================================

/// Options for `analog`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalogConfig {
    /// Reference voltage (default: 5.0)
    #[serde(default = "default_aref")]
    pub aref: f64,

    /// Multiplier applied to the voltage
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Added after scaling
    #[serde(default)]
    pub offset: f64,

    /// Unit of the scaled value (default: "V")
    #[serde(default = "default_unit")]
    pub unit: String,
}

fn default_aref() -> f64 {
    DEFAULT_AREF
}

fn default_scale() -> f64 {
    1.0
}

fn default_unit() -> String {
    "V".to_string()
}

impl Default for AnalogConfig {
    fn default() -> Self {
        Self {
            aref: default_aref(),
            scale: default_scale(),
            offset: 0.0,
            unit: default_unit(),
        }
    }
}

impl AnalogConfig {
    fn validate(&self, id: &str) -> Result<()> {
        if !(self.aref.is_finite() && self.aref > 0.0) {
            return Err(SensorError::config(format!(
                "sensor '{}': aref must be positive, got {}",
                id, self.aref
            )));
        }
        if !self.scale.is_finite() || !self.offset.is_finite() {
            return Err(SensorError::config(format!(
                "sensor '{}': scale and offset must be finite",
                id
            )));
        }
        Ok(())
    }
}

fn analog_pin(spec: &SensorSpec) -> Result<u32> {
    match spec.connection("AIO")? {
        Connection::Analog { pin } => Ok(*pin),
        _ => Err(SensorError::config(format!(
            "sensor '{}': expected an analog connection",
            spec.id
        ))),
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Scaled ADC channel.
pub struct AnalogSensor {
    id: String,
    input: Arc<AnalogInput>,
    scale: f64,
    offset: f64,
    unit: String,
}

impl AnalogSensor {
    pub fn new(id: &str, input: AnalogInput, config: &AnalogConfig) -> Result<Self> {
        config.validate(id)?;
        input.set_aref(config.aref)?;
        Ok(Self {
            id: id.to_string(),
            input: Arc::new(input),
            scale: config.scale,
            offset: config.offset,
            unit: config.unit.clone(),
        })
    }

    pub fn input(&self) -> &AnalogInput {
        &self.input
    }
}

#[async_trait]
impl Sensor for AnalogSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "analog"
    }

    async fn read(&self) -> Result<Reading> {
        let input = self.input.clone();
        let volts = blocking(&self.id, move || input.read_volts()).await?;
        let value = volts * self.scale + self.offset;
        trace!(sensor = %self.id, volts, value, "Analog sample");
        Ok(Reading::scalar(value, self.unit.clone()))
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Factory for `analog`.
pub struct AnalogFactory;

static CAPABILITIES: &[Capability] = &[Capability::Readable];

impl DriverFactory for AnalogFactory {
    fn driver_type(&self) -> &'static str {
        "analog"
    }

    fn name(&self) -> &'static str {
        "Analog Input"
    }

    fn description(&self) -> &'static str {
        "Scaled ADC channel reading"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn validate(&self, spec: &SensorSpec) -> Result<()> {
        analog_pin(spec)?;
        spec.options::<AnalogConfig>()?.validate(&spec.id)
    }

    fn build(&self, board: Board, spec: SensorSpec) -> BoxFuture<'static, Result<SensorComponents>> {
        Box::pin(async move {
            let cfg: AnalogConfig = spec.options()?;
            let pin = analog_pin(&spec)?;

            let input = blocking(&spec.id, move || board.analog(pin)).await?;
            let driver = AnalogSensor::new(&spec.id, input, &cfg)?;
            Ok(SensorComponents::new(Arc::new(driver)))
        })
    }
}
