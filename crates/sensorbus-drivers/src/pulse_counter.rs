//! Interrupt-driven pulse counter.
//!
//! Arms an edge handler on a GPIO pin that increments an atomic counter.
//! Flow meters, anemometers, rain gauges and tip-bucket sensors all
//! report this way. With `per_unit` set, readings are the count divided
//! by pulses-per-unit (e.g. 450 pulses per litre).
//!
//! # Example Configuration
//!
//! ```toml
//! [[sensors]]
//! id = "flow"
//! driver = "pulse_counter"
//! connection = "g:22:rising:pullup"
//! options = { per_unit = 450.0, unit = "L" }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sensorbus_core::connection::{Direction, Edge, GpioOptions};
use sensorbus_core::{
    Capability, Connection, EventCounter, Reading, Result, Sensor, SensorError,
};
use sensorbus_hal::{Board, EdgeEvent, Gpio, HandlerId, InterruptLine};
use serde::Deserialize;
use tracing::{debug, info};

use crate::factory::{blocking, DriverFactory, InterruptSource, SensorComponents, SensorSpec};

// =============================================================================
// Configuration Types
// =============================================================================

/// Options for `pulse_counter`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PulseCounterConfig {
    /// Edge to count; overrides the connection string (default: rising)
    #[serde(default)]
    pub edge: Option<Edge>,

    /// Pulses per unit; switches readings from counts to scalars
    #[serde(default)]
    pub per_unit: Option<f64>,

    /// Unit for scaled readings
    #[serde(default)]
    pub unit: Option<String>,
}

impl PulseCounterConfig {
    fn validate(&self, id: &str) -> Result<()> {
        if self.edge == Some(Edge::None) {
            return Err(SensorError::config(format!(
                "sensor '{}': pulse_counter needs an edge other than 'none'",
                id
            )));
        }
        if let Some(per_unit) = self.per_unit {
            if !(per_unit.is_finite() && per_unit > 0.0) {
                return Err(SensorError::config(format!(
                    "sensor '{}': per_unit must be positive, got {}",
                    id, per_unit
                )));
            }
        }
        Ok(())
    }
}

fn counter_connection(spec: &SensorSpec, cfg: &PulseCounterConfig) -> Result<(u32, GpioOptions, Edge)> {
    let (pin, options) = match spec.connection("GPIO")? {
        Connection::Gpio { pin, options } => (*pin, *options),
        _ => {
            return Err(SensorError::config(format!(
                "sensor '{}': expected a GPIO connection",
                spec.id
            )))
        }
    };
    let edge = match (cfg.edge, options.edge) {
        (Some(edge), _) => edge,
        (None, Some(Edge::None)) => {
            return Err(SensorError::config(format!(
                "sensor '{}': pulse_counter needs an edge other than 'none'",
                spec.id
            )))
        }
        (None, Some(edge)) => edge,
        (None, None) => Edge::Rising,
    };
    Ok((pin, options, edge))
}

// =============================================================================
// Driver
// =============================================================================

/// Counts edges on one pin.
pub struct PulseCounter {
    id: String,
    gpio: Gpio,
    edge: Edge,
    handler: HandlerId,
    count: Arc<AtomicU64>,
    per_unit: Option<f64>,
    unit: String,
}

impl PulseCounter {
    /// Configure `pin` as an input and arm the counting handler on `edge`.
    pub fn arm(
        id: &str,
        board: &Board,
        pin: u32,
        options: GpioOptions,
        edge: Edge,
        config: &PulseCounterConfig,
    ) -> Result<Self> {
        config.validate(id)?;
        let options = GpioOptions {
            direction: Some(Direction::In),
            edge: Some(edge),
            ..options
        };
        let gpio = board.gpio_with(pin, &options)?;

        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let registration = gpio.isr(edge, move |_event: &EdgeEvent| -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?;
        info!(
            sensor = id,
            pin,
            edge = edge.as_str(),
            handler = %registration.id,
            "Pulse counter armed"
        );

        Ok(Self {
            id: id.to_string(),
            gpio,
            edge,
            handler: registration.id,
            count,
            per_unit: config.per_unit,
            unit: config.unit.clone().unwrap_or_default(),
        })
    }

    pub fn edge(&self) -> Edge {
        self.edge
    }

    /// Id of the counting handler.
    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    pub fn gpio(&self) -> &Gpio {
        &self.gpio
    }
}

impl EventCounter for PulseCounter {
    fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    fn reset(&self) -> u64 {
        let previous = self.count.swap(0, Ordering::SeqCst);
        debug!(sensor = %self.id, previous, "Pulse counter reset");
        previous
    }
}

impl InterruptSource for PulseCounter {
    fn line(&self) -> &InterruptLine {
        self.gpio.interrupts()
    }
}

#[async_trait]
impl Sensor for PulseCounter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "pulse_counter"
    }

    async fn read(&self) -> Result<Reading> {
        let count = self.count();
        Ok(match self.per_unit {
            Some(per_unit) => Reading::scalar(count as f64 / per_unit, self.unit.clone()),
            None => Reading::Count { count },
        })
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Factory for `pulse_counter`.
pub struct PulseCounterFactory;

static CAPABILITIES: &[Capability] = &[Capability::Readable, Capability::Counting];

impl DriverFactory for PulseCounterFactory {
    fn driver_type(&self) -> &'static str {
        "pulse_counter"
    }

    fn name(&self) -> &'static str {
        "Pulse Counter"
    }

    fn description(&self) -> &'static str {
        "Interrupt-driven edge counter, optionally scaled per unit"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn validate(&self, spec: &SensorSpec) -> Result<()> {
        let cfg: PulseCounterConfig = spec.options()?;
        cfg.validate(&spec.id)?;
        counter_connection(spec, &cfg)?;
        Ok(())
    }

    fn build(&self, board: Board, spec: SensorSpec) -> BoxFuture<'static, Result<SensorComponents>> {
        Box::pin(async move {
            let cfg: PulseCounterConfig = spec.options()?;
            let (pin, options, edge) = counter_connection(&spec, &cfg)?;

            let id = spec.id.clone();
            let driver = Arc::new(
                blocking(&spec.id, move || {
                    PulseCounter::arm(&id, &board, pin, options, edge, &cfg)
                })
                .await?,
            );
            Ok(SensorComponents::new(driver.clone())
                .with_counter(driver.clone())
                .with_interrupts(driver))
        })
    }
}
