//! Driver factory trait and registry.
//!
//! Every driver type is registered once as a [`DriverFactory`]. A sensor
//! entry from the configuration becomes a [`SensorSpec`]; the registry
//! looks up the factory by `driver`, validates the spec and builds
//! [`SensorComponents`] on a [`Board`].
//!
//! ```text
//! [[sensors]]                      DriverRegistry
//! id = "pot"            ──▶  factories["analog"].validate(spec)
//! driver = "analog"                         .build(board, spec)
//! connection = "a:0"                              │
//!                                                 ▼
//!                                SensorComponents { sensor, switch, counter, .. }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use sensorbus_core::{
    Capability, Connection, ConnectionString, EventCounter, Result, Sensor, SensorError,
    SwitchCommand, Switchable,
};
use sensorbus_hal::{Board, InterruptLine};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

// =============================================================================
// Sensor Spec
// =============================================================================

/// One configured sensor, as handed to a factory.
#[derive(Debug, Clone)]
pub struct SensorSpec {
    /// Unique sensor id
    pub id: String,
    /// Driver type (matches [`DriverFactory::driver_type`])
    pub driver: String,
    /// Parsed connection string
    pub connections: ConnectionString,
    /// Driver-specific options table
    pub options: toml::Value,
}

impl SensorSpec {
    /// Spec with an empty options table.
    pub fn new(
        id: impl Into<String>,
        driver: impl Into<String>,
        connections: ConnectionString,
    ) -> Self {
        Self {
            id: id.into(),
            driver: driver.into(),
            connections,
            options: toml::Value::Table(toml::map::Map::new()),
        }
    }

    /// Replace the options table.
    pub fn with_options(mut self, options: toml::Value) -> Self {
        self.options = options;
        self
    }

    /// Deserialize the options table into a driver's config struct.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T> {
        self.options.clone().try_into().map_err(|e| {
            SensorError::config(format!("sensor '{}': invalid options: {}", self.id, e))
        })
    }

    /// First connection of the given protocol (`"AIO"`, `"GPIO"`, ...).
    pub fn connection(&self, protocol: &str) -> Result<&Connection> {
        self.connections.first_of(protocol).ok_or_else(|| {
            SensorError::config(format!(
                "sensor '{}' ({}) needs a {} connection, got '{}'",
                self.id, self.driver, protocol, self.connections
            ))
        })
    }

    /// First connection matching any of `protocols`, in connection-string order.
    pub fn connection_any(&self, protocols: &[&str]) -> Result<&Connection> {
        self.connections
            .iter()
            .find(|c| protocols.contains(&c.protocol()))
            .ok_or_else(|| {
                SensorError::config(format!(
                    "sensor '{}' ({}) needs one of {} connections, got '{}'",
                    self.id,
                    self.driver,
                    protocols.join("/"),
                    self.connections
                ))
            })
    }
}

// =============================================================================
// Sensor Components
// =============================================================================

/// Access to the interrupt line a driver has armed.
pub trait InterruptSource: Send + Sync {
    /// The armed line (stats, fault sink, `wait_idle`).
    fn line(&self) -> &InterruptLine;
}

/// Capability handles produced by a factory build.
///
/// `sensor` is always present; the others are set when the driver
/// supports them. Handles may share one underlying driver.
#[derive(Clone)]
pub struct SensorComponents {
    pub sensor: Arc<dyn Sensor>,
    pub switch: Option<Arc<dyn Switchable>>,
    pub counter: Option<Arc<dyn EventCounter>>,
    pub interrupts: Option<Arc<dyn InterruptSource>>,
}

impl SensorComponents {
    pub fn new(sensor: Arc<dyn Sensor>) -> Self {
        Self {
            sensor,
            switch: None,
            counter: None,
            interrupts: None,
        }
    }

    pub fn with_switch(mut self, switch: Arc<dyn Switchable>) -> Self {
        self.switch = Some(switch);
        self
    }

    pub fn with_counter(mut self, counter: Arc<dyn EventCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn with_interrupts(mut self, source: Arc<dyn InterruptSource>) -> Self {
        self.interrupts = Some(source);
        self
    }

    /// Sensor id.
    pub fn id(&self) -> &str {
        self.sensor.id()
    }

    /// Capabilities actually present.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = vec![Capability::Readable];
        if self.switch.is_some() {
            caps.push(Capability::Switchable);
        }
        if self.counter.is_some() {
            caps.push(Capability::Counting);
        }
        caps
    }
}

impl fmt::Debug for SensorComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorComponents")
            .field("id", &self.sensor.id())
            .field("kind", &self.sensor.kind())
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

// =============================================================================
// Driver Descriptor
// =============================================================================

/// What a driver type is and what it accepts, for listings.
///
/// Serializes as
/// `{"driver": "digital_output", "name": "Digital Output", "description": ..., "capabilities": ["readable", "switchable"], "commands": ["on", "off", "toggle"]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverDescriptor {
    pub driver: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub capabilities: Vec<Capability>,
    /// Commands accepted by the driver's switchable output
    pub commands: Vec<SwitchCommand>,
}

impl DriverDescriptor {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Creates sensors of one driver type.
///
/// Factories are registered once and live for the program's lifetime.
/// `build()` returns a `'static` future, so anything it needs from `self`
/// must be cloned into the future.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name used in the `driver` field of a sensor entry.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for listings and error messages.
    fn name(&self) -> &'static str;

    /// One-line description for listings.
    fn description(&self) -> &'static str {
        self.name()
    }

    /// Capabilities this driver type provides.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Self-description assembled from the methods above.
    fn descriptor(&self) -> DriverDescriptor {
        let capabilities = self.capabilities().to_vec();
        let commands = if capabilities.contains(&Capability::Switchable) {
            SwitchCommand::ALL.to_vec()
        } else {
            Vec::new()
        };
        DriverDescriptor {
            driver: self.driver_type(),
            name: self.name(),
            description: self.description(),
            capabilities,
            commands,
        }
    }

    /// Check connections and options without touching hardware.
    fn validate(&self, spec: &SensorSpec) -> Result<()>;

    /// Open the bus resources on `board` and build the driver.
    fn build(&self, board: Board, spec: SensorSpec) -> BoxFuture<'static, Result<SensorComponents>>;
}

// =============================================================================
// Registry
// =============================================================================

/// Driver factories by driver type.
#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<&'static str, Box<dyn DriverFactory>>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every bundled driver.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(crate::digital::DigitalInputFactory));
        registry.register(Box::new(crate::digital::DigitalOutputFactory));
        registry.register(Box::new(crate::analog::AnalogFactory));
        registry.register(Box::new(crate::pulse_counter::PulseCounterFactory));
        registry.register(Box::new(crate::register::RegisterFactory));
        registry.register(Box::new(crate::line_sensor::UartLinesFactory));
        registry
    }

    /// Register a factory, returning any factory it replaced.
    pub fn register(&mut self, factory: Box<dyn DriverFactory>) -> Option<Box<dyn DriverFactory>> {
        debug!(
            driver_type = factory.driver_type(),
            name = factory.name(),
            capabilities = ?factory.capabilities(),
            "Registering driver factory"
        );
        self.factories.insert(factory.driver_type(), factory)
    }

    pub fn get(&self, driver_type: &str) -> Option<&dyn DriverFactory> {
        self.factories.get(driver_type).map(|f| f.as_ref())
    }

    pub fn contains(&self, driver_type: &str) -> bool {
        self.factories.contains_key(driver_type)
    }

    /// Registered driver types, sorted.
    pub fn driver_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Descriptors of every registered driver, sorted by driver type.
    pub fn descriptors(&self) -> Vec<DriverDescriptor> {
        self.driver_types()
            .into_iter()
            .filter_map(|t| self.get(t).map(|f| f.descriptor()))
            .collect()
    }

    fn factory(&self, spec: &SensorSpec) -> Result<&dyn DriverFactory> {
        self.get(&spec.driver).ok_or_else(|| {
            SensorError::config(format!(
                "sensor '{}': unknown driver '{}' (known: {})",
                spec.id,
                spec.driver,
                self.driver_types().join(", ")
            ))
        })
    }

    /// Validate a spec with its factory.
    pub fn validate(&self, spec: &SensorSpec) -> Result<()> {
        self.factory(spec)?.validate(spec)
    }

    /// Validate and build one sensor.
    pub async fn build(&self, board: &Board, spec: SensorSpec) -> Result<SensorComponents> {
        let factory = self.factory(&spec)?;
        factory.validate(&spec)?;

        let id = spec.id.clone();
        let driver = factory.driver_type();
        let connections = spec.connections.to_string();
        let components = factory.build(board.clone(), spec).await?;
        info!(
            sensor = %id,
            driver,
            connection = %connections,
            capabilities = ?components.capabilities(),
            "Sensor ready"
        );
        Ok(components)
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("driver_types", &self.driver_types())
            .finish()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Run blocking device I/O off the async runtime.
pub(crate) async fn blocking<T, F>(sensor: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SensorError::fatal(sensor, format!("blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorbus_core::ErrorKind;

    fn spec(driver: &str, conn: &str) -> SensorSpec {
        SensorSpec::new("s1", driver, ConnectionString::parse(conn).unwrap())
    }

    #[test]
    fn test_defaults_registered() {
        let registry = DriverRegistry::with_defaults();
        assert_eq!(
            registry.driver_types(),
            vec![
                "analog",
                "digital_input",
                "digital_output",
                "pulse_counter",
                "register",
                "uart_lines"
            ]
        );
    }

    #[test]
    fn test_descriptors_list_commands_for_outputs() {
        let registry = DriverRegistry::with_defaults();
        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 6);
        assert!(descriptors.iter().all(|d| !d.description.is_empty()));

        let relay = registry.get("digital_output").unwrap().descriptor();
        assert!(relay.has_capability(Capability::Switchable));
        assert_eq!(relay.commands, SwitchCommand::ALL.to_vec());

        let pot = registry.get("analog").unwrap().descriptor();
        assert!(pot.commands.is_empty());
    }

    #[test]
    fn test_descriptor_json_shape() {
        let registry = DriverRegistry::with_defaults();
        let json = serde_json::to_value(registry.get("digital_output").unwrap().descriptor())
            .unwrap();
        assert_eq!(json["driver"], "digital_output");
        assert_eq!(json["name"], "Digital Output");
        assert_eq!(json["capabilities"], serde_json::json!(["readable", "switchable"]));
        assert_eq!(json["commands"], serde_json::json!(["on", "off", "toggle"]));
    }

    #[test]
    fn test_unknown_driver_is_configuration_error() {
        let registry = DriverRegistry::with_defaults();
        let err = registry.validate(&spec("thermocouple", "a:0")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("thermocouple"));
    }

    #[test]
    fn test_connection_lookup() {
        let s = spec("register", "g:4,i:1:0x48");
        assert_eq!(s.connection("I2C").unwrap().protocol(), "I2C");
        assert_eq!(s.connection_any(&["SPI", "I2C"]).unwrap().protocol(), "I2C");
        assert!(s.connection("AIO").is_err());
    }

    #[test]
    fn test_invalid_options_name_the_sensor() {
        #[derive(Debug, serde::Deserialize)]
        struct Opts {
            #[allow(dead_code)]
            width: u8,
        }
        let s = spec("register", "i:1:0x48")
            .with_options(toml::from_str("width = \"wide\"").unwrap());
        let err = s.options::<Opts>().unwrap_err();
        assert!(err.to_string().contains("sensor 's1'"));
    }
}
