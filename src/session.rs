//! Running set of sensors built from configuration.
//!
//! A [`Session`] owns the [`Board`] and every proxy the drivers opened.
//! Dropping it releases all claims and disarms every interrupt line.

use std::fmt;
use std::sync::Arc;

use sensorbus_core::connection::ConnectionSummary;
use sensorbus_core::{EventCounter, Sensor, SwitchCommand, Switchable};
use sensorbus_drivers::{DriverDescriptor, DriverRegistry, InterruptSource, SensorComponents};
use sensorbus_hal::{Board, CallbackFault, NativeLibrary, Platform, SimPlatform};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::acquisition::{PollingConfig, PollingLoop};
use crate::config::{AppConfig, PlatformConfig};
use crate::error::{AppError, AppResult};

/// Open the configured platform backend.
///
/// Native libraries are loaded first; a missing one stops startup before
/// any bus is touched.
pub fn open_board(config: &AppConfig) -> AppResult<Board> {
    let libraries = NativeLibrary::load_all(&config.platform.native_libraries)?;
    let platform = open_platform(&config.platform)?;

    Ok(Board::new(platform)
        .with_interrupts(config.interrupts)
        .with_libraries(libraries))
}

fn open_platform(config: &PlatformConfig) -> AppResult<Arc<dyn Platform>> {
    match config.backend.as_str() {
        "sim" => Ok(Arc::new(SimPlatform::with_adc_bits(config.sim_adc_bits))),
        #[cfg(target_os = "linux")]
        "linux" => Ok(Arc::new(sensorbus_hal::LinuxPlatform::new(
            config.linux.clone(),
        ))),
        #[cfg(not(target_os = "linux"))]
        "linux" => Err(AppError::Validation(
            "platform backend 'linux' is only available on Linux".to_string(),
        )),
        other => Err(AppError::Validation(format!(
            "Invalid platform backend '{}'",
            other
        ))),
    }
}

/// Board plus the sensors built on it.
pub struct Session {
    config: AppConfig,
    board: Board,
    components: Vec<SensorComponents>,
}

impl Session {
    /// Validate `config`, open the board and build every enabled sensor.
    pub async fn start(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        let board = open_board(&config)?;
        Self::with_board(config, board).await
    }

    /// Build the enabled sensors on an already open board.
    ///
    /// The first sensor that fails to build aborts the session; proxies
    /// built before it are dropped and their claims released.
    pub async fn with_board(config: AppConfig, board: Board) -> AppResult<Self> {
        let registry = DriverRegistry::with_defaults();
        let mut components = Vec::new();

        for entry in config.enabled_sensors() {
            let spec = entry.spec()?;
            let built = registry.build(&board, spec).await.inspect_err(|e| {
                warn!(sensor = %entry.id, driver = %entry.driver, error = %e, "Sensor failed to start");
            })?;
            components.push(built);
        }

        info!(
            platform = board.platform_name(),
            sensors = components.len(),
            claimed = board.claimed().len(),
            "Session started"
        );

        Ok(Self {
            config,
            board,
            components,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn components(&self) -> &[SensorComponents] {
        &self.components
    }

    /// Every readable sensor, in configuration order.
    pub fn sensors(&self) -> Vec<Arc<dyn Sensor>> {
        self.components.iter().map(|c| Arc::clone(&c.sensor)).collect()
    }

    /// Sensor by id.
    pub fn sensor(&self, id: &str) -> Option<Arc<dyn Sensor>> {
        self.components
            .iter()
            .find(|c| c.id() == id)
            .map(|c| Arc::clone(&c.sensor))
    }

    /// Switchable outputs by id.
    pub fn switches(&self) -> Vec<(String, Arc<dyn Switchable>)> {
        self.components
            .iter()
            .filter_map(|c| c.switch.as_ref().map(|s| (c.id().to_string(), Arc::clone(s))))
            .collect()
    }

    /// Switchable output `id`.
    ///
    /// Fails if no enabled sensor has that id or it cannot be switched.
    pub fn switch(&self, id: &str) -> AppResult<Arc<dyn Switchable>> {
        let component = self
            .components
            .iter()
            .find(|c| c.id() == id)
            .ok_or_else(|| AppError::Validation(format!("No enabled sensor '{}'", id)))?;
        component.switch.as_ref().map(Arc::clone).ok_or_else(|| {
            AppError::Validation(format!(
                "Sensor '{}' ({}) is not switchable",
                id,
                component.sensor.kind()
            ))
        })
    }

    /// Apply `command` to output `id` and return its new state.
    pub async fn command(&self, id: &str, command: SwitchCommand) -> AppResult<bool> {
        let target = self.switch(id)?;
        let on = command.apply(target.as_ref()).await?;
        info!(sensor = %id, %command, on, "Output command applied");
        Ok(on)
    }

    /// Interrupt-driven counters by id.
    pub fn counters(&self) -> Vec<(String, Arc<dyn EventCounter>)> {
        self.components
            .iter()
            .filter_map(|c| c.counter.as_ref().map(|s| (c.id().to_string(), Arc::clone(s))))
            .collect()
    }

    /// Armed interrupt lines by sensor id.
    pub fn interrupt_sources(&self) -> Vec<(String, Arc<dyn InterruptSource>)> {
        self.components
            .iter()
            .filter_map(|c| {
                c.interrupts
                    .as_ref()
                    .map(|s| (c.id().to_string(), Arc::clone(s)))
            })
            .collect()
    }

    /// Route handler failures from every interrupt line into one channel.
    pub fn fault_channel(&self, capacity: usize) -> mpsc::Receiver<CallbackFault> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        for (_, source) in self.interrupt_sources() {
            source.line().set_fault_sink(tx.clone());
        }
        rx
    }

    /// Polling loop over every sensor with the configured settings.
    pub fn polling_loop(&self) -> PollingLoop {
        PollingLoop::new(
            PollingConfig::from(&self.config.acquisition),
            self.sensors(),
        )
    }

    /// Counts of configured bindings per protocol.
    pub fn connection_summary(&self) -> AppResult<ConnectionSummary> {
        let mut summary = ConnectionSummary::default();
        for entry in self.config.enabled_sensors() {
            summary.extend(entry.connections()?.iter());
        }
        Ok(summary)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("board", &self.board)
            .field("components", &self.components)
            .finish()
    }
}

/// One line per configured sensor, then the protocol counts.
pub fn describe_sensors(config: &AppConfig) -> AppResult<String> {
    let mut out = String::new();
    let mut summary = ConnectionSummary::default();

    for entry in &config.sensors {
        let connections = entry.connections()?;
        let state = if entry.enabled { "" } else { " [disabled]" };
        out.push_str(&format!(
            "{} ({}): {}{}\n",
            entry.id, entry.driver, connections, state
        ));
        if entry.enabled {
            summary.extend(connections.iter());
        }
    }
    out.push_str(&summary.to_string());
    Ok(out)
}

#[derive(Serialize)]
struct SensorListing<'a> {
    id: &'a str,
    connection: String,
    enabled: bool,
    driver: DriverDescriptor,
}

/// Every configured sensor with its driver's descriptor, as pretty JSON.
pub fn describe_sensors_json(config: &AppConfig) -> AppResult<String> {
    let registry = DriverRegistry::with_defaults();
    let listings = config
        .sensors
        .iter()
        .map(|entry| -> AppResult<SensorListing<'_>> {
            let driver = registry
                .get(&entry.driver)
                .map(|f| f.descriptor())
                .ok_or_else(|| {
                    AppError::Validation(format!(
                        "sensor '{}': unknown driver '{}'",
                        entry.id, entry.driver
                    ))
                })?;
            Ok(SensorListing {
                id: &entry.id,
                connection: entry.connections()?.to_string(),
                enabled: entry.enabled,
                driver,
            })
        })
        .collect::<AppResult<Vec<_>>>()?;
    Ok(serde_json::to_string_pretty(&listings)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorEntry;

    fn entry(id: &str, driver: &str, connection: &str) -> SensorEntry {
        SensorEntry {
            id: id.to_string(),
            driver: driver.to_string(),
            connection: connection.to_string(),
            enabled: true,
            options: toml::Value::Table(toml::map::Map::new()),
        }
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut config = AppConfig::default();
        config.platform.backend = "mraa".to_string();
        assert!(matches!(open_board(&config), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_missing_library_is_startup_error() {
        let mut config = AppConfig::default();
        config.platform.native_libraries = vec!["libdoes-not-exist.so.9".to_string()];
        let err = open_board(&config).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_describe_sensors() {
        let mut config = AppConfig::default();
        config.sensors.push(entry("soil", "analog", "a:0"));
        let mut flow = entry("flow", "pulse_counter", "g:22:rising");
        flow.enabled = false;
        config.sensors.push(flow);

        let text = describe_sensors(&config).unwrap();
        assert!(text.starts_with("soil (analog): a:0\n"), "got {:?}", text);
        assert!(text.contains("flow (pulse_counter): "));
        assert!(text.contains("[disabled]"));
    }

    #[test]
    fn test_describe_sensors_json() {
        let mut config = AppConfig::default();
        config.sensors.push(entry("pot", "analog", "a:0"));
        let mut relay = entry("relay", "digital_output", "g:17:out");
        relay.enabled = false;
        config.sensors.push(relay);

        let json: serde_json::Value =
            serde_json::from_str(&describe_sensors_json(&config).unwrap()).unwrap();
        let sensors = json.as_array().unwrap();
        assert_eq!(sensors.len(), 2);
        assert_eq!(sensors[0]["id"], "pot");
        assert_eq!(sensors[0]["connection"], "a:0");
        assert_eq!(sensors[0]["driver"]["name"], "Analog Input");
        assert_eq!(sensors[0]["driver"]["commands"], serde_json::json!([]));
        assert_eq!(sensors[1]["enabled"], false);
        assert_eq!(
            sensors[1]["driver"]["commands"],
            serde_json::json!(["on", "off", "toggle"])
        );
    }

    #[test]
    fn test_describe_sensors_json_unknown_driver() {
        let mut config = AppConfig::default();
        config.sensors.push(entry("tc", "thermocouple", "a:0"));
        let err = describe_sensors_json(&config).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("thermocouple"));
    }
}
