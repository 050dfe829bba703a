//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `SENSORBUS_`
//!
//! Nested keys are separated by a double underscore, so
//! `SENSORBUS_APPLICATION__LOG_LEVEL=debug` overrides
//! `[application] log_level`.
//!
//! # Example
//! ```no_run
//! use sensorbus::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/sensorbus.toml")?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), sensorbus::error::AppError>(())
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use sensorbus_core::ConnectionString;
use sensorbus_drivers::{DriverRegistry, SensorSpec};
use sensorbus_hal::{InterruptConfig, LinuxConfig};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/sensorbus.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SENSORBUS_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Platform backend settings
    #[serde(default)]
    pub platform: PlatformConfig,
    /// Polling loop settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Interrupt queue settings applied to every GPIO line
    #[serde(default)]
    pub interrupts: InterruptConfig,
    /// Sample recording
    #[serde(default)]
    pub recording: RecordingConfig,
    /// Sensor definitions
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Platform backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Backend name (sim, linux)
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Shared libraries loaded before the platform opens
    #[serde(default)]
    pub native_libraries: Vec<String>,
    /// ADC resolution of the simulated platform
    #[serde(default = "default_sim_adc_bits")]
    pub sim_adc_bits: u8,
    /// Kernel interface paths for the linux backend
    #[serde(default)]
    pub linux: LinuxConfig,
}

/// Polling loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Time between polling rounds in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Stop after this many rounds (unset = until shutdown)
    #[serde(default)]
    pub max_samples: Option<u64>,
    /// Transient failures in a row that make a sensor's errors fatal
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

/// Recording configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Append samples to this CSV file
    #[serde(default)]
    pub csv_path: Option<PathBuf>,
}

/// Sensor definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorEntry {
    /// Unique sensor identifier
    pub id: String,
    /// Driver type (e.g., "analog", "pulse_counter")
    pub driver: String,
    /// Connection string (e.g., "i:1:0x48")
    pub connection: String,
    /// Whether this sensor is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific options (dynamic)
    #[serde(default = "empty_table")]
    pub options: toml::Value,
}

// Default value functions
fn default_name() -> String {
    "sensorbus".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_backend() -> String {
    "sim".to_string()
}

fn default_sim_adc_bits() -> u8 {
    10
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            native_libraries: Vec::new(),
            sim_adc_bits: default_sim_adc_bits(),
            linux: LinuxConfig::default(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_samples: None,
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];
const VALID_BACKENDS: [&str; 2] = ["sim", "linux"];

impl AppConfig {
    /// Load configuration from the default path and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error: defaults and environment variables
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The provider stack: defaults, then the file, then the environment.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(AppError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            )));
        }

        let format = self.application.log_format.to_lowercase();
        if !VALID_FORMATS.contains(&format.as_str()) {
            return Err(AppError::Validation(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                VALID_FORMATS.join(", ")
            )));
        }

        if !VALID_BACKENDS.contains(&self.platform.backend.as_str()) {
            return Err(AppError::Validation(format!(
                "Invalid platform backend '{}'. Must be one of: {}",
                self.platform.backend,
                VALID_BACKENDS.join(", ")
            )));
        }

        if self.acquisition.interval_ms == 0 {
            return Err(AppError::Validation(
                "acquisition.interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.acquisition.max_consecutive_failures == 0 {
            return Err(AppError::Validation(
                "acquisition.max_consecutive_failures must be greater than 0".to_string(),
            ));
        }

        if self.interrupts.queue_capacity == 0 {
            return Err(AppError::Validation(
                "interrupts.queue_capacity must be greater than 0".to_string(),
            ));
        }

        // Sensor IDs must be unique
        let mut ids = HashSet::new();
        for sensor in &self.sensors {
            if !ids.insert(&sensor.id) {
                return Err(AppError::Validation(format!(
                    "Duplicate sensor ID: {}",
                    sensor.id
                )));
            }
        }

        // Connections parse and drivers accept them
        let registry = DriverRegistry::with_defaults();
        for sensor in &self.sensors {
            registry.validate(&sensor.spec()?)?;
        }

        Ok(())
    }

    /// Enabled sensors, in configuration order.
    pub fn enabled_sensors(&self) -> Vec<&SensorEntry> {
        self.sensors.iter().filter(|s| s.enabled).collect()
    }

    /// Sensor by id.
    pub fn sensor(&self, id: &str) -> Option<&SensorEntry> {
        self.sensors.iter().find(|s| s.id == id)
    }
}

impl SensorEntry {
    /// Parsed connection string.
    pub fn connections(&self) -> AppResult<ConnectionString> {
        ConnectionString::parse(&self.connection).map_err(|e| {
            AppError::Validation(format!("sensor '{}': {}", self.id, e))
        })
    }

    /// Spec handed to the driver factory.
    pub fn spec(&self) -> AppResult<SensorSpec> {
        Ok(
            SensorSpec::new(self.id.clone(), self.driver.clone(), self.connections()?)
                .with_options(self.options.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[application]
name = "greenhouse"
log_level = "debug"

[acquisition]
interval_ms = 250
max_samples = 10

[interrupts]
queue_capacity = 16
overflow = "drop_newest"

[[sensors]]
id = "soil"
driver = "analog"
connection = "a:0"
options = { scale = 100.0, unit = "%" }

[[sensors]]
id = "flow"
driver = "pulse_counter"
connection = "g:22:rising"
enabled = false
"#;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(SAMPLE);
        let config = AppConfig::load_from(file.path()).unwrap();

        assert_eq!(config.application.name, "greenhouse");
        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.acquisition.interval_ms, 250);
        assert_eq!(config.acquisition.max_samples, Some(10));
        assert_eq!(config.acquisition.max_consecutive_failures, 3);
        assert_eq!(config.interrupts.queue_capacity, 16);
        assert_eq!(
            config.interrupts.overflow,
            sensorbus_hal::OverflowPolicy::DropNewest
        );
        assert_eq!(config.platform.backend, "sim");
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.enabled_sensors().len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.acquisition.interval_ms, 1000);
        assert!(config.sensors.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config(SAMPLE);
        std::env::set_var("SENSORBUS_APPLICATION__LOG_LEVEL", "warn");
        std::env::set_var("SENSORBUS_ACQUISITION__INTERVAL_MS", "50");
        let result = AppConfig::load_from(file.path());
        std::env::remove_var("SENSORBUS_APPLICATION__LOG_LEVEL");
        std::env::remove_var("SENSORBUS_ACQUISITION__INTERVAL_MS");

        let config = result.unwrap();
        assert_eq!(config.application.log_level, "warn");
        assert_eq!(config.acquisition.interval_ms, 50);
        assert_eq!(config.application.name, "greenhouse");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.platform.backend = "arduino".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.acquisition.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.interrupts.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    fn entry(id: &str, driver: &str, connection: &str) -> SensorEntry {
        SensorEntry {
            id: id.into(),
            driver: driver.into(),
            connection: connection.into(),
            enabled: true,
            options: empty_table(),
        }
    }

    #[test]
    fn test_duplicate_sensor_ids() {
        let config = AppConfig {
            sensors: vec![entry("a", "analog", "a:0"), entry("a", "analog", "a:1")],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate sensor ID"));
    }

    #[test]
    fn test_bad_connection_and_unknown_driver() {
        let config = AppConfig {
            sensors: vec![entry("a", "analog", "x:0")],
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().exit_code(), 2);

        let config = AppConfig {
            sensors: vec![entry("a", "thermocouple", "a:0")],
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("thermocouple"));
    }
}
