//! Line-oriented serial sensors (GPS receivers, serial sensor modules).
//!
//! Each read returns the next complete line. With `nmea_checksum` set,
//! `$...*HH` sentences with a bad checksum are rejected as transient
//! failures, like a corrupted bus transfer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use sensorbus_core::{Capability, Reading, Result, Sensor, SensorError};
use sensorbus_hal::{Board, Uart};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::factory::{blocking, DriverFactory, SensorComponents, SensorSpec};

// =============================================================================
// Configuration Types
// =============================================================================

/// Options for `uart_lines`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UartLinesConfig {
    /// How long one read waits for a full line (default: 1000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Validate `$...*HH` NMEA checksums
    #[serde(default)]
    pub nmea_checksum: bool,

    /// Only return lines starting with this prefix (e.g. "$GPGGA")
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_timeout_ms() -> u64 {
    1000
}

impl Default for UartLinesConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            nmea_checksum: false,
            prefix: None,
        }
    }
}

/// Check the `*HH` checksum of an NMEA sentence.
///
/// The checksum is the XOR of every byte between `$` and `*`. Lines
/// without a `$` start or a two-digit hex checksum fail.
pub fn nmea_checksum_ok(line: &str) -> bool {
    let Some(body) = line.strip_prefix('$') else {
        return false;
    };
    let Some((payload, checksum)) = body.rsplit_once('*') else {
        return false;
    };
    let checksum = checksum.trim_end();
    if checksum.len() != 2 {
        return false;
    }
    match u8::from_str_radix(checksum, 16) {
        Ok(expected) => payload.bytes().fold(0u8, |acc, b| acc ^ b) == expected,
        Err(_) => false,
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Reads one text line per sample from a serial port.
pub struct UartLines {
    id: String,
    uart: Arc<Uart>,
    config: UartLinesConfig,
}

impl UartLines {
    pub fn new(id: &str, uart: Uart, config: UartLinesConfig) -> Result<Self> {
        if config.timeout_ms == 0 {
            return Err(SensorError::config(format!(
                "sensor '{}': timeout_ms must be greater than 0",
                id
            )));
        }
        Ok(Self {
            id: id.to_string(),
            uart: Arc::new(uart),
            config,
        })
    }

    pub fn uart(&self) -> &Uart {
        &self.uart
    }

    fn next_line(id: &str, uart: &Uart, config: &UartLinesConfig) -> Result<String> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(line) = uart.read_line(remaining)? else {
                return Err(SensorError::transient(
                    uart.port(),
                    format!("no line within {} ms", config.timeout_ms),
                ));
            };

            if let Some(prefix) = &config.prefix {
                if !line.starts_with(prefix.as_str()) {
                    trace!(sensor = id, %line, "Skipping line without prefix");
                    continue;
                }
            }
            if config.nmea_checksum && !nmea_checksum_ok(&line) {
                debug!(sensor = id, %line, "NMEA checksum mismatch");
                return Err(SensorError::transient(
                    uart.port(),
                    format!("bad NMEA checksum: {}", line),
                ));
            }
            return Ok(line);
        }
    }
}

#[async_trait]
impl Sensor for UartLines {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "uart_lines"
    }

    async fn read(&self) -> Result<Reading> {
        let uart = self.uart.clone();
        let config = self.config.clone();
        let id = self.id.clone();
        let line = blocking(&self.id, move || Self::next_line(&id, &uart, &config)).await?;
        Ok(Reading::Text { line })
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Factory for `uart_lines`.
pub struct UartLinesFactory;

static CAPABILITIES: &[Capability] = &[Capability::Readable];

impl DriverFactory for UartLinesFactory {
    fn driver_type(&self) -> &'static str {
        "uart_lines"
    }

    fn name(&self) -> &'static str {
        "UART Line Sensor"
    }

    fn description(&self) -> &'static str {
        "Newline-terminated text records from a serial port"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn validate(&self, spec: &SensorSpec) -> Result<()> {
        spec.connection("UART")?;
        let cfg: UartLinesConfig = spec.options()?;
        if cfg.timeout_ms == 0 {
            return Err(SensorError::config(format!(
                "sensor '{}': timeout_ms must be greater than 0",
                spec.id
            )));
        }
        Ok(())
    }

    fn build(&self, board: Board, spec: SensorSpec) -> BoxFuture<'static, Result<SensorComponents>> {
        Box::pin(async move {
            let cfg: UartLinesConfig = spec.options()?;
            let connection = spec.connection("UART")?.clone();

            let device = blocking(&spec.id, move || board.open(&connection, None)).await?;
            let driver = UartLines::new(&spec.id, device.into_uart()?, cfg)?;
            Ok(SensorComponents::new(Arc::new(driver)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nmea_checksum() {
        assert!(nmea_checksum_ok(
            "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47"
        ));
        assert!(nmea_checksum_ok("$GPTXT,01,01,02,ANTSTATUS=OK*3b"));
        assert!(!nmea_checksum_ok(
            "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*48"
        ));
        assert!(!nmea_checksum_ok("GPGGA,123519*47"));
        assert!(!nmea_checksum_ok("$GPGGA,123519"));
        assert!(!nmea_checksum_ok("$GPGGA,123519*4"));
    }

    #[test]
    fn test_defaults() {
        let cfg: UartLinesConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.timeout_ms, 1000);
        assert!(!cfg.nmea_checksum);
        assert!(cfg.prefix.is_none());
    }
}
