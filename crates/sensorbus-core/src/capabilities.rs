//! Capability traits for sensors and actuators.
//!
//! Devices implement the capabilities they actually support:
//!
//! - a thermistor or an accelerometer implements [`Sensor`]
//! - a relay implements [`Sensor`] + [`Switchable`]
//! - a flow meter or button counter implements [`Sensor`] + [`EventCounter`]
//!
//! Async traits are `Send + Sync` and use [`crate::Result`].

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SensorError};
use crate::reading::Reading;

/// Capabilities a driver can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Produces readings
    /// Corresponds to [`Sensor`]
    Readable,

    /// Can be switched on and off
    /// Corresponds to [`Switchable`]
    Switchable,

    /// Counts interrupt-driven events
    /// Corresponds to [`EventCounter`]
    Counting,
}

/// A device that produces readings.
#[async_trait]
pub trait Sensor: Send + Sync {
    /// Identifier assigned in configuration.
    fn id(&self) -> &str;

    /// Driver type that built this sensor.
    fn kind(&self) -> &'static str;

    /// Take one reading.
    ///
    /// Transient bus failures come back as `SensorError::TransientIo` and
    /// the caller decides whether to skip the sample.
    async fn read(&self) -> Result<Reading>;
}

/// An actuator with an on/off state.
#[async_trait]
pub trait Switchable: Send + Sync {
    /// Drive the output.
    async fn set(&self, on: bool) -> Result<()>;

    /// Last commanded state.
    async fn is_on(&self) -> Result<bool>;

    async fn turn_on(&self) -> Result<()> {
        self.set(true).await
    }

    async fn turn_off(&self) -> Result<()> {
        self.set(false).await
    }

    /// Invert the output and return the new state.
    async fn toggle(&self) -> Result<bool> {
        let next = !self.is_on().await?;
        self.set(next).await?;
        Ok(next)
    }
}

/// Command accepted by a [`Switchable`] output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchCommand {
    On,
    Off,
    Toggle,
}

impl SwitchCommand {
    /// Every command, in listing order.
    pub const ALL: &'static [SwitchCommand] =
        &[SwitchCommand::On, SwitchCommand::Off, SwitchCommand::Toggle];

    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchCommand::On => "on",
            SwitchCommand::Off => "off",
            SwitchCommand::Toggle => "toggle",
        }
    }

    /// Run the command against `target` and return the resulting state.
    pub async fn apply(self, target: &dyn Switchable) -> Result<bool> {
        match self {
            SwitchCommand::On => target.set(true).await.map(|()| true),
            SwitchCommand::Off => target.set(false).await.map(|()| false),
            SwitchCommand::Toggle => target.toggle().await,
        }
    }
}

impl fmt::Display for SwitchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwitchCommand {
    type Err = SensorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "1" | "true" | "high" => Ok(SwitchCommand::On),
            "off" | "0" | "false" | "low" => Ok(SwitchCommand::Off),
            "toggle" => Ok(SwitchCommand::Toggle),
            other => Err(SensorError::config(format!(
                "Invalid switch command '{}'. Use on, off or toggle",
                other
            ))),
        }
    }
}

/// Interrupt-driven event counter.
///
/// Counting happens on the interrupt dispatcher, so these calls never
/// touch the bus.
pub trait EventCounter: Send + Sync {
    /// Events counted since construction or the last reset.
    fn count(&self) -> u64;

    /// Reset to zero and return the previous count.
    fn reset(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Lamp(AtomicBool);

    #[async_trait]
    impl Switchable for Lamp {
        async fn set(&self, on: bool) -> Result<()> {
            self.0.store(on, Ordering::SeqCst);
            Ok(())
        }

        async fn is_on(&self) -> Result<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn test_switchable_defaults() {
        let lamp = Lamp(AtomicBool::new(false));
        lamp.turn_on().await.unwrap();
        assert!(lamp.is_on().await.unwrap());
        assert!(!lamp.toggle().await.unwrap());
        assert!(!lamp.is_on().await.unwrap());
        lamp.turn_off().await.unwrap();
        assert!(!lamp.is_on().await.unwrap());
    }

    #[tokio::test]
    async fn test_switch_command_apply() {
        let lamp = Lamp(AtomicBool::new(false));
        assert!(SwitchCommand::On.apply(&lamp).await.unwrap());
        assert!(lamp.is_on().await.unwrap());
        assert!(!SwitchCommand::Toggle.apply(&lamp).await.unwrap());
        assert!(SwitchCommand::Toggle.apply(&lamp).await.unwrap());
        assert!(!SwitchCommand::Off.apply(&lamp).await.unwrap());
        assert!(!lamp.is_on().await.unwrap());
    }

    #[test]
    fn test_switch_command_parse() {
        assert_eq!("ON".parse::<SwitchCommand>().unwrap(), SwitchCommand::On);
        assert_eq!("0".parse::<SwitchCommand>().unwrap(), SwitchCommand::Off);
        assert_eq!(" toggle ".parse::<SwitchCommand>().unwrap(), SwitchCommand::Toggle);
        let err = "dim".parse::<SwitchCommand>().unwrap_err();
        assert!(err.to_string().contains("dim"));
        assert_eq!(SwitchCommand::Off.to_string(), "off");
    }
}
