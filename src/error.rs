//! Application error type.
//!
//! `AppError` wraps the sensor taxonomy from `sensorbus-core` together
//! with the failures that only exist at the application level: loading
//! and validating configuration, installing the log subscriber and
//! writing recordings.
//!
//! [`AppError::exit_code`] maps every error to the process exit code:
//! `2` for anything that stops startup (configuration, library load),
//! `1` for failures while running.

use sensorbus_core::{ErrorKind, SensorError};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::Config(Box::new(err))
    }
}

impl AppError {
    /// Whether the error prevents the application from starting.
    pub fn is_startup(&self) -> bool {
        match self {
            AppError::Config(_)
            | AppError::Validation(_)
            | AppError::Logging(_)
            | AppError::FeatureNotEnabled(_) => true,
            AppError::Sensor(e) => matches!(
                e.kind(),
                ErrorKind::Configuration | ErrorKind::LibraryLoad
            ),
            AppError::Storage(_) | AppError::Io(_) | AppError::Serialization(_) => false,
        }
    }

    /// Process exit code: 2 for startup failures, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_startup() {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(AppError::Validation("bad".into()).exit_code(), 2);
        assert_eq!(
            AppError::from(SensorError::library("libfoo.so", "not found")).exit_code(),
            2
        );
        assert_eq!(
            AppError::from(SensorError::config("pin claimed")).exit_code(),
            2
        );
        assert_eq!(
            AppError::from(SensorError::fatal("gpio3", "device vanished")).exit_code(),
            1
        );
        assert_eq!(AppError::Storage("disk full".into()).exit_code(), 1);
    }

    #[test]
    fn test_sensor_error_is_transparent() {
        let err = AppError::from(SensorError::fatal("i2c-1@0x48", "EIO"));
        assert_eq!(err.to_string(), SensorError::fatal("i2c-1@0x48", "EIO").to_string());
    }
}
