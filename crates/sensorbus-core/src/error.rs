//! Error taxonomy shared by every sensorbus layer.
//!
//! All failures fall into one of five kinds, and every layer propagates the
//! same [`SensorError`]:
//!
//! - **`LibraryLoad`**: a native library or platform root could not be loaded.
//!   Always fatal at startup.
//! - **`Configuration`**: a connection string, option value or resource claim
//!   is wrong. Retrying cannot fix it.
//! - **`TransientIo`**: the bus hiccuped (interrupted call, timeout, NACK).
//!   The next attempt may succeed.
//! - **`FatalIo`**: the device or bus is gone or refuses access.
//! - **`CallbackFault`**: a user interrupt handler returned an error or
//!   panicked. Reported, never propagated into the producer.
//!
//! OS errors are classified in exactly one place, [`SensorError::from_io`].

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type alias for sensorbus operations.
pub type Result<T> = std::result::Result<T, SensorError>;

/// Errors that can occur when working with sensors and buses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    /// A native library or platform root is unavailable
    #[error("Failed to load native library '{library}': {reason}")]
    LibraryLoad { library: String, reason: String },

    /// Invalid configuration, connection string or resource claim
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    /// Retryable bus or device error
    #[error("Transient I/O error on {resource}: {message}")]
    TransientIo { resource: String, message: String },

    /// Non-retryable bus or device error
    #[error("I/O failure on {resource}: {message}")]
    FatalIo { resource: String, message: String },

    /// An interrupt handler failed
    #[error("Handler {handler} on {line} faulted: {message}")]
    CallbackFault {
        line: String,
        handler: u64,
        message: String,
    },
}

/// Coarse classification of a [`SensorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    LibraryLoad,
    Configuration,
    TransientIo,
    FatalIo,
    CallbackFault,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::LibraryLoad => "library_load",
            ErrorKind::Configuration => "configuration",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::FatalIo => "fatal_io",
            ErrorKind::CallbackFault => "callback_fault",
        };
        write!(f, "{}", label)
    }
}

impl SensorError {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for a transient I/O error.
    pub fn transient(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientIo {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a fatal I/O error.
    pub fn fatal(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FatalIo {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a library load error.
    pub fn library(library: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LibraryLoad {
            library: library.into(),
            reason: reason.into(),
        }
    }

    /// Build an error of the given kind.
    ///
    /// Used by fault injection and by platforms that report a kind without
    /// an OS error behind it.
    pub fn of_kind(kind: ErrorKind, resource: impl Into<String>, message: impl Into<String>) -> Self {
        let resource = resource.into();
        let message = message.into();
        match kind {
            ErrorKind::LibraryLoad => Self::LibraryLoad {
                library: resource,
                reason: message,
            },
            ErrorKind::Configuration => Self::Configuration {
                message: format!("{}: {}", resource, message),
            },
            ErrorKind::TransientIo => Self::TransientIo { resource, message },
            ErrorKind::FatalIo => Self::FatalIo { resource, message },
            ErrorKind::CallbackFault => Self::CallbackFault {
                line: resource,
                handler: 0,
                message,
            },
        }
    }

    /// Classify an OS error raised while talking to `resource`.
    ///
    /// Interrupted calls, would-block and timeouts are transient. A missing
    /// or inaccessible device node is a configuration problem. Everything
    /// else is fatal.
    pub fn from_io(resource: impl Into<String>, err: &io::Error) -> Self {
        let resource = resource.into();
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                Self::TransientIo {
                    resource,
                    message: err.to_string(),
                }
            }
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => Self::Configuration {
                message: format!("{}: {}", resource, err),
            },
            _ => match err.raw_os_error() {
                // EAGAIN / EBUSY / ENXIO (I2C NACK) / EREMOTEIO (SMBus NACK)
                Some(11) | Some(16) | Some(6) | Some(121) => Self::TransientIo {
                    resource,
                    message: err.to_string(),
                },
                _ => Self::FatalIo {
                    resource,
                    message: err.to_string(),
                },
            },
        }
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LibraryLoad { .. } => ErrorKind::LibraryLoad,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::TransientIo { .. } => ErrorKind::TransientIo,
            Self::FatalIo { .. } => ErrorKind::FatalIo,
            Self::CallbackFault { .. } => ErrorKind::CallbackFault,
        }
    }

    /// Check if a retry might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }

    /// Check if this error must stop acquisition.
    ///
    /// Callback faults are not fatal; they are reported through the
    /// interrupt line's fault sink instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TransientIo { .. } | Self::CallbackFault { .. })
    }
}
