//! Vendor shared libraries loaded at startup.
//!
//! Libraries listed in configuration are opened before any bus is touched
//! and held for the lifetime of the [`crate::Board`]. A library that fails
//! to load is a [`SensorError::LibraryLoad`].

use std::fmt;
use std::path::Path;

use libloading::Library;
use sensorbus_core::{Result, SensorError};
use tracing::{debug, info};

/// An open shared library.
pub struct NativeLibrary {
    name: String,
    library: Library,
}

impl NativeLibrary {
    /// Open a library by path or by soname (`libmraa.so.2`).
    pub fn load(name: &str) -> Result<Self> {
        debug!(library = name, "Loading native library");

        #[allow(unsafe_code)]
        let library = unsafe {
            Library::new(Path::new(name)).map_err(|e| SensorError::library(name, e.to_string()))?
        };

        info!(library = name, "Loaded native library");
        Ok(Self {
            name: name.to_string(),
            library,
        })
    }

    /// Open every library in `names`, failing on the first that cannot load.
    pub fn load_all<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>> {
        names.iter().map(|n| Self::load(n.as_ref())).collect()
    }

    /// Name the library was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether the library exports `symbol`.
    pub fn has_symbol(&self, symbol: &str) -> bool {
        #[allow(unsafe_code)]
        let found = unsafe { self.library.get::<*const ()>(symbol.as_bytes()).is_ok() };
        found
    }
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLibrary").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorbus_core::ErrorKind;

    #[test]
    fn test_missing_library_is_library_load_error() {
        let err = NativeLibrary::load("/nonexistent/libsensorbus-missing.so").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LibraryLoad);
        assert!(err.to_string().contains("libsensorbus-missing"));
    }

    #[test]
    fn test_load_all_stops_at_first_failure() {
        let result = NativeLibrary::load_all(&["/nonexistent/liba.so", "/nonexistent/libb.so"]);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("liba.so"));
    }

    #[test]
    fn test_load_all_empty() {
        let libs = NativeLibrary::load_all::<&str>(&[]).unwrap();
        assert!(libs.is_empty());
    }
}
