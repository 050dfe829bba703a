//! IIO ADC channels (`in_voltage<N>_raw`).

use std::fs;
use std::path::{Path, PathBuf};

use sensorbus_core::{Result, SensorError};
use tracing::debug;

use crate::platform::{AnalogBackend, Resource};

pub(super) struct IioAnalog {
    path: PathBuf,
    label: String,
    bits: u8,
}

impl IioAnalog {
    pub(super) fn open(device: &Path, pin: u32, bits: u8) -> Result<Self> {
        let label = Resource::Analog(pin).to_string();
        let path = device.join(format!("in_voltage{}_raw", pin));
        fs::metadata(&path).map_err(|e| SensorError::from_io(&label, &e))?;
        debug!(pin, path = %path.display(), bits, "Opened IIO channel");
        Ok(Self { path, label, bits })
    }
}

impl AnalogBackend for IioAnalog {
    fn resolution_bits(&self) -> u8 {
        self.bits
    }

    fn read_raw(&mut self) -> Result<u32> {
        let text =
            fs::read_to_string(&self.path).map_err(|e| SensorError::from_io(&self.label, &e))?;
        text.trim().parse::<u32>().map_err(|e| {
            SensorError::transient(&self.label, format!("unreadable value '{}': {}", text.trim(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("in_voltage2_raw"), "2048\n").unwrap();
        let mut adc = IioAnalog::open(dir.path(), 2, 12).unwrap();
        assert_eq!(adc.read_raw().unwrap(), 2048);
        assert_eq!(adc.resolution_bits(), 12);
    }

    #[test]
    fn test_missing_channel() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IioAnalog::open(dir.path(), 5, 12).is_err());
    }
}
