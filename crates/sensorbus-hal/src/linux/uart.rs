//! Serial ports via `serialport`.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use sensorbus_core::{Result, SensorError};
use serialport::SerialPort;
use tracing::debug;

use crate::platform::UartBackend;

const AVAILABLE_POLL: Duration = Duration::from_millis(1);

pub(super) struct SerialUart {
    port: Box<dyn SerialPort>,
    name: String,
}

fn map_serial_error(name: &str, err: serialport::Error) -> SensorError {
    match err.kind() {
        serialport::ErrorKind::NoDevice | serialport::ErrorKind::InvalidInput => {
            SensorError::config(format!("{}: {}", name, err))
        }
        serialport::ErrorKind::Io(kind) => SensorError::from_io(name, &io::Error::new(kind, err.description)),
        serialport::ErrorKind::Unknown => SensorError::fatal(name, err.to_string()),
    }
}

impl SerialUart {
    pub(super) fn open(name: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(name, baud)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| map_serial_error(name, e))?;
        debug!(port = name, baud, "Opened serial port");
        Ok(Self {
            port,
            name: name.to_string(),
        })
    }
}

impl UartBackend for SerialUart {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.port
            .write_all(data)
            .and_then(|()| self.port.flush())
            .map_err(|e| SensorError::from_io(&self.name, &e))?;
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| map_serial_error(&self.name, e))?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(SensorError::from_io(&self.name, &e)),
        }
    }

    fn data_available(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let waiting = self
                .port
                .bytes_to_read()
                .map_err(|e| map_serial_error(&self.name, e))?;
            if waiting > 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(AVAILABLE_POLL);
        }
    }
}
