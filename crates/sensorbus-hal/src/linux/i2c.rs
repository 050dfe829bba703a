//! i2c-dev (`/dev/i2c-N`).

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

use sensorbus_core::connection::I2cSpeed;
use sensorbus_core::{Result, SensorError};
use tracing::debug;

use crate::platform::I2cBackend;

/// `I2C_SLAVE` from `linux/i2c-dev.h`.
const I2C_SLAVE: libc::c_ulong = 0x0703;
/// `I2C_RDWR` from `linux/i2c-dev.h`.
const I2C_RDWR: libc::c_ulong = 0x0707;
/// Read flag for an `i2c_msg`.
const I2C_M_RD: u16 = 0x0001;

/// `struct i2c_msg` from `linux/i2c.h`.
#[repr(C)]
#[derive(Debug)]
struct I2cMsg {
    addr: u16,
    flags: u16,
    len: u16,
    buf: *mut u8,
}

/// `struct i2c_rdwr_ioctl_data` from `linux/i2c-dev.h`.
#[repr(C)]
struct I2cRdwrData {
    msgs: *mut I2cMsg,
    nmsgs: u32,
}

/// Write message followed by a read message, sent as one combined
/// transfer with a repeated start between them.
fn combined_messages(address: u16, data: &[u8], buf: &mut [u8]) -> Result<[I2cMsg; 2]> {
    let len = |n: usize| {
        u16::try_from(n).map_err(|_| {
            SensorError::config(format!("I2C transfer of {} bytes exceeds 65535", n))
        })
    };
    Ok([
        I2cMsg {
            addr: address,
            flags: 0,
            len: len(data.len())?,
            // The kernel only reads from write messages
            buf: data.as_ptr() as *mut u8,
        },
        I2cMsg {
            addr: address,
            flags: I2C_M_RD,
            len: len(buf.len())?,
            buf: buf.as_mut_ptr(),
        },
    ])
}

pub(super) struct I2cDev {
    bus: u32,
    file: File,
    label: String,
    address: Option<u16>,
}

impl I2cDev {
    pub(super) fn open(dev_root: &Path, bus: u32) -> Result<Self> {
        let label = format!("i2c-{}", bus);
        let path = dev_root.join(&label);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| SensorError::from_io(&label, &e))?;
        debug!(bus, path = %path.display(), "Opened I2C bus");
        Ok(Self {
            bus,
            file,
            label,
            address: None,
        })
    }
}

impl I2cBackend for I2cDev {
    fn set_address(&mut self, address: u16) -> Result<()> {
        #[allow(unsafe_code)]
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                I2C_SLAVE as _,
                libc::c_ulong::from(address),
            )
        };
        if rc < 0 {
            return Err(SensorError::from_io(
                &self.label,
                &std::io::Error::last_os_error(),
            ));
        }
        self.label = format!("i2c-{}@0x{:02x}", self.bus, address);
        self.address = Some(address);
        Ok(())
    }

    fn set_speed(&mut self, speed: I2cSpeed) -> Result<()> {
        debug!(
            bus = self.bus,
            speed = speed.as_str(),
            "i2c-dev bus speed is fixed by the kernel; ignoring"
        );
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact(buf)
            .map_err(|e| SensorError::from_io(&self.label, &e))
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .map_err(|e| SensorError::from_io(&self.label, &e))
    }

    fn write_read(&mut self, data: &[u8], buf: &mut [u8]) -> Result<()> {
        let address = self.address.ok_or_else(|| {
            SensorError::config(format!("{}: no device address set", self.label))
        })?;
        let mut msgs = combined_messages(address, data, buf)?;
        let mut request = I2cRdwrData {
            msgs: msgs.as_mut_ptr(),
            nmsgs: msgs.len() as u32,
        };

        // msgs and both buffers outlive the call
        #[allow(unsafe_code)]
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                I2C_RDWR as _,
                &mut request as *mut I2cRdwrData,
            )
        };
        if rc < 0 {
            return Err(SensorError::from_io(
                &self.label,
                &std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_messages_layout() {
        let data = [0x05];
        let mut buf = [0u8; 2];
        let msgs = combined_messages(0x18, &data, &mut buf).unwrap();

        assert_eq!((msgs[0].addr, msgs[0].flags, msgs[0].len), (0x18, 0, 1));
        assert_eq!(msgs[0].buf as *const u8, data.as_ptr());
        assert_eq!((msgs[1].addr, msgs[1].flags, msgs[1].len), (0x18, I2C_M_RD, 2));
        assert_eq!(msgs[1].buf, buf.as_mut_ptr());
    }

    #[test]
    fn test_oversized_transfer_is_rejected() {
        let data = vec![0u8; usize::from(u16::MAX) + 1];
        let mut buf = [0u8; 1];
        let err = combined_messages(0x40, &data, &mut buf).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_write_read_requires_address() {
        let file = tempfile::tempfile().unwrap();
        let mut dev = I2cDev {
            bus: 1,
            file,
            label: "i2c-1".to_string(),
            address: None,
        };
        let mut buf = [0u8; 1];
        let err = dev.write_read(&[0x00], &mut buf).unwrap_err();
        assert!(err.to_string().contains("no device address"));
    }
}
