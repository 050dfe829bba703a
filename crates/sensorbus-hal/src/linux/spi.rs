//! spidev (`/dev/spidevB.C`).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use sensorbus_core::{Result, SensorError};
use tracing::debug;

use crate::platform::{Resource, SpiBackend};

// Request codes from `linux/spi/spidev.h` (_IOW('k', nr, size)).
const SPI_IOC_WR_MODE: libc::c_ulong = 0x4001_6b01;
const SPI_IOC_WR_MAX_SPEED_HZ: libc::c_ulong = 0x4004_6b04;
const SPI_IOC_MESSAGE_1: libc::c_ulong = 0x4020_6b00;

/// `struct spi_ioc_transfer`.
#[repr(C)]
#[derive(Default)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

pub(super) struct SpiDev {
    file: File,
    label: String,
    speed_hz: u32,
}

impl SpiDev {
    pub(super) fn open(dev_root: &Path, bus: u32, chip_select: u32) -> Result<Self> {
        let label = Resource::Spi { bus, chip_select }.to_string();
        let path = dev_root.join(format!("spidev{}.{}", bus, chip_select));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| SensorError::from_io(&label, &e))?;
        debug!(bus, chip_select, path = %path.display(), "Opened SPI device");
        Ok(Self {
            file,
            label,
            speed_hz: 0,
        })
    }

    fn check(&self, rc: libc::c_int) -> Result<()> {
        if rc < 0 {
            Err(SensorError::from_io(&self.label, &io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }
}

impl SpiBackend for SpiDev {
    fn configure(&mut self, mode: u8, frequency_hz: Option<u32>) -> Result<()> {
        let fd = self.file.as_raw_fd();
        #[allow(unsafe_code)]
        let rc = unsafe { libc::ioctl(fd, SPI_IOC_WR_MODE as _, &mode as *const u8) };
        self.check(rc)?;

        if let Some(hz) = frequency_hz {
            #[allow(unsafe_code)]
            let rc = unsafe { libc::ioctl(fd, SPI_IOC_WR_MAX_SPEED_HZ as _, &hz as *const u32) };
            self.check(rc)?;
            self.speed_hz = hz;
        }
        Ok(())
    }

    fn transfer(&mut self, tx: &[u8]) -> Result<Vec<u8>> {
        let mut rx = vec![0u8; tx.len()];
        let len = u32::try_from(tx.len())
            .map_err(|_| SensorError::config(format!("{}: transfer too large", self.label)))?;
        let xfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len,
            speed_hz: self.speed_hz,
            bits_per_word: 8,
            ..Default::default()
        };

        #[allow(unsafe_code)]
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                SPI_IOC_MESSAGE_1 as _,
                &xfer as *const SpiIocTransfer,
            )
        };
        self.check(rc)?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_struct_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<SpiIocTransfer>(), 32);
    }
}
