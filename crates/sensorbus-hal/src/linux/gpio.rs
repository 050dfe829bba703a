//! sysfs GPIO (`/sys/class/gpio`).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use sensorbus_core::connection::{Direction, Edge, PullMode};
use sensorbus_core::{Result, SensorError};
use tracing::{debug, error, warn};

use crate::interrupt::{EdgeKind, EdgeSink};
use crate::platform::{GpioBackend, Resource};

/// poll(2) timeout; bounds how long `unwatch` waits for the watcher.
const POLL_TIMEOUT_MS: libc::c_int = 100;

struct Watcher {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub(super) struct SysfsGpio {
    pin: u32,
    root: PathBuf,
    dir: PathBuf,
    label: String,
    exported_here: bool,
    watcher: Option<Watcher>,
}

impl SysfsGpio {
    pub(super) fn open(root: &Path, pin: u32) -> Result<Self> {
        let label = Resource::Gpio(pin).to_string();
        let dir = root.join(format!("gpio{}", pin));
        let mut exported_here = false;

        if !dir.exists() {
            match fs::write(root.join("export"), pin.to_string()) {
                Ok(()) => exported_here = true,
                // EBUSY: exported concurrently by someone else
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {}
                Err(e) => return Err(SensorError::from_io(&label, &e)),
            }
            if !dir.exists() {
                return Err(SensorError::config(format!(
                    "{}: {} did not appear after export",
                    label,
                    dir.display()
                )));
            }
        }

        debug!(pin, path = %dir.display(), exported_here, "Opened sysfs GPIO");
        Ok(Self {
            pin,
            root: root.to_path_buf(),
            dir,
            label,
            exported_here,
            watcher: None,
        })
    }

    fn write_attr(&self, attr: &str, value: &str) -> Result<()> {
        fs::write(self.dir.join(attr), value).map_err(|e| SensorError::from_io(&self.label, &e))
    }

    fn stop_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.running.store(false, Ordering::SeqCst);
            if watcher.handle.join().is_err() {
                error!(pin = self.pin, "Edge watcher panicked");
            }
        }
    }
}

fn read_level(file: &mut File) -> io::Result<bool> {
    let mut buf = [0u8; 4];
    file.seek(SeekFrom::Start(0))?;
    let n = file.read(&mut buf)?;
    Ok(n > 0 && buf[0] == b'1')
}

fn watch_loop(pin: u32, mut file: File, sink: EdgeSink, running: Arc<AtomicBool>) {
    // Initial read clears the pending notification
    if let Err(e) = read_level(&mut file) {
        warn!(pin, error = %e, "Initial GPIO read failed");
    }

    let mut pfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLPRI | libc::POLLERR,
        revents: 0,
    };

    while running.load(Ordering::SeqCst) {
        pfd.revents = 0;
        #[allow(unsafe_code)]
        let rc = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(pin, error = %err, "poll failed, edge watcher stopping");
            break;
        }
        if rc == 0 || pfd.revents & libc::POLLPRI == 0 {
            continue;
        }
        match read_level(&mut file) {
            Ok(level) => {
                sink.deliver(EdgeKind::from_level(level), level);
            }
            Err(e) => warn!(pin, error = %e, "GPIO read after edge failed"),
        }
    }
    debug!(pin, "Edge watcher exiting");
}

impl GpioBackend for SysfsGpio {
    fn set_direction(&mut self, direction: Direction) -> Result<()> {
        self.write_attr("direction", direction.as_str())
    }

    fn set_pull(&mut self, pull: PullMode) -> Result<()> {
        warn!(
            pin = self.pin,
            mode = pull.as_str(),
            "sysfs GPIO cannot set pull mode; configure it in the device tree"
        );
        Ok(())
    }

    fn set_active_low(&mut self, active_low: bool) -> Result<()> {
        self.write_attr("active_low", if active_low { "1" } else { "0" })
    }

    fn read(&mut self) -> Result<bool> {
        let text = fs::read_to_string(self.dir.join("value"))
            .map_err(|e| SensorError::from_io(&self.label, &e))?;
        Ok(text.trim() == "1")
    }

    fn write(&mut self, level: bool) -> Result<()> {
        self.write_attr("value", if level { "1" } else { "0" })
    }

    fn watch_edges(&mut self, edge: Edge, sink: EdgeSink) -> Result<()> {
        self.stop_watcher();
        self.write_attr("edge", edge.as_str())?;

        let file = OpenOptions::new()
            .read(true)
            .open(self.dir.join("value"))
            .map_err(|e| SensorError::from_io(&self.label, &e))?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let pin = self.pin;

        let handle = thread::Builder::new()
            .name(format!("gpio{}-edges", pin))
            .spawn(move || watch_loop(pin, file, sink, flag))
            .map_err(|e| SensorError::from_io(&self.label, &e))?;

        self.watcher = Some(Watcher { running, handle });
        Ok(())
    }

    fn unwatch(&mut self) -> Result<()> {
        if self.watcher.is_none() {
            return Ok(());
        }
        self.stop_watcher();
        self.write_attr("edge", Edge::None.as_str())
    }
}

impl Drop for SysfsGpio {
    fn drop(&mut self) {
        self.stop_watcher();
        if self.exported_here {
            let result = OpenOptions::new()
                .write(true)
                .open(self.root.join("unexport"))
                .and_then(|mut f| f.write_all(self.pin.to_string().as_bytes()));
            if let Err(e) = result {
                warn!(pin = self.pin, error = %e, "Failed to unexport GPIO");
            }
        }
    }
}
