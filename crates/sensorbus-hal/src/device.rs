//! Device proxies.
//!
//! Each proxy is bound to one bus resource for its whole life and holds
//! the board claim on it. Methods take `&self`; the backend sits behind a
//! lock so proxies can be shared across threads and moved into
//! `spawn_blocking`.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sensorbus_core::connection::{Direction, Edge, GpioOptions, InputMode, PullMode};
use sensorbus_core::{Result, SensorError};
use tracing::{debug, info, trace, warn};

use crate::board::Claim;
use crate::interrupt::{
    EdgeHandler, EdgeSubscription, HandlerId, InterruptConfig, InterruptLine, Registration,
};
use crate::platform::{AnalogBackend, GpioBackend, I2cBackend, SpiBackend, UartBackend};

/// Default analog reference voltage.
pub const DEFAULT_AREF: f64 = 5.0;

// ---------------------------------------------------------------------------
// GPIO
// ---------------------------------------------------------------------------

struct GpioState {
    options: GpioOptions,
    watching: Option<Edge>,
}

/// A digital pin, with an interrupt line.
pub struct Gpio {
    pin: u32,
    backend: Mutex<Box<dyn GpioBackend>>,
    state: Mutex<GpioState>,
    line: InterruptLine,
    claim: Claim,
}

impl Gpio {
    pub(crate) fn new(
        pin: u32,
        backend: Box<dyn GpioBackend>,
        claim: Claim,
        interrupts: InterruptConfig,
    ) -> Self {
        let line = InterruptLine::new(claim.resource().to_string(), pin, interrupts);
        Self {
            pin,
            backend: Mutex::new(backend),
            state: Mutex::new(GpioState {
                options: GpioOptions::default(),
                watching: None,
            }),
            line,
            claim,
        }
    }

    pub(crate) fn apply(&self, options: &GpioOptions) -> Result<()> {
        if let Some(direction) = options.direction {
            self.set_direction(direction)?;
        }
        if let Some(pull) = options.pull {
            self.set_pull(pull)?;
        }
        if let Some(mode) = options.input_mode {
            self.set_active_low(mode == InputMode::ActiveLow)?;
        }
        let mut state = self.state.lock();
        if let Some(mode) = options.output_mode {
            debug!(pin = self.pin, mode = mode.as_str(), "Output mode recorded");
            state.options.output_mode = Some(mode);
        }
        if let Some(edge) = options.edge {
            state.options.edge = Some(edge);
        }
        Ok(())
    }

    /// Pin number.
    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// Resource label (`gpio3`).
    pub fn name(&self) -> String {
        self.claim.resource().to_string()
    }

    /// Options applied so far, including the edge from the connection string.
    pub fn options(&self) -> GpioOptions {
        self.state.lock().options
    }

    pub fn set_direction(&self, direction: Direction) -> Result<()> {
        self.backend.lock().set_direction(direction)?;
        self.state.lock().options.direction = Some(direction);
        debug!(pin = self.pin, direction = direction.as_str(), "Set direction");
        Ok(())
    }

    pub fn set_pull(&self, pull: PullMode) -> Result<()> {
        self.backend.lock().set_pull(pull)?;
        self.state.lock().options.pull = Some(pull);
        Ok(())
    }

    pub fn set_active_low(&self, active_low: bool) -> Result<()> {
        self.backend.lock().set_active_low(active_low)?;
        self.state.lock().options.input_mode = Some(if active_low {
            InputMode::ActiveLow
        } else {
            InputMode::ActiveHigh
        });
        Ok(())
    }

    /// Logical level.
    pub fn read(&self) -> Result<bool> {
        let level = self.backend.lock().read()?;
        trace!(pin = self.pin, level, "Read");
        Ok(level)
    }

    /// Drive the pin. Fails on a pin configured as input.
    pub fn write(&self, level: bool) -> Result<()> {
        if self.state.lock().options.direction == Some(Direction::In) {
            return Err(SensorError::config(format!(
                "{} is configured as an input",
                self.name()
            )));
        }
        self.backend.lock().write(level)?;
        trace!(pin = self.pin, level, "Write");
        Ok(())
    }

    /// Invert the pin and return the new level.
    pub fn toggle(&self) -> Result<bool> {
        let next = !self.read()?;
        self.write(next)?;
        Ok(next)
    }

    /// Arm `handler` for `edge` transitions.
    ///
    /// Replaces any handler or subscription armed on this pin.
    pub fn isr<H: EdgeHandler>(&self, edge: Edge, handler: H) -> Result<Registration> {
        self.watch(edge)?;
        self.line.install_handler(handler)
    }

    /// Arm a receiver for `edge` transitions.
    ///
    /// Replaces any handler or subscription armed on this pin.
    pub fn subscribe(&self, edge: Edge) -> Result<EdgeSubscription> {
        self.watch(edge)?;
        Ok(self.line.subscribe())
    }

    /// Stop edge detection and disarm, draining queued events.
    pub fn isr_exit(&self) -> Result<Option<HandlerId>> {
        let was_watching = self.state.lock().watching.take().is_some();
        if was_watching {
            self.backend.lock().unwatch()?;
        }
        Ok(self.line.disarm())
    }

    /// The pin's interrupt line (stats, fault sink, `wait_idle`).
    pub fn interrupts(&self) -> &InterruptLine {
        &self.line
    }

    fn watch(&self, edge: Edge) -> Result<()> {
        if edge == Edge::None {
            return Err(SensorError::config(format!(
                "{}: an interrupt needs an edge other than 'none'",
                self.name()
            )));
        }
        let mut state = self.state.lock();
        if state.watching != Some(edge) {
            self.backend.lock().watch_edges(edge, self.line.sink())?;
            state.watching = Some(edge);
            info!(pin = self.pin, edge = edge.as_str(), "Edge detection enabled");
        }
        Ok(())
    }
}

impl Drop for Gpio {
    fn drop(&mut self) {
        if self.state.get_mut().watching.take().is_some() {
            if let Err(e) = self.backend.get_mut().unwatch() {
                warn!(pin = self.pin, error = %e, "Failed to stop edge detection");
            }
        }
        self.line.disarm();
    }
}

impl fmt::Debug for Gpio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gpio")
            .field("pin", &self.pin)
            .field("options", &self.options())
            .field("line", &self.line)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Analog input
// ---------------------------------------------------------------------------

/// An ADC channel.
pub struct AnalogInput {
    pin: u32,
    bits: u8,
    aref: Mutex<f64>,
    backend: Mutex<Box<dyn AnalogBackend>>,
    claim: Claim,
}

impl AnalogInput {
    pub(crate) fn new(pin: u32, backend: Box<dyn AnalogBackend>, claim: Claim) -> Self {
        let bits = backend.resolution_bits();
        Self {
            pin,
            bits,
            aref: Mutex::new(DEFAULT_AREF),
            backend: Mutex::new(backend),
            claim,
        }
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn name(&self) -> String {
        self.claim.resource().to_string()
    }

    /// ADC resolution in bits.
    pub fn resolution_bits(&self) -> u8 {
        self.bits
    }

    /// Largest raw value.
    pub fn max_raw(&self) -> u32 {
        if self.bits >= 32 {
            u32::MAX
        } else {
            (1u32 << self.bits) - 1
        }
    }

    pub fn aref(&self) -> f64 {
        *self.aref.lock()
    }

    /// Set the reference voltage. Must be positive.
    pub fn set_aref(&self, aref: f64) -> Result<()> {
        if !(aref.is_finite() && aref > 0.0) {
            return Err(SensorError::config(format!(
                "{}: reference voltage must be positive, got {}",
                self.name(),
                aref
            )));
        }
        *self.aref.lock() = aref;
        Ok(())
    }

    /// Raw ADC counts.
    pub fn read_raw(&self) -> Result<u32> {
        let raw = self.backend.lock().read_raw()?;
        trace!(pin = self.pin, raw, "Analog read");
        Ok(raw)
    }

    /// Raw value scaled to 0.0-1.0.
    pub fn read_normalized(&self) -> Result<f64> {
        let raw = self.read_raw()?;
        let max = self.max_raw().max(1);
        Ok((raw.min(max) as f64) / (max as f64))
    }

    /// Normalized value times the reference voltage.
    pub fn read_volts(&self) -> Result<f64> {
        Ok(self.read_normalized()? * self.aref())
    }
}

impl fmt::Debug for AnalogInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalogInput")
            .field("pin", &self.pin)
            .field("bits", &self.bits)
            .field("aref", &self.aref())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// I2C
// ---------------------------------------------------------------------------

/// A device at one 7-bit address on an I2C bus.
///
/// Register helpers follow SMBus conventions: words are little-endian.
pub struct I2cDevice {
    bus: u32,
    address: u16,
    backend: Mutex<Box<dyn I2cBackend>>,
    claim: Claim,
}

impl I2cDevice {
    pub(crate) fn new(bus: u32, address: u16, backend: Box<dyn I2cBackend>, claim: Claim) -> Self {
        Self {
            bus,
            address,
            backend: Mutex::new(backend),
            claim,
        }
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn name(&self) -> String {
        self.claim.resource().to_string()
    }

    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.backend.lock().read(&mut buf)?;
        Ok(buf)
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.backend.lock().write(data)
    }

    pub fn write_read(&self, data: &[u8], len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.backend.lock().write_read(data, &mut buf)?;
        Ok(buf)
    }

    pub fn read_byte_data(&self, register: u8) -> Result<u8> {
        let buf = self.write_read(&[register], 1)?;
        Ok(buf[0])
    }

    pub fn write_byte_data(&self, register: u8, value: u8) -> Result<()> {
        self.write(&[register, value])
    }

    pub fn read_word_data(&self, register: u8) -> Result<u16> {
        let buf = self.write_read(&[register], 2)?;
        Ok(u16::from_le_bytes([buf[0], buf[1]]))
    }

    pub fn write_word_data(&self, register: u8, value: u16) -> Result<()> {
        let [lo, hi] = value.to_le_bytes();
        self.write(&[register, lo, hi])
    }

    /// Read `len` consecutive registers starting at `register`.
    pub fn read_block(&self, register: u8, len: usize) -> Result<Vec<u8>> {
        self.write_read(&[register], len)
    }

    pub fn write_block(&self, register: u8, values: &[u8]) -> Result<()> {
        let mut data = Vec::with_capacity(values.len() + 1);
        data.push(register);
        data.extend_from_slice(values);
        self.write(&data)
    }
}

impl fmt::Debug for I2cDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I2cDevice")
            .field("bus", &self.bus)
            .field("address", &format_args!("0x{:02x}", self.address))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SPI
// ---------------------------------------------------------------------------

/// A device on one SPI chip-select.
pub struct SpiDevice {
    bus: u32,
    chip_select: u32,
    mode: u8,
    backend: Mutex<Box<dyn SpiBackend>>,
    claim: Claim,
}

impl SpiDevice {
    pub(crate) fn new(
        bus: u32,
        chip_select: u32,
        mode: u8,
        backend: Box<dyn SpiBackend>,
        claim: Claim,
    ) -> Self {
        Self {
            bus,
            chip_select,
            mode,
            backend: Mutex::new(backend),
            claim,
        }
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }

    pub fn chip_select(&self) -> u32 {
        self.chip_select
    }

    pub fn mode(&self) -> u8 {
        self.mode
    }

    pub fn name(&self) -> String {
        self.claim.resource().to_string()
    }

    /// Clock out `tx`, returning the bytes clocked in.
    pub fn transfer(&self, tx: &[u8]) -> Result<Vec<u8>> {
        let rx = self.backend.lock().transfer(tx)?;
        if rx.len() != tx.len() {
            return Err(SensorError::transient(
                self.name(),
                format!("short transfer: sent {} bytes, got {}", tx.len(), rx.len()),
            ));
        }
        Ok(rx)
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.transfer(data).map(|_| ())
    }

    /// Send `register` followed by `len` dummy bytes and return the bytes
    /// clocked in after the register byte.
    pub fn read_register(&self, register: u8, len: usize) -> Result<Vec<u8>> {
        let mut tx = vec![0u8; len + 1];
        tx[0] = register;
        let rx = self.transfer(&tx)?;
        Ok(rx[1..].to_vec())
    }
}

impl fmt::Debug for SpiDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiDevice")
            .field("bus", &self.bus)
            .field("chip_select", &self.chip_select)
            .field("mode", &self.mode)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// UART
// ---------------------------------------------------------------------------

/// A serial port.
pub struct Uart {
    port: String,
    baud: u32,
    backend: Mutex<Box<dyn UartBackend>>,
    /// Bytes received past the last returned line
    pending: Mutex<Vec<u8>>,
    _claim: Claim,
}

impl Uart {
    pub(crate) fn new(port: &str, baud: u32, backend: Box<dyn UartBackend>, claim: Claim) -> Self {
        Self {
            port: port.to_string(),
            baud,
            backend: Mutex::new(backend),
            pending: Mutex::new(Vec::new()),
            _claim: claim,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.backend.lock().write(data)
    }

    pub fn write_str(&self, text: &str) -> Result<usize> {
        self.write(text.as_bytes())
    }

    /// Whether bytes are waiting, waiting up to `timeout` for some.
    pub fn data_available(&self, timeout: Duration) -> Result<bool> {
        if !self.pending.lock().is_empty() {
            return Ok(true);
        }
        self.backend.lock().data_available(timeout)
    }

    /// Read up to `max` bytes arriving within `timeout`.
    pub fn read(&self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        {
            let mut pending = self.pending.lock();
            if !pending.is_empty() {
                let n = max.min(pending.len());
                return Ok(pending.drain(..n).collect());
            }
        }
        let mut buf = vec![0u8; max];
        let n = self.backend.lock().read(&mut buf, timeout)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Read one `\n`-terminated line, without the terminator or a trailing
    /// `\r`. Returns `Ok(None)` if no full line arrives within `timeout`;
    /// partial data is kept for the next call.
    pub fn read_line(&self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        let mut chunk = [0u8; 64];

        loop {
            if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            let now = Instant::now();
            if now >= deadline {
                trace!(port = %self.port, buffered = pending.len(), "No complete line before timeout");
                return Ok(None);
            }

            let n = self.backend.lock().read(&mut chunk, deadline - now)?;
            pending.extend_from_slice(&chunk[..n]);
        }
    }
}

impl fmt::Debug for Uart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uart")
            .field("port", &self.port)
            .field("baud", &self.baud)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Opened connection
// ---------------------------------------------------------------------------

/// Proxy opened from a connection entry.
#[derive(Debug)]
pub enum Device {
    Gpio(Gpio),
    Analog(AnalogInput),
    I2c(I2cDevice),
    Spi(SpiDevice),
    Uart(Uart),
}

impl Device {
    /// Kind label matching [`sensorbus_core::Connection::protocol`].
    pub fn protocol(&self) -> &'static str {
        match self {
            Device::Gpio(_) => "GPIO",
            Device::Analog(_) => "AIO",
            Device::I2c(_) => "I2C",
            Device::Spi(_) => "SPI",
            Device::Uart(_) => "UART",
        }
    }

    pub fn into_gpio(self) -> Result<Gpio> {
        match self {
            Device::Gpio(d) => Ok(d),
            other => Err(mismatch("GPIO", &other)),
        }
    }

    pub fn into_analog(self) -> Result<AnalogInput> {
        match self {
            Device::Analog(d) => Ok(d),
            other => Err(mismatch("AIO", &other)),
        }
    }

    pub fn into_uart(self) -> Result<Uart> {
        match self {
            Device::Uart(d) => Ok(d),
            other => Err(mismatch("UART", &other)),
        }
    }
}

fn mismatch(expected: &str, got: &Device) -> SensorError {
    SensorError::config(format!(
        "expected a {} connection, got {}",
        expected,
        got.protocol()
    ))
}
