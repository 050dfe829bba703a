//! In-memory platform for tests and `backend = "sim"`.
//!
//! The simulator holds pin levels, ADC values, I2C register maps, scripted
//! SPI responses and UART queues. Tests drive it from the outside
//! ([`SimPlatform::set_level`], [`SimPlatform::pulse`], ...) while a
//! [`crate::Board`] built on a clone of it opens proxies as usual.
//!
//! Fault injection: [`SimPlatform::fail_next`] makes the next operation on
//! a resource fail with the given error kind.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use sensorbus_core::connection::{Direction, Edge, I2cSpeed, PullMode};
use sensorbus_core::{ErrorKind, Result, SensorError};
use tracing::{debug, trace};

use crate::interrupt::{EdgeKind, EdgeSink};
use crate::platform::{
    AnalogBackend, GpioBackend, I2cBackend, Platform, Resource, SpiBackend, UartBackend,
};

/// Default simulated ADC resolution.
pub const DEFAULT_ADC_BITS: u8 = 10;

/// Longest a simulated UART read waits for data that is not there.
const UART_IDLE_WAIT: Duration = Duration::from_millis(2);

#[derive(Default)]
struct SimPin {
    /// Physical level
    level: bool,
    active_low: bool,
    direction: Option<Direction>,
    pull: Option<PullMode>,
    watch: Option<(Edge, EdgeSink)>,
    /// Held from level change through delivery so edges arrive in order
    edge_order: Arc<Mutex<()>>,
}

struct SimI2cDevice {
    registers: [u8; 256],
    pointer: u8,
}

impl Default for SimI2cDevice {
    fn default() -> Self {
        Self {
            registers: [0; 256],
            pointer: 0,
        }
    }
}

#[derive(Default)]
struct SimSpi {
    responses: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
}

#[derive(Default)]
struct SimUart {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

#[derive(Default)]
struct SimState {
    pins: HashMap<u32, SimPin>,
    adc: HashMap<u32, u32>,
    i2c: HashMap<(u32, u16), SimI2cDevice>,
    spi: HashMap<(u32, u32), SimSpi>,
    uarts: HashMap<String, SimUart>,
    faults: HashMap<Resource, VecDeque<ErrorKind>>,
}

impl SimState {
    fn take_fault(&mut self, resource: &Resource) -> Result<()> {
        let kind = self.faults.get_mut(resource).and_then(VecDeque::pop_front);
        match kind {
            Some(kind) => {
                debug!(resource = %resource, kind = %kind, "Injected fault");
                Err(SensorError::of_kind(kind, resource.to_string(), "injected fault"))
            }
            None => Ok(()),
        }
    }
}

struct SimInner {
    state: Mutex<SimState>,
    adc_bits: u8,
}

impl SimInner {
    /// Set the physical level of `pin`, delivering an edge if one qualifies.
    fn drive(&self, pin: u32, physical: bool) {
        let order = Arc::clone(&self.state.lock().pins.entry(pin).or_default().edge_order);
        let _order = order.lock();

        let delivery = {
            let mut state = self.state.lock();
            let sim = state.pins.entry(pin).or_default();
            let previous = sim.level ^ sim.active_low;
            sim.level = physical;
            let current = physical ^ sim.active_low;
            match &sim.watch {
                Some((edge, sink)) if edge.matches(previous, current) => {
                    Some((sink.clone(), current))
                }
                _ => None,
            }
        };

        // Delivery may block on a full queue; never hold the state lock here
        if let Some((sink, level)) = delivery {
            sink.deliver(EdgeKind::from_level(level), level);
        }
    }
}

/// Simulated platform. Clones share state.
#[derive(Clone)]
pub struct SimPlatform {
    inner: Arc<SimInner>,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::with_adc_bits(DEFAULT_ADC_BITS)
    }

    /// Simulator with an ADC of `bits` resolution (clamped to 1-24).
    pub fn with_adc_bits(bits: u8) -> Self {
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState::default()),
                adc_bits: bits.clamp(1, 24),
            }),
        }
    }

    // -- GPIO ---------------------------------------------------------------

    /// Set the physical level applied to `pin` by the outside world.
    pub fn set_level(&self, pin: u32, level: bool) {
        self.inner.drive(pin, level);
    }

    /// Physical level of `pin`.
    pub fn level(&self, pin: u32) -> bool {
        self.inner
            .state
            .lock()
            .pins
            .get(&pin)
            .map(|p| p.level)
            .unwrap_or(false)
    }

    /// Drive `count` low-high-low pulses onto `pin`.
    pub fn pulse(&self, pin: u32, count: usize) {
        for _ in 0..count {
            self.set_level(pin, true);
            self.set_level(pin, false);
        }
    }

    /// Edge selection currently watched on `pin`.
    pub fn watched_edge(&self, pin: u32) -> Option<Edge> {
        self.inner
            .state
            .lock()
            .pins
            .get(&pin)
            .and_then(|p| p.watch.as_ref().map(|(edge, _)| *edge))
    }

    /// Direction last configured on `pin`.
    pub fn direction(&self, pin: u32) -> Option<Direction> {
        self.inner
            .state
            .lock()
            .pins
            .get(&pin)
            .and_then(|p| p.direction)
    }

    /// Pull mode last configured on `pin`.
    pub fn pull(&self, pin: u32) -> Option<PullMode> {
        self.inner.state.lock().pins.get(&pin).and_then(|p| p.pull)
    }

    // -- ADC ----------------------------------------------------------------

    /// Set the raw ADC value of `pin`.
    pub fn set_analog(&self, pin: u32, raw: u32) {
        self.inner.state.lock().adc.insert(pin, raw);
    }

    /// Configured ADC resolution.
    pub fn adc_bits(&self) -> u8 {
        self.inner.adc_bits
    }

    // -- I2C ----------------------------------------------------------------

    /// Attach a device with zeroed registers.
    pub fn add_i2c_device(&self, bus: u32, address: u16) {
        self.inner
            .state
            .lock()
            .i2c
            .entry((bus, address))
            .or_default();
    }

    /// Set one register, attaching the device if needed.
    pub fn set_i2c_register(&self, bus: u32, address: u16, register: u8, value: u8) {
        let mut state = self.inner.state.lock();
        let dev = state.i2c.entry((bus, address)).or_default();
        dev.registers[register as usize] = value;
    }

    pub fn i2c_register(&self, bus: u32, address: u16, register: u8) -> Option<u8> {
        self.inner
            .state
            .lock()
            .i2c
            .get(&(bus, address))
            .map(|d| d.registers[register as usize])
    }

    // -- SPI ----------------------------------------------------------------

    /// Queue the bytes the next transfer on `bus.chip_select` clocks in.
    pub fn queue_spi_response(&self, bus: u32, chip_select: u32, response: Vec<u8>) {
        self.inner
            .state
            .lock()
            .spi
            .entry((bus, chip_select))
            .or_default()
            .responses
            .push_back(response);
    }

    /// Every buffer clocked out on `bus.chip_select`.
    pub fn spi_sent(&self, bus: u32, chip_select: u32) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .spi
            .get(&(bus, chip_select))
            .map(|s| s.sent.clone())
            .unwrap_or_default()
    }

    // -- UART ---------------------------------------------------------------

    /// Make `data` arrive on `port`.
    pub fn push_uart_rx(&self, port: &str, data: &[u8]) {
        self.inner
            .state
            .lock()
            .uarts
            .entry(port.to_string())
            .or_default()
            .rx
            .extend(data.iter().copied());
    }

    /// Everything written to `port`.
    pub fn uart_sent(&self, port: &str) -> Vec<u8> {
        self.inner
            .state
            .lock()
            .uarts
            .get(port)
            .map(|u| u.tx.clone())
            .unwrap_or_default()
    }

    // -- Faults -------------------------------------------------------------

    /// Fail the next operation on `resource` with an error of `kind`.
    ///
    /// Calls queue: two calls fail the next two operations.
    pub fn fail_next(&self, resource: Resource, kind: ErrorKind) {
        self.inner
            .state
            .lock()
            .faults
            .entry(resource)
            .or_default()
            .push_back(kind);
    }
}

impl Platform for SimPlatform {
    fn name(&self) -> &str {
        "sim"
    }

    fn open_gpio(&self, pin: u32) -> Result<Box<dyn GpioBackend>> {
        let resource = Resource::Gpio(pin);
        let mut state = self.inner.state.lock();
        state.take_fault(&resource)?;
        state.pins.entry(pin).or_default();
        Ok(Box::new(SimGpio {
            pin,
            resource,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn open_analog(&self, pin: u32) -> Result<Box<dyn AnalogBackend>> {
        let resource = Resource::Analog(pin);
        self.inner.state.lock().take_fault(&resource)?;
        Ok(Box::new(SimAnalog {
            pin,
            resource,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn open_i2c(&self, bus: u32) -> Result<Box<dyn I2cBackend>> {
        Ok(Box::new(SimI2c {
            bus,
            address: None,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn open_spi(&self, bus: u32, chip_select: u32) -> Result<Box<dyn SpiBackend>> {
        let resource = Resource::Spi { bus, chip_select };
        let mut state = self.inner.state.lock();
        state.take_fault(&resource)?;
        state.spi.entry((bus, chip_select)).or_default();
        Ok(Box::new(SimSpiDevice {
            key: (bus, chip_select),
            resource,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn open_uart(&self, port: &str, baud: u32) -> Result<Box<dyn UartBackend>> {
        let resource = Resource::Uart(port.to_string());
        let mut state = self.inner.state.lock();
        state.take_fault(&resource)?;
        state.uarts.entry(port.to_string()).or_default();
        debug!(port, baud, "Opened simulated UART");
        Ok(Box::new(SimUartPort {
            port: port.to_string(),
            resource,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct SimGpio {
    pin: u32,
    resource: Resource,
    inner: Arc<SimInner>,
}

impl GpioBackend for SimGpio {
    fn set_direction(&mut self, direction: Direction) -> Result<()> {
        let initial = {
            let mut state = self.inner.state.lock();
            state.take_fault(&self.resource)?;
            let pin = state.pins.entry(self.pin).or_default();
            pin.direction = Some(direction);
            match direction {
                Direction::OutHigh => Some(true ^ pin.active_low),
                Direction::OutLow => Some(pin.active_low),
                Direction::In | Direction::Out => None,
            }
        };
        if let Some(physical) = initial {
            self.inner.drive(self.pin, physical);
        }
        Ok(())
    }

    fn set_pull(&mut self, pull: PullMode) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.take_fault(&self.resource)?;
        state.pins.entry(self.pin).or_default().pull = Some(pull);
        Ok(())
    }

    fn set_active_low(&mut self, active_low: bool) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.take_fault(&self.resource)?;
        state.pins.entry(self.pin).or_default().active_low = active_low;
        Ok(())
    }

    fn read(&mut self) -> Result<bool> {
        let mut state = self.inner.state.lock();
        state.take_fault(&self.resource)?;
        let pin = state.pins.entry(self.pin).or_default();
        Ok(pin.level ^ pin.active_low)
    }

    fn write(&mut self, level: bool) -> Result<()> {
        let physical = {
            let mut state = self.inner.state.lock();
            state.take_fault(&self.resource)?;
            let pin = state.pins.entry(self.pin).or_default();
            level ^ pin.active_low
        };
        self.inner.drive(self.pin, physical);
        Ok(())
    }

    fn watch_edges(&mut self, edge: Edge, sink: EdgeSink) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.take_fault(&self.resource)?;
        state.pins.entry(self.pin).or_default().watch = Some((edge, sink));
        trace!(pin = self.pin, edge = edge.as_str(), "Watching simulated edges");
        Ok(())
    }

    fn unwatch(&mut self) -> Result<()> {
        if let Some(pin) = self.inner.state.lock().pins.get_mut(&self.pin) {
            pin.watch = None;
        }
        Ok(())
    }
}

struct SimAnalog {
    pin: u32,
    resource: Resource,
    inner: Arc<SimInner>,
}

impl AnalogBackend for SimAnalog {
    fn resolution_bits(&self) -> u8 {
        self.inner.adc_bits
    }

    fn read_raw(&mut self) -> Result<u32> {
        let mut state = self.inner.state.lock();
        state.take_fault(&self.resource)?;
        let max = (1u32 << self.inner.adc_bits) - 1;
        Ok(state.adc.get(&self.pin).copied().unwrap_or(0).min(max))
    }
}

struct SimI2c {
    bus: u32,
    address: Option<u16>,
    inner: Arc<SimInner>,
}

impl SimI2c {
    fn target(&self) -> Result<(u16, Resource)> {
        let address = self.address.ok_or_else(|| {
            SensorError::config(format!("i2c-{}: no slave address set", self.bus))
        })?;
        Ok((
            address,
            Resource::I2c {
                bus: self.bus,
                address,
            },
        ))
    }
}

impl I2cBackend for SimI2c {
    fn set_address(&mut self, address: u16) -> Result<()> {
        self.address = Some(address);
        Ok(())
    }

    fn set_speed(&mut self, speed: I2cSpeed) -> Result<()> {
        trace!(bus = self.bus, speed = speed.as_str(), "Simulated I2C speed");
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let (address, resource) = self.target()?;
        let mut state = self.inner.state.lock();
        state.take_fault(&resource)?;
        let dev = state
            .i2c
            .get_mut(&(self.bus, address))
            .ok_or_else(|| SensorError::transient(resource.to_string(), "no ACK from device"))?;
        for byte in buf.iter_mut() {
            *byte = dev.registers[dev.pointer as usize];
            dev.pointer = dev.pointer.wrapping_add(1);
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let (address, resource) = self.target()?;
        let mut state = self.inner.state.lock();
        state.take_fault(&resource)?;
        let dev = state
            .i2c
            .get_mut(&(self.bus, address))
            .ok_or_else(|| SensorError::transient(resource.to_string(), "no ACK from device"))?;
        if let Some((&register, values)) = data.split_first() {
            dev.pointer = register;
            for &value in values {
                dev.registers[dev.pointer as usize] = value;
                dev.pointer = dev.pointer.wrapping_add(1);
            }
        }
        Ok(())
    }
}

struct SimSpiDevice {
    key: (u32, u32),
    resource: Resource,
    inner: Arc<SimInner>,
}

impl SpiBackend for SimSpiDevice {
    fn configure(&mut self, mode: u8, frequency_hz: Option<u32>) -> Result<()> {
        if mode > 3 {
            return Err(SensorError::config(format!(
                "{}: SPI mode {} out of range",
                self.resource, mode
            )));
        }
        trace!(resource = %self.resource, mode, ?frequency_hz, "Simulated SPI configured");
        Ok(())
    }

    fn transfer(&mut self, tx: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.inner.state.lock();
        state.take_fault(&self.resource)?;
        let spi = state.spi.entry(self.key).or_default();
        spi.sent.push(tx.to_vec());
        let mut rx = spi.responses.pop_front().unwrap_or_default();
        rx.resize(tx.len(), 0);
        Ok(rx)
    }
}

struct SimUartPort {
    port: String,
    resource: Resource,
    inner: Arc<SimInner>,
}

impl SimUartPort {
    fn pending(&self) -> usize {
        self.inner
            .state
            .lock()
            .uarts
            .get(&self.port)
            .map(|u| u.rx.len())
            .unwrap_or(0)
    }
}

impl UartBackend for SimUartPort {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.inner.state.lock();
        state.take_fault(&self.resource)?;
        state
            .uarts
            .entry(self.port.clone())
            .or_default()
            .tx
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.inner.state.lock().take_fault(&self.resource)?;
        if self.pending() == 0 {
            thread::sleep(timeout.min(UART_IDLE_WAIT));
        }
        let mut state = self.inner.state.lock();
        let uart = state.uarts.entry(self.port.clone()).or_default();
        let n = buf.len().min(uart.rx.len());
        for (slot, byte) in buf.iter_mut().zip(uart.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn data_available(&mut self, timeout: Duration) -> Result<bool> {
        self.inner.state.lock().take_fault(&self.resource)?;
        if self.pending() == 0 {
            thread::sleep(timeout.min(UART_IDLE_WAIT));
        }
        Ok(self.pending() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i2c_register_pointer() {
        let sim = SimPlatform::new();
        sim.set_i2c_register(1, 0x18, 0x05, 0xAB);
        sim.set_i2c_register(1, 0x18, 0x06, 0xCD);

        let mut bus = sim.open_i2c(1).unwrap();
        bus.set_address(0x18).unwrap();
        let mut buf = [0u8; 2];
        bus.write_read(&[0x05], &mut buf).unwrap();
        assert_eq!(buf, [0xAB, 0xCD]);

        bus.write(&[0x10, 0x42]).unwrap();
        assert_eq!(sim.i2c_register(1, 0x18, 0x10), Some(0x42));
    }

    #[test]
    fn test_i2c_missing_device_is_transient() {
        let sim = SimPlatform::new();
        let mut bus = sim.open_i2c(0).unwrap();
        bus.set_address(0x40).unwrap();
        let mut buf = [0u8; 1];
        assert!(bus.read(&mut buf).unwrap_err().is_transient());
    }

    #[test]
    fn test_fault_injection_is_consumed() {
        let sim = SimPlatform::new();
        sim.set_analog(0, 512);
        let mut adc = sim.open_analog(0).unwrap();
        sim.fail_next(Resource::Analog(0), ErrorKind::TransientIo);
        assert!(adc.read_raw().unwrap_err().is_transient());
        assert_eq!(adc.read_raw().unwrap(), 512);
    }

    #[test]
    fn test_adc_clamped_to_resolution() {
        let sim = SimPlatform::with_adc_bits(8);
        sim.set_analog(2, 4000);
        let mut adc = sim.open_analog(2).unwrap();
        assert_eq!(adc.resolution_bits(), 8);
        assert_eq!(adc.read_raw().unwrap(), 255);
    }

    #[test]
    fn test_concurrent_drivers_deliver_edges_in_order() {
        use crate::interrupt::{InterruptConfig, InterruptLine};

        let sim = SimPlatform::new();
        let line = InterruptLine::new(
            "gpio7",
            7,
            InterruptConfig {
                queue_capacity: 1024,
                ..Default::default()
            },
        );
        let mut sub = line.subscribe();
        let mut gpio = sim.open_gpio(7).unwrap();
        gpio.watch_edges(Edge::Both, line.sink()).unwrap();

        let drivers: Vec<_> = (0..2)
            .map(|_| {
                let sim = sim.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        sim.set_level(7, true);
                        sim.set_level(7, false);
                    }
                })
            })
            .collect();
        for driver in drivers {
            driver.join().unwrap();
        }

        let mut events = Vec::new();
        while let Ok(event) = sub.events.try_recv() {
            events.push(event);
        }
        assert!(!events.is_empty());
        assert_eq!(events.len() as u64, line.stats().delivered);
        for pair in events.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            assert_ne!(pair[1].level, pair[0].level, "edge #{} out of order", pair[1].sequence);
        }
    }

    #[test]
    fn test_spi_scripted_response() {
        let sim = SimPlatform::new();
        sim.queue_spi_response(0, 1, vec![0x00, 0x12, 0x34]);
        let mut spi = sim.open_spi(0, 1).unwrap();
        assert_eq!(spi.transfer(&[0x80, 0, 0]).unwrap(), vec![0x00, 0x12, 0x34]);
        assert_eq!(spi.transfer(&[0x80, 0]).unwrap(), vec![0, 0]);
        assert_eq!(sim.spi_sent(0, 1).len(), 2);
    }

    #[test]
    fn test_uart_queues() {
        let sim = SimPlatform::new();
        let mut uart = sim.open_uart("/dev/ttyS0", 9600).unwrap();
        assert!(!uart.data_available(Duration::from_millis(1)).unwrap());
        sim.push_uart_rx("/dev/ttyS0", b"ok");
        let mut buf = [0u8; 8];
        assert_eq!(uart.read(&mut buf, Duration::from_millis(1)).unwrap(), 2);
        assert_eq!(&buf[..2], b"ok");
        uart.write(b"AT\r\n").unwrap();
        assert_eq!(sim.uart_sent("/dev/ttyS0"), b"AT\r\n".to_vec());
    }

    #[test]
    fn test_output_direction_sets_level() {
        let sim = SimPlatform::new();
        let mut gpio = sim.open_gpio(9).unwrap();
        gpio.set_direction(Direction::OutHigh).unwrap();
        assert!(sim.level(9));
        assert_eq!(sim.direction(9), Some(Direction::OutHigh));
        gpio.write(false).unwrap();
        assert!(!sim.level(9));
    }
}
