//! Connection strings: compact descriptors binding a sensor to its buses.
//!
//! A connection string is a comma-separated list of protocol entries, each a
//! colon-separated list of fields. The first character of the first field
//! selects the protocol:
//!
//! ```text
//! a:<pin>                          analog input
//! g:<pin>[:opt...]                 GPIO (direction, edge, pull, input/output mode)
//! i:<bus>[:<addr>][:std|fast|high] I2C
//! s:<bus>:<cs>[:<mode>][:<hz>]     SPI
//! u:<port>[:<baud>]                UART (numeric port -> /dev/ttyS<n>)
//! p:<pin>                          PWM
//! ```
//!
//! Numbers are decimal or `0x`-prefixed hex.
//!
//! # Example
//!
//! ```
//! use sensorbus_core::connection::{Connection, ConnectionString, Edge};
//!
//! let conns: ConnectionString = "g:3:in:rising:pullup,i:1:0x18".parse()?;
//! assert_eq!(conns.len(), 2);
//! match &conns[0] {
//!     Connection::Gpio { pin, options } => {
//!         assert_eq!(*pin, 3);
//!         assert_eq!(options.edge, Some(Edge::Rising));
//!     }
//!     other => panic!("unexpected {other}"),
//! }
//! # Ok::<(), sensorbus_core::SensorError>(())
//! ```

use std::fmt;
use std::ops::Index;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SensorError};

/// Default UART baud rate when a connection string omits it.
pub const DEFAULT_BAUD: u32 = 9600;

/// GPIO direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Input
    In,
    /// Output, initial level unspecified
    Out,
    /// Output, initially high
    OutHigh,
    /// Output, initially low
    OutLow,
}

impl Direction {
    /// Token used in connection strings and by sysfs.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
            Direction::OutHigh => "high",
            Direction::OutLow => "low",
        }
    }

    /// Check if this is any output direction.
    pub fn is_output(self) -> bool {
        !matches!(self, Direction::In)
    }
}

/// GPIO edge selection for interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    /// No interrupts
    #[default]
    None,
    /// Both rising and falling transitions
    Both,
    /// Low to high transitions
    Rising,
    /// High to low transitions
    Falling,
}

impl Edge {
    /// Token used in connection strings and by sysfs.
    pub fn as_str(self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Both => "both",
            Edge::Rising => "rising",
            Edge::Falling => "falling",
        }
    }

    /// Does a transition to `level` qualify under this edge selection?
    pub fn matches(self, previous: bool, level: bool) -> bool {
        match self {
            Edge::None => false,
            Edge::Both => previous != level,
            Edge::Rising => !previous && level,
            Edge::Falling => previous && !level,
        }
    }
}

/// GPIO drive/pull mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullMode {
    Strong,
    PullUp,
    PullDown,
    HiZ,
}

impl PullMode {
    /// Token used in connection strings.
    pub fn as_str(self) -> &'static str {
        match self {
            PullMode::Strong => "strong",
            PullMode::PullUp => "pullup",
            PullMode::PullDown => "pulldown",
            PullMode::HiZ => "hiz",
        }
    }
}

/// GPIO input polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    ActiveHigh,
    ActiveLow,
}

impl InputMode {
    /// Token used in connection strings.
    pub fn as_str(self) -> &'static str {
        match self {
            InputMode::ActiveHigh => "active_high",
            InputMode::ActiveLow => "active_low",
        }
    }
}

/// GPIO output driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    OpenDrain,
    PushPull,
}

impl OutputMode {
    /// Token used in connection strings.
    pub fn as_str(self) -> &'static str {
        match self {
            OutputMode::OpenDrain => "open_drain",
            OutputMode::PushPull => "push_pull",
        }
    }
}

/// I2C bus speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum I2cSpeed {
    /// 100 kHz
    Standard,
    /// 400 kHz
    Fast,
    /// 3.4 MHz
    High,
}

impl I2cSpeed {
    /// Token used in connection strings.
    pub fn as_str(self) -> &'static str {
        match self {
            I2cSpeed::Standard => "std",
            I2cSpeed::Fast => "fast",
            I2cSpeed::High => "high",
        }
    }
}

/// Optional GPIO settings carried by a `g:` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpioOptions {
    pub direction: Option<Direction>,
    pub edge: Option<Edge>,
    pub pull: Option<PullMode>,
    pub input_mode: Option<InputMode>,
    pub output_mode: Option<OutputMode>,
}

/// One bus binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum Connection {
    /// Analog input pin
    Analog { pin: u32 },
    /// Digital GPIO pin
    Gpio { pin: u32, options: GpioOptions },
    /// I2C bus, optionally bound to a 7-bit address
    I2c {
        bus: u32,
        address: Option<u16>,
        speed: Option<I2cSpeed>,
    },
    /// SPI bus and chip-select
    Spi {
        bus: u32,
        chip_select: u32,
        mode: u8,
        frequency_hz: Option<u32>,
    },
    /// UART device path and baud rate
    Uart { port: String, baud: u32 },
    /// PWM pin
    Pwm { pin: u32 },
}

impl Connection {
    /// Protocol name for summaries and log fields.
    pub fn protocol(&self) -> &'static str {
        match self {
            Connection::Analog { .. } => "AIO",
            Connection::Gpio { .. } => "GPIO",
            Connection::I2c { .. } => "I2C",
            Connection::Spi { .. } => "SPI",
            Connection::Uart { .. } => "UART",
            Connection::Pwm { .. } => "PWM",
        }
    }

    /// Parse a single protocol entry such as `g:3:in:rising`.
    pub fn parse_entry(entry: &str) -> Result<Self> {
        let fields: Vec<&str> = entry.split(':').map(str::trim).collect();
        if fields.len() < 2 || fields[0].is_empty() {
            return Err(SensorError::config(format!(
                "Invalid connection entry '{}'. Format is proto0:val0:val1,proto1:val0:val1",
                entry
            )));
        }

        let proto = fields[0]
            .chars()
            .next()
            .map(|c| c.to_ascii_lowercase())
            .unwrap_or_default();

        match proto {
            'a' => Ok(Connection::Analog {
                pin: parse_number(fields[1])?,
            }),
            'g' => {
                let pin = parse_number(fields[1])?;
                let options = parse_gpio_options(entry, &fields[2..]);
                Ok(Connection::Gpio { pin, options })
            }
            'i' => {
                let bus = parse_number(fields[1])?;
                let mut address = None;
                let mut speed = None;
                for field in &fields[2..] {
                    let token = field.to_ascii_lowercase();
                    match token.as_str() {
                        "" => {}
                        "std" => speed = Some(I2cSpeed::Standard),
                        "fast" => speed = Some(I2cSpeed::Fast),
                        "high" => speed = Some(I2cSpeed::High),
                        _ if address.is_none() => {
                            let addr = parse_number(&token)?;
                            if addr > 0x7F {
                                return Err(SensorError::config(format!(
                                    "I2C address 0x{:x} in '{}' is not a 7-bit address",
                                    addr, entry
                                )));
                            }
                            address = Some(addr as u16);
                        }
                        _ => {
                            return Err(SensorError::config(format!(
                                "Unexpected I2C field '{}' in '{}'",
                                field, entry
                            )))
                        }
                    }
                }
                Ok(Connection::I2c {
                    bus,
                    address,
                    speed,
                })
            }
            's' => {
                if fields.len() < 3 {
                    return Err(SensorError::config(format!(
                        "SPI entry '{}' needs a bus and a chip-select",
                        entry
                    )));
                }
                let bus = parse_number(fields[1])?;
                let chip_select = parse_number(fields[2])?;
                let mode = match fields.get(3).filter(|f| !f.is_empty()) {
                    Some(f) => {
                        let mode = parse_number(f)?;
                        if mode > 3 {
                            return Err(SensorError::config(format!(
                                "SPI mode {} in '{}' must be 0-3",
                                mode, entry
                            )));
                        }
                        mode as u8
                    }
                    None => 0,
                };
                let frequency_hz = match fields.get(4).filter(|f| !f.is_empty()) {
                    Some(f) => Some(parse_number(f)?),
                    None => None,
                };
                Ok(Connection::Spi {
                    bus,
                    chip_select,
                    mode,
                    frequency_hz,
                })
            }
            'u' => {
                if fields[1].trim().is_empty() {
                    return Err(SensorError::config(format!(
                        "UART port missing in connection entry '{}'",
                        entry
                    )));
                }
                let port = if fields[1].chars().all(|c| c.is_ascii_digit()) {
                    format!("/dev/ttyS{}", fields[1])
                } else {
                    fields[1].to_string()
                };
                let baud = match fields.get(2).filter(|f| !f.is_empty()) {
                    Some(f) => parse_number(f)?,
                    None => DEFAULT_BAUD,
                };
                if baud == 0 {
                    return Err(SensorError::config(format!("UART baud in '{}' is zero", entry)));
                }
                Ok(Connection::Uart { port, baud })
            }
            'p' => Ok(Connection::Pwm {
                pin: parse_number(fields[1])?,
            }),
            other => Err(SensorError::config(format!(
                "Unsupported protocol '{}' in connection entry '{}'",
                other, entry
            ))),
        }
    }
}

fn parse_gpio_options(entry: &str, fields: &[&str]) -> GpioOptions {
    let mut options = GpioOptions::default();
    for field in fields {
        let token = field.to_ascii_lowercase();
        match token.as_str() {
            "" => {}
            "in" => options.direction = Some(Direction::In),
            "out" => options.direction = Some(Direction::Out),
            "high" => options.direction = Some(Direction::OutHigh),
            "low" => options.direction = Some(Direction::OutLow),
            "none" => options.edge = Some(Edge::None),
            "both" => options.edge = Some(Edge::Both),
            "rising" => options.edge = Some(Edge::Rising),
            "falling" => options.edge = Some(Edge::Falling),
            "strong" => options.pull = Some(PullMode::Strong),
            "pullup" => options.pull = Some(PullMode::PullUp),
            "pulldown" => options.pull = Some(PullMode::PullDown),
            "hiz" => options.pull = Some(PullMode::HiZ),
            "active_high" => options.input_mode = Some(InputMode::ActiveHigh),
            "active_low" => options.input_mode = Some(InputMode::ActiveLow),
            "open_drain" => options.output_mode = Some(OutputMode::OpenDrain),
            "push_pull" => options.output_mode = Some(OutputMode::PushPull),
            _ => warn!(parameter = %field, entry = %entry, "Ignoring unknown GPIO parameter"),
        }
    }
    options
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Analog { pin } => write!(f, "a:{}", pin),
            Connection::Gpio { pin, options } => {
                write!(f, "g:{}", pin)?;
                if let Some(d) = options.direction {
                    write!(f, ":{}", d.as_str())?;
                }
                if let Some(e) = options.edge {
                    write!(f, ":{}", e.as_str())?;
                }
                if let Some(p) = options.pull {
                    write!(f, ":{}", p.as_str())?;
                }
                if let Some(m) = options.input_mode {
                    write!(f, ":{}", m.as_str())?;
                }
                if let Some(m) = options.output_mode {
                    write!(f, ":{}", m.as_str())?;
                }
                Ok(())
            }
            Connection::I2c {
                bus,
                address,
                speed,
            } => {
                write!(f, "i:{}", bus)?;
                if let Some(addr) = address {
                    write!(f, ":0x{:02x}", addr)?;
                }
                if let Some(s) = speed {
                    write!(f, ":{}", s.as_str())?;
                }
                Ok(())
            }
            Connection::Spi {
                bus,
                chip_select,
                mode,
                frequency_hz,
            } => {
                write!(f, "s:{}:{}:{}", bus, chip_select, mode)?;
                if let Some(hz) = frequency_hz {
                    write!(f, ":{}", hz)?;
                }
                Ok(())
            }
            Connection::Uart { port, baud } => write!(f, "u:{}:{}", port, baud),
            Connection::Pwm { pin } => write!(f, "p:{}", pin),
        }
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_number(text: &str) -> Result<u32> {
    let lower = text.trim().to_ascii_lowercase();
    let parsed = if let Some(hex) = lower.strip_prefix("0x") {
        if hex.is_empty() {
            None
        } else {
            u32::from_str_radix(hex, 16).ok()
        }
    } else if !lower.is_empty() && lower.chars().all(|c| c.is_ascii_digit()) {
        lower.parse::<u32>().ok()
    } else {
        None
    };

    parsed.ok_or_else(|| SensorError::config(format!("Cannot convert '{}' to an integer", text)))
}

/// A parsed list of bus bindings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionString {
    entries: Vec<Connection>,
}

impl ConnectionString {
    /// Parse a full connection string.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for entry in text.split(',') {
            if entry.trim().is_empty() {
                continue;
            }
            entries.push(Connection::parse_entry(entry.trim())?);
        }
        if entries.is_empty() {
            return Err(SensorError::config(format!(
                "Connection string '{}' has no entries",
                text
            )));
        }
        Ok(Self { entries })
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no bindings.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the bindings in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, Connection> {
        self.entries.iter()
    }

    /// First binding of the given protocol.
    pub fn first_of(&self, protocol: &str) -> Option<&Connection> {
        self.entries.iter().find(|c| c.protocol() == protocol)
    }

    /// Per-protocol counts.
    pub fn summary(&self) -> ConnectionSummary {
        let mut summary = ConnectionSummary::default();
        summary.extend(self.iter());
        summary
    }
}

impl FromStr for ConnectionString {
    type Err = SensorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Index<usize> for ConnectionString {
    type Output = Connection;

    fn index(&self, index: usize) -> &Connection {
        &self.entries[index]
    }
}

impl<'a> IntoIterator for &'a ConnectionString {
    type Item = &'a Connection;
    type IntoIter = std::slice::Iter<'a, Connection>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

/// Count of bindings per protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub analog: usize,
    pub gpio: usize,
    pub i2c: usize,
    pub spi: usize,
    pub uart: usize,
    pub pwm: usize,
}

impl ConnectionSummary {
    /// Add bindings to the counts.
    pub fn extend<'a>(&mut self, connections: impl IntoIterator<Item = &'a Connection>) {
        for connection in connections {
            match connection {
                Connection::Analog { .. } => self.analog += 1,
                Connection::Gpio { .. } => self.gpio += 1,
                Connection::I2c { .. } => self.i2c += 1,
                Connection::Spi { .. } => self.spi += 1,
                Connection::Uart { .. } => self.uart += 1,
                Connection::Pwm { .. } => self.pwm += 1,
            }
        }
    }

    /// Total number of bindings.
    pub fn total(&self) -> usize {
        self.analog + self.gpio + self.i2c + self.spi + self.uart + self.pwm
    }
}

impl fmt::Display for ConnectionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Connections ({}):", self.total())?;
        for (label, count) in [
            ("AIO", self.analog),
            ("GPIO", self.gpio),
            ("I2C", self.i2c),
            ("SPI", self.spi),
            ("UART", self.uart),
            ("PWM", self.pwm),
        ] {
            if count > 0 {
                writeln!(f, "\t{}: {}", label, count)?;
            }
        }
        Ok(())
    }
}
