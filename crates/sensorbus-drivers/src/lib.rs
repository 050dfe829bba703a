//! Sensor drivers for sensorbus.
//!
//! Each driver type comes with a [`DriverFactory`] that validates a
//! configured [`SensorSpec`] and builds it on a board. The bundled set:
//!
//! | driver_type      | connection | reading |
//! |------------------|------------|---------|
//! | `digital_input`  | `g:`       | logic level |
//! | `digital_output` | `g:`       | logic level, switchable |
//! | `analog`         | `a:`       | scaled voltage |
//! | `pulse_counter`  | `g:`       | interrupt-driven count |
//! | `register`       | `i:`/`s:`  | decoded register word |
//! | `uart_lines`     | `u:`       | text line |

pub mod analog;
pub mod digital;
pub mod factory;
pub mod line_sensor;
pub mod pulse_counter;
pub mod register;

pub use analog::{AnalogConfig, AnalogFactory, AnalogSensor};
pub use digital::{DigitalInput, DigitalInputFactory, DigitalOutput, DigitalOutputFactory};
pub use factory::{
    DriverDescriptor, DriverFactory, DriverRegistry, InterruptSource, SensorComponents, SensorSpec,
};
pub use line_sensor::{nmea_checksum_ok, UartLines, UartLinesConfig, UartLinesFactory};
pub use pulse_counter::{PulseCounter, PulseCounterConfig, PulseCounterFactory};
pub use register::{RegisterConfig, RegisterFactory, RegisterSensor};
