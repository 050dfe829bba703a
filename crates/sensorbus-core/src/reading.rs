//! Readings and timestamped samples.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single value produced by a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reading {
    /// Physical quantity with a unit
    Scalar { value: f64, unit: String },
    /// Logic level
    Digital { level: bool },
    /// Event count
    Count { count: u64 },
    /// Three-axis vector (accelerometers, magnetometers)
    Vector3 { x: f64, y: f64, z: f64, unit: String },
    /// A text line, e.g. an NMEA sentence
    Text { line: String },
}

impl Reading {
    /// Scalar reading shorthand.
    pub fn scalar(value: f64, unit: impl Into<String>) -> Self {
        Reading::Scalar {
            value,
            unit: unit.into(),
        }
    }

    /// Short kind label used in CSV rows and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Reading::Scalar { .. } => "scalar",
            Reading::Digital { .. } => "digital",
            Reading::Count { .. } => "count",
            Reading::Vector3 { .. } => "vector3",
            Reading::Text { .. } => "text",
        }
    }

    /// Unit, or an empty string for unitless readings.
    pub fn unit(&self) -> &str {
        match self {
            Reading::Scalar { unit, .. } | Reading::Vector3 { unit, .. } => unit,
            _ => "",
        }
    }

    /// Numeric view where one exists.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Reading::Scalar { value, .. } => Some(*value),
            Reading::Digital { level } => Some(if *level { 1.0 } else { 0.0 }),
            Reading::Count { count } => Some(*count as f64),
            Reading::Vector3 { .. } | Reading::Text { .. } => None,
        }
    }

    /// Value column as text, without the unit.
    pub fn value_text(&self) -> String {
        match self {
            Reading::Scalar { value, .. } => format!("{}", value),
            Reading::Digital { level } => if *level { "1" } else { "0" }.to_string(),
            Reading::Count { count } => count.to_string(),
            Reading::Vector3 { x, y, z, .. } => format!("{} {} {}", x, y, z),
            Reading::Text { line } => line.clone(),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Scalar { value, unit } if unit.is_empty() => write!(f, "{:.3}", value),
            Reading::Scalar { value, unit } => write!(f, "{:.3} {}", value, unit),
            Reading::Digital { level } => write!(f, "{}", if *level { "HIGH" } else { "LOW" }),
            Reading::Count { count } => write!(f, "{} events", count),
            Reading::Vector3 { x, y, z, unit } => {
                write!(f, "({:.3}, {:.3}, {:.3}) {}", x, y, z, unit)
            }
            Reading::Text { line } => write!(f, "{}", line),
        }
    }
}

/// A reading stamped with its sensor id and acquisition time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sensor: String,
    pub timestamp: DateTime<Utc>,
    pub reading: Reading,
}

impl Sample {
    /// Stamp a reading with the current time.
    pub fn now(sensor: impl Into<String>, reading: Reading) -> Self {
        Self {
            sensor: sensor.into(),
            timestamp: Utc::now(),
            reading,
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.sensor,
            self.reading
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_views() {
        let r = Reading::scalar(2.5, "V");
        assert_eq!(r.kind(), "scalar");
        assert_eq!(r.unit(), "V");
        assert_eq!(r.as_f64(), Some(2.5));
        assert_eq!(r.to_string(), "2.500 V");

        let d = Reading::Digital { level: true };
        assert_eq!(d.as_f64(), Some(1.0));
        assert_eq!(d.value_text(), "1");
        assert_eq!(d.to_string(), "HIGH");

        let t = Reading::Text {
            line: "$GPGGA,1*00".into(),
        };
        assert_eq!(t.as_f64(), None);
        assert_eq!(t.unit(), "");
    }

    #[test]
    fn test_sample_serializes_with_kind_tag() {
        let sample = Sample::now("counter", Reading::Count { count: 5 });
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["sensor"], "counter");
        assert_eq!(json["reading"]["kind"], "count");
        assert_eq!(json["reading"]["count"], 5);
    }
}
