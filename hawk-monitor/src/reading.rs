//! Canonical battery reading

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Physical plausibility limits; anything outside is a parse error
pub mod limits {
    /// Pack voltage in volts
    pub const VOLTAGE_MAX: f64 = 100.0;
    /// Absolute current in amperes
    pub const CURRENT_ABS_MAX: f64 = 1000.0;
    /// Temperature in °C
    pub const TEMPERATURE_MIN: f64 = -40.0;
    pub const TEMPERATURE_MAX: f64 = 125.0;
}

/// One canonical battery measurement.
///
/// Produced only by the protocol parsers, never mutated afterwards.
/// A constructed value always satisfies the range invariants: the parsers
/// run [`Reading::validated`] before letting one escape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Pack voltage in volts
    pub voltage: f64,
    /// Current in amperes, signed; positive while charging
    pub current: f64,
    /// Temperature in °C
    pub temperature: f64,
    /// State of charge in percent
    pub state_of_charge: f64,
    /// Rated or residual capacity in ampere-hours
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<f64>,
    /// Lifetime charge cycles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycles: Option<u32>,
    /// Tag of the protocol family that produced the reading
    pub protocol: String,
    /// Capture time, UTC
    pub timestamp: DateTime<Utc>,
    /// Protocol-specific fields (cell voltages and the like)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Reading {
    /// Build a reading with the mandatory fields; optional ones start empty
    pub fn new(
        protocol: &str,
        voltage: f64,
        current: f64,
        temperature: f64,
        state_of_charge: f64,
    ) -> Self {
        Self {
            voltage,
            current,
            temperature,
            state_of_charge,
            capacity: None,
            cycles: None,
            protocol: protocol.to_string(),
            timestamp: Utc::now(),
            extra: Map::new(),
        }
    }

    /// Instantaneous power in watts
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }

    /// Enforce the range invariants, consuming the candidate.
    ///
    /// `raw` is the frame the values came from; it ends up hex-encoded in
    /// the error for diagnostics.
    pub fn validated(self, raw: &[u8]) -> Result<Self, ProtocolError> {
        let checks = [
            ("voltage", self.voltage),
            ("current", self.current),
            ("temperature", self.temperature),
            ("state_of_charge", self.state_of_charge),
        ];
        for (field, value) in checks {
            if value.is_nan() {
                return Err(ProtocolError::parse(format!("{field} is NaN"), raw));
            }
        }
        if !(0.0..=limits::VOLTAGE_MAX).contains(&self.voltage) {
            return Err(ProtocolError::parse(
                format!("voltage {} out of range", self.voltage),
                raw,
            ));
        }
        if self.current.abs() > limits::CURRENT_ABS_MAX {
            return Err(ProtocolError::parse(
                format!("current {} out of range", self.current),
                raw,
            ));
        }
        if !(limits::TEMPERATURE_MIN..=limits::TEMPERATURE_MAX).contains(&self.temperature) {
            return Err(ProtocolError::parse(
                format!("temperature {} out of range", self.temperature),
                raw,
            ));
        }
        if !(0.0..=100.0).contains(&self.state_of_charge) {
            return Err(ProtocolError::parse(
                format!("state of charge {} out of range", self.state_of_charge),
                raw,
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_range_reading_passes() {
        let r = Reading::new("bm6", 12.6, 0.0, 25.1, 85.0)
            .validated(&[0u8; 16])
            .unwrap();
        assert_eq!(r.voltage, 12.6);
        assert!(r.capacity.is_none());
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let cases = [
            Reading::new("bm6", -0.1, 0.0, 25.0, 50.0),
            Reading::new("bm6", 101.0, 0.0, 25.0, 50.0),
            Reading::new("bm2", 12.0, 1001.0, 25.0, 50.0),
            Reading::new("bm2", 12.0, 0.0, -41.0, 50.0),
            Reading::new("bm2", 12.0, 0.0, 126.0, 50.0),
            Reading::new("bm6", 12.0, 0.0, 25.0, 250.0),
            Reading::new("bm6", f64::NAN, 0.0, 25.0, 50.0),
        ];
        for reading in cases {
            assert!(matches!(
                reading.validated(&[0u8; 16]),
                Err(ProtocolError::Parse { .. })
            ));
        }
    }
}
