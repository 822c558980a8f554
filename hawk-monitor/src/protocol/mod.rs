//! Protocol families and their wire codecs
//!
//! Two codecs cover the supported monitors: the encrypted BM6 family
//! ([`bm6`]) and the legacy framed family used by BM2 and generic monitors
//! ([`legacy`]). A [`ProtocolFamily`] value tags each device and dispatches
//! to the right codec; sessions are parameterized by exactly one family.

pub mod bm6;
pub mod legacy;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::reading::Reading;

/// Requests a session can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Voltage, temperature and state of charge
    VoltageTempSoc,
    /// Capacity, cycle count, firmware version
    BasicInfo,
    /// Per-cell voltages
    CellVoltages,
}

impl RequestKind {
    /// Stable label for logs and the runtime status surface
    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::VoltageTempSoc => "voltage_temp_soc",
            RequestKind::BasicInfo => "basic_info",
            RequestKind::CellVoltages => "cell_voltages",
        }
    }
}

/// Static device information from a basic-info response
#[derive(Debug, Clone, PartialEq)]
pub struct BasicInfo {
    /// Rated capacity in ampere-hours
    pub capacity_ah: f64,
    /// Lifetime charge cycles
    pub cycles: u32,
    /// Firmware version triplet
    pub firmware: String,
}

/// One decoded notification
#[derive(Debug, Clone)]
pub enum Frame {
    /// A validated battery reading
    Reading(Reading),
    /// Device information
    BasicInfo(BasicInfo),
    /// Per-cell voltages in volts
    CellVoltages(Vec<f64>),
    /// Well-formed frame of a type the codec does not know
    Ignored {
        /// Hex-encoded opcode for the log line
        opcode: String,
    },
}

/// Supported monitor families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    /// Encrypted monitor (AES frames)
    Bm6,
    /// Legacy framed monitor
    Bm2,
    /// Unidentified monitor speaking the legacy framing
    Generic,
}

// 16-bit characteristic UUIDs on the Bluetooth base
const BM6_WRITE_CHAR: Uuid = Uuid::from_u128(0x0000FFF3_0000_1000_8000_00805F9B34FB);
const BM6_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x0000FFF4_0000_1000_8000_00805F9B34FB);
const LEGACY_WRITE_CHAR: Uuid = Uuid::from_u128(0x0000FF02_0000_1000_8000_00805F9B34FB);
const LEGACY_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x0000FF01_0000_1000_8000_00805F9B34FB);

impl ProtocolFamily {
    /// Tag recorded on every reading this family produces
    pub fn protocol_tag(&self) -> &'static str {
        match self {
            ProtocolFamily::Bm6 => "bm6",
            ProtocolFamily::Bm2 => "bm2",
            ProtocolFamily::Generic => "generic",
        }
    }

    /// Characteristic commands are written to
    pub fn write_characteristic(&self) -> Uuid {
        match self {
            ProtocolFamily::Bm6 => BM6_WRITE_CHAR,
            ProtocolFamily::Bm2 | ProtocolFamily::Generic => LEGACY_WRITE_CHAR,
        }
    }

    /// Characteristic responses arrive on
    pub fn notify_characteristic(&self) -> Uuid {
        match self {
            ProtocolFamily::Bm6 => BM6_NOTIFY_CHAR,
            ProtocolFamily::Bm2 | ProtocolFamily::Generic => LEGACY_NOTIFY_CHAR,
        }
    }

    /// Build the wire payload for a request
    pub fn build_request(&self, kind: RequestKind) -> Result<Vec<u8>, ProtocolError> {
        match self {
            ProtocolFamily::Bm6 => bm6::build_request(kind),
            ProtocolFamily::Bm2 | ProtocolFamily::Generic => legacy::build_request(kind),
        }
    }

    /// Decode one notification into a frame.
    ///
    /// Never panics and never escalates: malformed input comes back as a
    /// `ProtocolError` carrying the raw bytes.
    pub fn parse_notification(&self, raw: &[u8]) -> Result<Frame, ProtocolError> {
        match self {
            ProtocolFamily::Bm6 => bm6::parse_notification(raw),
            ProtocolFamily::Bm2 | ProtocolFamily::Generic => {
                legacy::parse_notification(self.protocol_tag(), raw)
            }
        }
    }

    /// Guess the family from an advertised local name
    pub fn from_advertisement(local_name: Option<&str>) -> Self {
        let Some(name) = local_name else {
            return ProtocolFamily::Generic;
        };
        let upper = name.to_uppercase();
        if upper.starts_with("BM6") {
            ProtocolFamily::Bm6
        } else if upper.starts_with("BM2") || upper.contains("BATTERY MONITOR") {
            ProtocolFamily::Bm2
        } else {
            ProtocolFamily::Generic
        }
    }
}

impl std::fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.protocol_tag())
    }
}
