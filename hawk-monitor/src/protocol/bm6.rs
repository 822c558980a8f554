//! Encrypted monitor codec
//!
//! Commands are short ASCII-hex opcodes right-padded with zeros to one
//! cipher block, then encrypted. Responses arrive as encrypted blocks; the
//! decrypted layout of the realtime frame is:
//!
//! ```text
//! offset 0..3   opcode d1 55 07
//! offset 3      temperature sign flag (0x01 = below zero)
//! offset 4..6   temperature, u16 BE, tenths of °C
//! offset 6..8   state of charge, u16 BE, percent
//! offset 8..10  voltage, u16 BE, centivolts
//! offset 10..   zero padding
//! ```
//!
//! Basic info (`d1 55 08`) carries capacity, cycles and the firmware
//! triplet; cell voltages (`d1 55 09`) carry a count byte and up to six
//! u16 BE millivolt values.

use tracing::debug;

use crate::crypto::{self, BLOCK_LEN};
use crate::error::ProtocolError;
use crate::protocol::{BasicInfo, Frame, RequestKind};
use crate::reading::Reading;

/// ASCII-hex request opcodes
pub mod opcode {
    /// Voltage / temperature / state of charge
    pub const REALTIME: &str = "d15507";
    /// Capacity, cycles, firmware version
    pub const BASIC_INFO: &str = "d15508";
    /// Per-cell voltages
    pub const CELL_VOLTAGES: &str = "d15509";
}

/// Maximum cells a cell-voltage frame can carry
pub const MAX_CELLS: usize = 6;

/// Build an encrypted request block for `kind`
pub fn build_request(kind: RequestKind) -> Result<Vec<u8>, ProtocolError> {
    let op = match kind {
        RequestKind::VoltageTempSoc => opcode::REALTIME,
        RequestKind::BasicInfo => opcode::BASIC_INFO,
        RequestKind::CellVoltages => opcode::CELL_VOLTAGES,
    };
    let padded = format!("{op:0<32}");
    let plain = hex::decode(&padded)
        .map_err(|e| ProtocolError::Framing(format!("opcode encoding: {e}")))?;
    crypto::encrypt(&plain)
}

fn be_u16(frame: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([frame[offset], frame[offset + 1]])
}

/// Decrypt and decode one notification.
///
/// Only the first block carries the frame; devices pad long notifications
/// with zero blocks which are ignored here.
pub fn parse_notification(raw: &[u8]) -> Result<Frame, ProtocolError> {
    let plain = crypto::decrypt(raw)?;
    let block = &plain[..BLOCK_LEN];

    if block[0] != 0xD1 || block[1] != 0x55 {
        debug!("Ignoring foreign frame: {}", hex::encode(block));
        return Ok(Frame::Ignored {
            opcode: hex::encode(&block[..3]),
        });
    }

    match block[2] {
        0x07 => parse_realtime(block),
        0x08 => parse_basic_info(block),
        0x09 => parse_cell_voltages(block),
        other => {
            debug!("Unknown encrypted-frame type 0x{:02x}", other);
            Ok(Frame::Ignored {
                opcode: hex::encode(&block[..3]),
            })
        }
    }
}

fn parse_realtime(block: &[u8]) -> Result<Frame, ProtocolError> {
    let sign = match block[3] {
        0x00 => 1.0,
        0x01 => -1.0,
        other => {
            return Err(ProtocolError::parse(
                format!("bad temperature sign flag 0x{other:02x}"),
                block,
            ))
        }
    };
    let temperature = sign * f64::from(be_u16(block, 4)) / 10.0;
    let state_of_charge = f64::from(be_u16(block, 6));
    let voltage = f64::from(be_u16(block, 8)) / 100.0;

    // The encrypted family reports no current
    let reading = Reading::new("bm6", voltage, 0.0, temperature, state_of_charge);
    Ok(Frame::Reading(reading.validated(block)?))
}

fn parse_basic_info(block: &[u8]) -> Result<Frame, ProtocolError> {
    Ok(Frame::BasicInfo(BasicInfo {
        capacity_ah: f64::from(be_u16(block, 3)) / 10.0,
        cycles: u32::from(be_u16(block, 5)),
        firmware: format!("{}.{}.{}", block[7], block[8], block[9]),
    }))
}

fn parse_cell_voltages(block: &[u8]) -> Result<Frame, ProtocolError> {
    let count = block[3] as usize;
    if count > MAX_CELLS {
        return Err(ProtocolError::parse(
            format!("cell count {count} exceeds {MAX_CELLS}"),
            block,
        ));
    }
    let cells = (0..count)
        .map(|i| f64::from(be_u16(block, 4 + 2 * i)) / 1000.0)
        .collect();
    Ok(Frame::CellVoltages(cells))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::bm6_realtime_frame;

    #[test]
    fn realtime_roundtrip() {
        let frame = bm6_realtime_frame(12.60, 25.1, 85.0);
        let parsed = parse_notification(&frame).unwrap();
        let Frame::Reading(reading) = parsed else {
            panic!("expected a reading");
        };
        assert_eq!(reading.voltage, 12.60);
        assert_eq!(reading.temperature, 25.1);
        assert_eq!(reading.state_of_charge, 85.0);
        assert_eq!(reading.current, 0.0);
        assert_eq!(reading.protocol, "bm6");
    }

    #[test]
    fn negative_temperature_sign() {
        let frame = bm6_realtime_frame(12.00, -5.5, 40.0);
        let Frame::Reading(reading) = parse_notification(&frame).unwrap() else {
            panic!("expected a reading");
        };
        assert_eq!(reading.temperature, -5.5);
    }

    #[test]
    fn out_of_range_soc_is_rejected_with_raw_block() {
        let frame = bm6_realtime_frame(12.60, 25.1, 250.0);
        let err = parse_notification(&frame).unwrap_err();
        match err {
            ProtocolError::Parse { reason, raw } => {
                assert!(reason.contains("state of charge"));
                assert!(!raw.is_empty());
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn bad_sign_flag_is_rejected() {
        let mut block = [0u8; BLOCK_LEN];
        block[..3].copy_from_slice(&[0xD1, 0x55, 0x07]);
        block[3] = 0x5A;
        let frame = crypto::encrypt(&block).unwrap();
        assert!(matches!(
            parse_notification(&frame),
            Err(ProtocolError::Parse { .. })
        ));
    }

    #[test]
    fn basic_info_fields() {
        let mut block = [0u8; BLOCK_LEN];
        block[..3].copy_from_slice(&[0xD1, 0x55, 0x08]);
        block[3..5].copy_from_slice(&1000u16.to_be_bytes()); // 100.0 Ah
        block[5..7].copy_from_slice(&42u16.to_be_bytes());
        block[7..10].copy_from_slice(&[1, 4, 2]);
        let frame = crypto::encrypt(&block).unwrap();
        let Frame::BasicInfo(info) = parse_notification(&frame).unwrap() else {
            panic!("expected basic info");
        };
        assert_eq!(info.capacity_ah, 100.0);
        assert_eq!(info.cycles, 42);
        assert_eq!(info.firmware, "1.4.2");
    }

    #[test]
    fn cell_voltages_frame() {
        let mut block = [0u8; BLOCK_LEN];
        block[..3].copy_from_slice(&[0xD1, 0x55, 0x09]);
        block[3] = 4;
        for (i, mv) in [3312u16, 3308, 3315, 3301].iter().enumerate() {
            block[4 + 2 * i..6 + 2 * i].copy_from_slice(&mv.to_be_bytes());
        }
        let frame = crypto::encrypt(&block).unwrap();
        let Frame::CellVoltages(cells) = parse_notification(&frame).unwrap() else {
            panic!("expected cell voltages");
        };
        assert_eq!(cells, vec![3.312, 3.308, 3.315, 3.301]);
    }

    #[test]
    fn unknown_type_is_ignored_not_fatal() {
        let mut block = [0u8; BLOCK_LEN];
        block[..3].copy_from_slice(&[0xD1, 0x55, 0x7E]);
        let frame = crypto::encrypt(&block).unwrap();
        assert!(matches!(
            parse_notification(&frame),
            Ok(Frame::Ignored { .. })
        ));
    }

    #[test]
    fn short_notification_is_framing_error() {
        assert!(matches!(
            parse_notification(&[0xD1, 0x55, 0x07]),
            Err(ProtocolError::Framing(_))
        ));
    }

    #[test]
    fn requests_are_one_encrypted_block() {
        for kind in [
            RequestKind::VoltageTempSoc,
            RequestKind::BasicInfo,
            RequestKind::CellVoltages,
        ] {
            let payload = build_request(kind).unwrap();
            assert_eq!(payload.len(), BLOCK_LEN);
            // Opcode survives the trip back
            let plain = crypto::decrypt(&payload).unwrap();
            assert_eq!(plain[0], 0xD1);
            assert_eq!(plain[1], 0x55);
            assert!(plain[3..].iter().all(|b| *b == 0));
        }
    }
}
