//! Legacy framed monitor codec (BM2 and generic)
//!
//! Requests: `DD A5 <cmd> <len> <data…> <ck> 77` where the checksum is the
//! additive complement `0xFF - (sum(cmd, len, data) & 0xFF)`. Responses
//! replace the `A5` marker with a status byte position:
//! `DD <cmd> <status> <len> <payload…> <ck> 77`, checksum over everything
//! between the markers. Basic-info payload layout:
//!
//! ```text
//! offset 0..2   voltage, u16 BE, centivolts
//! offset 2..4   current, i16 BE, centiamps (positive charging)
//! offset 4..6   state of charge, u16 BE, percent
//! offset 6..8   temperature, i16 BE, tenths of °C
//! offset 8..10  capacity, u16 BE, tenths of Ah
//! offset 10..12 cycle count, u16 BE
//! ```

use tracing::debug;

use crate::error::ProtocolError;
use crate::protocol::{Frame, RequestKind};
use crate::reading::Reading;

/// Command bytes
pub mod cmd {
    /// Voltage, current, SoC, temperature, capacity, cycles
    pub const BASIC_INFO: u8 = 0x03;
    /// Per-cell voltages
    pub const CELL_VOLTAGES: u8 = 0x04;
}

const REQ_START: [u8; 2] = [0xDD, 0xA5];
const RESP_START: u8 = 0xDD;
const END: u8 = 0x77;
const BASIC_INFO_LEN: usize = 12;

/// Additive-complement checksum over the marker-free body
pub fn checksum(body: &[u8]) -> u8 {
    let sum: u32 = body.iter().map(|b| u32::from(*b)).sum();
    0xFFu8.wrapping_sub((sum % 0x100) as u8)
}

/// Build a framed request for `kind`
pub fn build_request(kind: RequestKind) -> Result<Vec<u8>, ProtocolError> {
    let command = match kind {
        // The legacy basic-info frame already carries voltage/temp/SoC
        RequestKind::VoltageTempSoc | RequestKind::BasicInfo => cmd::BASIC_INFO,
        RequestKind::CellVoltages => cmd::CELL_VOLTAGES,
    };
    let mut frame = Vec::with_capacity(6);
    frame.extend_from_slice(&REQ_START);
    frame.push(command);
    frame.push(0x00);
    frame.push(checksum(&[command, 0x00]));
    frame.push(END);
    Ok(frame)
}

/// Validate markers, length, and checksum, then dispatch on the command byte
pub fn parse_notification(tag: &str, raw: &[u8]) -> Result<Frame, ProtocolError> {
    if raw.len() < 6 {
        return Err(ProtocolError::Framing(format!(
            "frame too short: {} bytes",
            raw.len()
        )));
    }
    if raw[0] != RESP_START {
        return Err(ProtocolError::Framing(format!(
            "bad start marker 0x{:02x}",
            raw[0]
        )));
    }
    if raw[raw.len() - 1] != END {
        return Err(ProtocolError::Framing(format!(
            "bad end marker 0x{:02x}",
            raw[raw.len() - 1]
        )));
    }

    let command = raw[1];
    let status = raw[2];
    let payload_len = raw[3] as usize;
    if raw.len() != payload_len + 6 {
        return Err(ProtocolError::Framing(format!(
            "length byte {} does not match frame of {} bytes",
            payload_len,
            raw.len()
        )));
    }

    let body = &raw[1..4 + payload_len];
    let expected = checksum(body);
    let actual = raw[4 + payload_len];
    if expected != actual {
        return Err(ProtocolError::Framing(format!(
            "checksum mismatch: expected 0x{expected:02x}, got 0x{actual:02x}"
        )));
    }

    if status != 0x00 {
        return Err(ProtocolError::parse(
            format!("device reported status 0x{status:02x}"),
            raw,
        ));
    }

    let payload = &raw[4..4 + payload_len];
    match command {
        cmd::BASIC_INFO => parse_basic_info(tag, payload, raw),
        cmd::CELL_VOLTAGES => parse_cell_voltages(payload, raw),
        other => {
            // Variant command bytes exist in the field; tolerate them
            debug!("Unknown framed command 0x{:02x}", other);
            Ok(Frame::Ignored {
                opcode: format!("{other:02x}"),
            })
        }
    }
}

fn be_u16(payload: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([payload[offset], payload[offset + 1]])
}

fn be_i16(payload: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([payload[offset], payload[offset + 1]])
}

fn parse_basic_info(tag: &str, payload: &[u8], raw: &[u8]) -> Result<Frame, ProtocolError> {
    if payload.len() < BASIC_INFO_LEN {
        return Err(ProtocolError::parse(
            format!("basic-info payload of {} bytes", payload.len()),
            raw,
        ));
    }
    let voltage = f64::from(be_u16(payload, 0)) / 100.0;
    let current = f64::from(be_i16(payload, 2)) / 100.0;
    let state_of_charge = f64::from(be_u16(payload, 4));
    let temperature = f64::from(be_i16(payload, 6)) / 10.0;

    let mut reading = Reading::new(tag, voltage, current, temperature, state_of_charge);
    reading.capacity = Some(f64::from(be_u16(payload, 8)) / 10.0);
    reading.cycles = Some(u32::from(be_u16(payload, 10)));
    Ok(Frame::Reading(reading.validated(raw)?))
}

fn parse_cell_voltages(payload: &[u8], raw: &[u8]) -> Result<Frame, ProtocolError> {
    if payload.is_empty() || payload.len() % 2 != 0 {
        return Err(ProtocolError::parse(
            format!("cell payload of {} bytes", payload.len()),
            raw,
        ));
    }
    let cells = payload
        .chunks(2)
        .map(|c| f64::from(u16::from_be_bytes([c[0], c[1]])) / 1000.0)
        .collect();
    Ok(Frame::CellVoltages(cells))
}
