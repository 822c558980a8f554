//! Reference device image
//!
//! Builds the notification frames real monitors emit and wires them into
//! [`hawk_transport::mock::MockTransport`] as a responder, so the whole
//! stack from pool to session can be exercised against scripted firmware.

use std::sync::Arc;

use parking_lot::Mutex;

use hawk_transport::mock::Responder;

use crate::crypto::{self, BLOCK_LEN};
use crate::protocol::{legacy, ProtocolFamily};

/// Encrypted realtime frame carrying voltage/temperature/SoC
pub fn bm6_realtime_frame(voltage: f64, temperature: f64, state_of_charge: f64) -> Vec<u8> {
    let mut block = [0u8; BLOCK_LEN];
    block[..3].copy_from_slice(&[0xD1, 0x55, 0x07]);
    block[3] = if temperature < 0.0 { 0x01 } else { 0x00 };
    block[4..6].copy_from_slice(&((temperature.abs() * 10.0).round() as u16).to_be_bytes());
    block[6..8].copy_from_slice(&(state_of_charge.round() as u16).to_be_bytes());
    block[8..10].copy_from_slice(&((voltage * 100.0).round() as u16).to_be_bytes());
    crypto::encrypt(&block).expect("block-sized frame")
}

/// Encrypted basic-info frame
pub fn bm6_basic_info_frame(capacity_ah: f64, cycles: u16, firmware: [u8; 3]) -> Vec<u8> {
    let mut block = [0u8; BLOCK_LEN];
    block[..3].copy_from_slice(&[0xD1, 0x55, 0x08]);
    block[3..5].copy_from_slice(&((capacity_ah * 10.0).round() as u16).to_be_bytes());
    block[5..7].copy_from_slice(&cycles.to_be_bytes());
    block[7..10].copy_from_slice(&firmware);
    crypto::encrypt(&block).expect("block-sized frame")
}

/// Encrypted cell-voltage frame (millivolts per cell, at most six)
pub fn bm6_cell_frame(cells_mv: &[u16]) -> Vec<u8> {
    let mut block = [0u8; BLOCK_LEN];
    block[..3].copy_from_slice(&[0xD1, 0x55, 0x09]);
    block[3] = cells_mv.len() as u8;
    for (i, mv) in cells_mv.iter().enumerate() {
        block[4 + 2 * i..6 + 2 * i].copy_from_slice(&mv.to_be_bytes());
    }
    crypto::encrypt(&block).expect("block-sized frame")
}

/// Legacy framed basic-info response
pub fn legacy_basic_info_frame(
    voltage: f64,
    current: f64,
    state_of_charge: f64,
    temperature: f64,
    capacity_ah: f64,
    cycles: u16,
) -> Vec<u8> {
    let mut payload = [0u8; 12];
    payload[0..2].copy_from_slice(&((voltage * 100.0).round() as u16).to_be_bytes());
    payload[2..4].copy_from_slice(&((current * 100.0).round() as i16).to_be_bytes());
    payload[4..6].copy_from_slice(&(state_of_charge.round() as u16).to_be_bytes());
    payload[6..8].copy_from_slice(&((temperature * 10.0).round() as i16).to_be_bytes());
    payload[8..10].copy_from_slice(&((capacity_ah * 10.0).round() as u16).to_be_bytes());
    payload[10..12].copy_from_slice(&cycles.to_be_bytes());
    legacy_response_frame(legacy::cmd::BASIC_INFO, &payload)
}

/// Legacy framed cell-voltage response
pub fn legacy_cell_frame(cells_mv: &[u16]) -> Vec<u8> {
    let payload: Vec<u8> = cells_mv.iter().flat_map(|mv| mv.to_be_bytes()).collect();
    legacy_response_frame(legacy::cmd::CELL_VOLTAGES, &payload)
}

/// Seal a payload into the response framing with a valid checksum
pub fn legacy_response_frame(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0xDD, command, 0x00, payload.len() as u8];
    frame.extend_from_slice(payload);
    frame.push(legacy::checksum(&frame[1..]));
    frame.push(0x77);
    frame
}

/// Mutable state of an emulated encrypted monitor
#[derive(Debug, Clone)]
pub struct Bm6Device {
    pub voltage: f64,
    pub temperature: f64,
    pub state_of_charge: f64,
    pub capacity_ah: f64,
    pub cycles: u16,
    pub firmware: [u8; 3],
}

impl Default for Bm6Device {
    fn default() -> Self {
        Self {
            voltage: 12.60,
            temperature: 25.1,
            state_of_charge: 85.0,
            capacity_ah: 60.0,
            cycles: 12,
            firmware: [1, 4, 2],
        }
    }
}

impl Bm6Device {
    /// Responder for the mock transport that answers like the firmware.
    ///
    /// Keep a clone of the `Arc` to mutate readings between polls.
    pub fn responder(device: Arc<Mutex<Bm6Device>>) -> Responder {
        let write_char = ProtocolFamily::Bm6.write_characteristic();
        let notify_char = ProtocolFamily::Bm6.notify_characteristic();
        Arc::new(move |_, characteristic, payload| {
            if characteristic != write_char {
                return Vec::new();
            }
            let Ok(plain) = crypto::decrypt(payload) else {
                return Vec::new();
            };
            let state = device.lock().clone();
            let frame = match &plain[..3] {
                [0xD1, 0x55, 0x07] => bm6_realtime_frame(
                    state.voltage,
                    state.temperature,
                    state.state_of_charge,
                ),
                [0xD1, 0x55, 0x08] => {
                    bm6_basic_info_frame(state.capacity_ah, state.cycles, state.firmware)
                }
                [0xD1, 0x55, 0x09] => bm6_cell_frame(&[3312, 3308, 3315, 3301]),
                _ => return Vec::new(),
            };
            vec![(notify_char, frame)]
        })
    }
}
