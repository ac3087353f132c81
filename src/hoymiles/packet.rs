use super::RadioAddress;
use crate::prelude::*;

use nom_derive::{Nom, Parse};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

pub const MAX_PACKET_SIZE: usize = 32;
pub const MAX_PAYLOAD_PER_PACKET: usize = 16;
/// Info request size before byte stuffing.
pub const REQUEST_FRAME_LEN: usize = 27;

/// Response command = request command with this bit set; the same bit
/// marks the last fragment in the frame counter byte.
pub const RESPONSE_FLAG: u8 = 0x80;
pub const LAST_FRAME_FLAG: u8 = 0x80;

/// Channels the inverter listens on for requests, hopped in this order
/// on retries.
pub const TX_CHANNELS: [u8; 5] = [3, 23, 40, 61, 75];

/// Channels the inverter answers on, depending on the request channel.
pub fn rx_channels_for(tx_channel: u8) -> [u8; 3] {
    match tx_channel {
        3 => [23, 40, 61],
        23 => [40, 61, 75],
        40 => [61, 75, 3],
        61 => [75, 3, 23],
        75 => [3, 23, 40],
        // not a request channel; scan the widest-spread triple
        _ => [3, 40, 75],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    Version = 0x0F,
    Info = 0x15,
    DeviceControl = 0x51,
}

/// CRC8, polynomial 0x01, over a whole packet.
pub fn packet_crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x01
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// CRC16/MODBUS over a reassembled message payload.
pub fn payload_crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(data)
}

/// Byte stuffing applied after checksumming:
/// 0x7D -> 0x7D 0x5D, 0x7E -> 0x7D 0x5E, 0x7F -> 0x7D 0x5F.
pub fn escape_data(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for &b in input {
        match b {
            0x7D => output.extend_from_slice(&[0x7D, 0x5D]),
            0x7E => output.extend_from_slice(&[0x7D, 0x5E]),
            0x7F => output.extend_from_slice(&[0x7D, 0x5F]),
            _ => output.push(b),
        }
    }
    output
}

pub fn unescape_data(input: &[u8]) -> Result<Vec<u8>, FragmentError> {
    let mut output = Vec::with_capacity(input.len());
    let mut idx = 0;
    while idx < input.len() {
        let b = input[idx];
        if b == 0x7D {
            idx += 1;
            match input.get(idx).copied() {
                Some(0x5D) => output.push(0x7D),
                Some(0x5E) => output.push(0x7E),
                Some(0x5F) => output.push(0x7F),
                _ => return Err(FragmentError::Escape),
            }
        } else {
            output.push(b);
        }
        idx += 1;
    }
    Ok(output)
}

fn packet_header(command: Command, receiver: &RadioAddress, sender: &RadioAddress, frame: u8) -> [u8; 10] {
    let mut header = [0u8; 10];
    header[0] = command.into();
    header[1..5].copy_from_slice(receiver.as_bytes());
    header[5..9].copy_from_slice(sender.as_bytes());
    header[9] = frame;
    header
}

/// Builds the escaped live-data request. The sequence number rides in
/// the payload's time field, stamping the in-flight exchange.
pub fn build_info_request(receiver: &RadioAddress, sender: &RadioAddress, seq: u32) -> Vec<u8> {
    let mut packet = packet_header(Command::Info, receiver, sender, LAST_FRAME_FLAG).to_vec();

    let mut payload = [0u8; 14];
    payload[0] = 0x0B; // sub command: live data
    payload[1] = 0x00; // revision
    payload[2..6].copy_from_slice(&seq.to_be_bytes());
    payload[9] = 0x05;
    packet.extend_from_slice(&payload);

    packet.extend_from_slice(&payload_crc16(&payload).to_be_bytes());
    let crc8 = packet_crc8(&packet);
    packet.push(crc8);

    debug_assert_eq!(packet.len(), REQUEST_FRAME_LEN);
    escape_data(&packet)
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FragmentError {
    #[error("fragment too short: {0} bytes")]
    TooShort(usize),

    #[error("fragment checksum mismatch")]
    Checksum,

    #[error("invalid escape sequence in fragment")]
    Escape,

    #[error("fragment addressed to a different device")]
    Address,

    #[error("unexpected response command {0:#04x}")]
    Command(u8),
}

/// One validated piece of a multi-part response. The sequence tag is
/// the in-flight request's; a fragment surviving parse but belonging to
/// an earlier exchange is weeded out by the link state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub seq: u32,
    pub index: u8,
    pub last: bool,
    pub payload: Vec<u8>,
}

/// Unescapes and validates one received packet: own CRC8, response
/// command, and both address fields must match the polled inverter.
pub fn parse_fragment(
    raw: &[u8],
    inverter: &RadioAddress,
    command: Command,
    seq: u32,
) -> Result<Fragment, FragmentError> {
    let data = unescape_data(raw)?;
    if data.len() < 12 {
        return Err(FragmentError::TooShort(data.len()));
    }

    let (body, crc) = data.split_at(data.len() - 1);
    if packet_crc8(body) != crc[0] {
        return Err(FragmentError::Checksum);
    }

    let expected = u8::from(command) | RESPONSE_FLAG;
    if body[0] != expected {
        return Err(FragmentError::Command(body[0]));
    }

    if &body[1..5] != inverter.as_bytes() || &body[5..9] != inverter.as_bytes() {
        return Err(FragmentError::Address);
    }

    Ok(Fragment {
        seq,
        index: body[9] & !LAST_FRAME_FLAG,
        last: body[9] & LAST_FRAME_FLAG != 0,
        payload: body[10..].to_vec(),
    })
}

/// Collects the fragments of one exchange until every index up to the
/// flagged last one is present. Dropped wholesale when the attempt ends.
#[derive(Debug)]
pub struct FragmentBuffer {
    seq: u32,
    last_index: Option<u8>,
    parts: BTreeMap<u8, Vec<u8>>,
}

impl FragmentBuffer {
    pub fn new(seq: u32) -> Self {
        Self {
            seq,
            last_index: None,
            parts: BTreeMap::new(),
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn received(&self) -> usize {
        self.parts.len()
    }

    pub fn insert(&mut self, fragment: Fragment) {
        debug_assert_eq!(fragment.seq, self.seq);
        if fragment.last {
            self.last_index = Some(fragment.index);
        }
        self.parts.insert(fragment.index, fragment.payload);
    }

    pub fn is_complete(&self) -> bool {
        match self.last_index {
            Some(last) if last >= 1 => (1..=last).all(|i| self.parts.contains_key(&i)),
            _ => false,
        }
    }

    /// Concatenates the payload chunks in index order.
    pub fn assemble(self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut data = Vec::new();
        for (_, part) in self.parts {
            data.extend_from_slice(&part);
        }
        Some(data)
    }
}

/// Checks the CRC16 trailer of a reassembled payload and strips it.
pub fn verify_reassembled(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 2 {
        return None;
    }
    let (body, crc) = data.split_at(data.len() - 2);
    let stored = u16::from_be_bytes([crc[0], crc[1]]);
    if payload_crc16(body) != stored {
        return None;
    }
    Some(body)
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload too short for a {1}-channel reading: {0} bytes")]
    Truncated(usize, usize),

    #[error("decoding for {0}-channel inverters is not implemented")]
    UnsupportedChannelCount(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DcChannel {
    /// V
    pub voltage: f64,
    /// A
    pub current: f64,
    /// W
    pub power: f64,
    /// Wh
    pub energy_day: f64,
    /// kWh
    pub energy_total: f64,
}

/// Live data of one poll, produced only from a reassembled response
/// whose payload checksum verified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InverterReading {
    pub channels: Vec<DcChannel>,
    /// V
    pub ac_voltage: f64,
    /// A
    pub ac_current: f64,
    /// W
    pub ac_power: f64,
    /// var
    pub reactive_power: f64,
    /// Hz
    pub frequency: f64,
    pub power_factor: f64,
    /// °C
    pub temperature: f64,
    pub event_count: u16,
}

// AC block, temperature and event counter trail the DC fields in both
// layouts.
#[derive(Debug, PartialEq, Nom)]
#[nom(BigEndian)]
struct WireTail {
    #[nom(Parse = "Utils::be_u16_div10")]
    ac_voltage: f64,
    #[nom(Parse = "Utils::be_u16_div100")]
    frequency: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    ac_power: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    reactive_power: f64,
    #[nom(Parse = "Utils::be_u16_div100")]
    ac_current: f64,
    #[nom(Parse = "Utils::be_u16_div1000")]
    power_factor: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    temperature: f64,
    event_count: u16,
}

// {{{ WireOneChannel
#[derive(Debug, PartialEq, Nom)]
#[nom(BigEndian)]
struct WireOneChannel {
    #[nom(SkipBefore(2))]
    #[nom(Parse = "Utils::be_u16_div10")]
    dc_voltage: f64,
    #[nom(Parse = "Utils::be_u16_div100")]
    dc_current: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    dc_power: f64,
    #[nom(Parse = "Utils::be_u32_div1000")]
    dc_energy_total: f64,
    #[nom(Parse = "Utils::be_u16_div1")]
    dc_energy_day: f64,
    tail: WireTail,
} // }}}

// {{{ WireTwoChannel
// the HM600/700/800 interleave both inputs' V/I/P before the counters
#[derive(Debug, PartialEq, Nom)]
#[nom(BigEndian)]
struct WireTwoChannel {
    #[nom(SkipBefore(2))]
    #[nom(Parse = "Utils::be_u16_div10")]
    dc1_voltage: f64,
    #[nom(Parse = "Utils::be_u16_div100")]
    dc1_current: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    dc1_power: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    dc2_voltage: f64,
    #[nom(Parse = "Utils::be_u16_div100")]
    dc2_current: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    dc2_power: f64,
    #[nom(Parse = "Utils::be_u32_div1000")]
    dc1_energy_total: f64,
    #[nom(Parse = "Utils::be_u32_div1000")]
    dc2_energy_total: f64,
    #[nom(Parse = "Utils::be_u16_div1")]
    dc1_energy_day: f64,
    #[nom(Parse = "Utils::be_u16_div1")]
    dc2_energy_day: f64,
    tail: WireTail,
} // }}}

/// Decodes a verified payload into physical values. Trailing bytes past
/// the known fields are ignored.
pub fn decode_reading(payload: &[u8], channel_count: usize) -> Result<InverterReading, DecodeError> {
    match channel_count {
        1 => {
            let (_, wire) = WireOneChannel::parse(payload)
                .map_err(|_| DecodeError::Truncated(payload.len(), 1))?;
            Ok(InverterReading {
                channels: vec![DcChannel {
                    voltage: wire.dc_voltage,
                    current: wire.dc_current,
                    power: wire.dc_power,
                    energy_day: wire.dc_energy_day,
                    energy_total: wire.dc_energy_total,
                }],
                ac_voltage: wire.tail.ac_voltage,
                ac_current: wire.tail.ac_current,
                ac_power: wire.tail.ac_power,
                reactive_power: wire.tail.reactive_power,
                frequency: wire.tail.frequency,
                power_factor: wire.tail.power_factor,
                temperature: wire.tail.temperature,
                event_count: wire.tail.event_count,
            })
        }
        2 => {
            let (_, wire) = WireTwoChannel::parse(payload)
                .map_err(|_| DecodeError::Truncated(payload.len(), 2))?;
            Ok(InverterReading {
                channels: vec![
                    DcChannel {
                        voltage: wire.dc1_voltage,
                        current: wire.dc1_current,
                        power: wire.dc1_power,
                        energy_day: wire.dc1_energy_day,
                        energy_total: wire.dc1_energy_total,
                    },
                    DcChannel {
                        voltage: wire.dc2_voltage,
                        current: wire.dc2_current,
                        power: wire.dc2_power,
                        energy_day: wire.dc2_energy_day,
                        energy_total: wire.dc2_energy_total,
                    },
                ],
                ac_voltage: wire.tail.ac_voltage,
                ac_current: wire.tail.ac_current,
                ac_power: wire.tail.ac_power,
                reactive_power: wire.tail.reactive_power,
                frequency: wire.tail.frequency,
                power_factor: wire.tail.power_factor,
                temperature: wire.tail.temperature,
                event_count: wire.tail.event_count,
            })
        }
        n => Err(DecodeError::UnsupportedChannelCount(n)),
    }
}
