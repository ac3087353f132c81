use super::value::{MeterReading, ObisCode, ObisValue, SmlValue, Unit};
use super::SmlError;
use chrono::{DateTime, Utc};

pub const ESCAPE_SEQUENCE: [u8; 4] = [0x1B, 0x1B, 0x1B, 0x1B];
pub const VERSION_SEQUENCE: [u8; 4] = [0x01, 0x01, 0x01, 0x01];
pub const END_MARKER: u8 = 0x1A;

const TYPE_OCTET_STRING: u8 = 0;
const TYPE_BOOL: u8 = 4;
const TYPE_INT: u8 = 5;
const TYPE_UINT: u8 = 6;
const TYPE_LIST: u8 = 7;

const MSG_GET_LIST_RESPONSE: i64 = 0x0701;

/// CRC16 CCITT-X.25 over everything but the trailing checksum itself.
pub fn frame_crc(data: &[u8]) -> u16 {
    crc16::State::<crc16::X_25>::calculate(data)
}

/// Decodes one complete framed telegram into its top-level SML messages.
///
/// The frame must start with the escape and version sequences and end with
/// escape + 0x1A + fill count + CRC16 (little-endian). The checksum covers
/// the stuffed wire bytes, so it is verified before unescaping.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<SmlValue>, SmlError> {
    let n = frame.len();
    if n < 16 {
        return Err(SmlError::Truncated(n));
    }
    if frame[0..4] != ESCAPE_SEQUENCE {
        return Err(SmlError::MissingStart);
    }
    if frame[4..8] != VERSION_SEQUENCE {
        return Err(SmlError::MissingVersion);
    }
    if frame[n - 8..n - 4] != ESCAPE_SEQUENCE || frame[n - 4] != END_MARKER {
        return Err(SmlError::MissingEnd);
    }

    let stored = u16::from_le_bytes([frame[n - 2], frame[n - 1]]);
    let computed = frame_crc(&frame[..n - 2]);
    if stored != computed {
        return Err(SmlError::ChecksumMismatch { stored, computed });
    }

    let fill = frame[n - 3] as usize;
    let body_end = n - 8 - fill;
    if body_end < 8 {
        return Err(SmlError::Truncated(n));
    }

    let body = unescape_body(&frame[8..body_end])?;

    let mut messages = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let (message, new_pos, end_of_msg) = decode_value(&body, pos)?;
        if !end_of_msg {
            return Err(SmlError::MissingEndOfMessage);
        }
        messages.push(message);
        pos = new_pos;
    }

    Ok(messages)
}

/// Undoes the transport byte-stuffing: a literal run of four 0x1B bytes in
/// message data is preceded by another escape sequence on the wire.
pub fn unescape_body(data: &[u8]) -> Result<Vec<u8>, SmlError> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0;

    while pos < data.len() {
        if data[pos..].starts_with(&ESCAPE_SEQUENCE) {
            if data[pos + 4..].starts_with(&ESCAPE_SEQUENCE) {
                out.extend_from_slice(&ESCAPE_SEQUENCE);
                pos += 8;
            } else {
                return Err(SmlError::BadEscape { pos });
            }
        } else {
            out.push(data[pos]);
            pos += 1;
        }
    }

    Ok(out)
}

/// Type-length field: type in bits 6..4, length nibble in bits 3..0,
/// bit 7 chains further length nibbles. For primitives the length counts
/// the TL bytes themselves, for lists it counts elements.
fn decode_type_length(data: &[u8], pos: usize) -> Result<(usize, u8, usize), SmlError> {
    let mut tl_size = 1;
    let mut tl = *data.get(pos).ok_or(SmlError::OutOfBounds { pos })?;
    let data_type = (tl & 0x70) >> 4;
    let mut data_len = (tl & 0x0F) as usize;

    let mut p = pos;
    while tl & 0x80 != 0 {
        p += 1;
        tl_size += 1;
        tl = *data.get(p).ok_or(SmlError::OutOfBounds { pos: p })?;
        data_len = (data_len << 4) | (tl & 0x0F) as usize;
    }

    Ok((tl_size, data_type, data_len))
}

fn be_int(bytes: &[u8]) -> i64 {
    let mut v: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in bytes {
        v = (v << 8) | b as i64;
    }
    v
}

fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Decodes one value starting at `pos`. Returns the value, the position
/// after it, and whether it was the end-of-message marker.
fn decode_value(data: &[u8], pos: usize) -> Result<(SmlValue, usize, bool), SmlError> {
    let (tl_size, data_type, data_len) = decode_type_length(data, pos)?;
    let value_start = pos + tl_size;
    let value_end = pos + data_len;

    if data[pos] == 0x00 {
        return Ok((SmlValue::EndOfMessage, pos + 1, true));
    }

    // primitives count their TL bytes in the length, so a chained TL
    // field can also claim less than it occupies
    if data_type != TYPE_LIST && (value_end > data.len() || value_end < value_start) {
        return Err(SmlError::OutOfBounds { pos });
    }

    match data_type {
        TYPE_OCTET_STRING if data_len >= 1 => Ok((
            SmlValue::OctetString(data[value_start..value_end].to_vec()),
            value_end,
            false,
        )),
        TYPE_BOOL if data_len == 2 => {
            Ok((SmlValue::Bool(data[value_start] != 0), value_end, false))
        }
        TYPE_INT if (2..=9).contains(&data_len) => Ok((
            SmlValue::Int(be_int(&data[value_start..value_end])),
            value_end,
            false,
        )),
        TYPE_UINT if (2..=9).contains(&data_len) => Ok((
            SmlValue::UInt(be_uint(&data[value_start..value_end])),
            value_end,
            false,
        )),
        TYPE_LIST => {
            let mut items = Vec::with_capacity(data_len);
            let mut item_pos = value_start;
            let mut end_of_msg = false;

            for _ in 0..data_len {
                let (item, next_pos, end) = decode_value(data, item_pos)?;
                item_pos = next_pos;
                end_of_msg = end;
                if !end_of_msg {
                    items.push(item);
                }
            }

            Ok((SmlValue::List(items), item_pos, end_of_msg))
        }
        _ => Err(SmlError::UnknownType {
            byte: data[pos],
            pos,
        }),
    }
}

/// Projects the GetListResponse messages (type 0x0701) of a decoded frame
/// onto one MeterReading. Entries with unrecognized OBIS codes are kept;
/// other message types are skipped.
pub fn meter_reading_from_messages(
    messages: &[SmlValue],
    received_at: DateTime<Utc>,
) -> MeterReading {
    let mut reading = MeterReading::new(received_at);

    for message in messages {
        // message: [transaction id, group no, abort on error, body, crc]
        let Some(items) = message.as_list() else {
            continue;
        };
        let Some(body) = items.get(3).and_then(SmlValue::as_list) else {
            continue;
        };
        // body: [message type, content]
        if body.first().and_then(SmlValue::as_i64) != Some(MSG_GET_LIST_RESPONSE) {
            continue;
        }
        // content: [client id, server id, list name, sensor time, value list, ...]
        let Some(response) = body.get(1).and_then(SmlValue::as_list) else {
            continue;
        };
        let Some(val_list) = response.get(4).and_then(SmlValue::as_list) else {
            continue;
        };

        for entry in val_list {
            if let Some(value) = obis_value_from_entry(entry) {
                reading.insert(value);
            }
        }
    }

    reading
}

/// entry: [object name, status, value time, unit, scaler, value, signature]
fn obis_value_from_entry(entry: &SmlValue) -> Option<ObisValue> {
    let items = entry.as_list()?;
    if items.len() < 6 {
        return None;
    }

    let code = ObisCode::from_slice(items[0].as_octets()?)?;

    let unit = items[3]
        .as_i64()
        .and_then(|u| u8::try_from(u).ok())
        .and_then(|u| Unit::try_from(u).ok());

    let scaler = match items[4] {
        SmlValue::Int(v) => v as i8,
        _ => 0,
    };

    Some(ObisValue {
        code,
        value: items[5].clone(),
        scaler,
        unit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_length_field() {
        // plain list of 6
        assert_eq!(decode_type_length(&[0x76], 0).unwrap(), (1, 7, 6));
        // chained length nibbles: 0x81 0x04 -> octet string, length 0x14
        assert_eq!(decode_type_length(&[0x81, 0x04], 0).unwrap(), (2, 0, 0x14));
    }

    #[test]
    fn signed_values_sign_extend() {
        assert_eq!(be_int(&[0xFB]), -5);
        assert_eq!(be_int(&[0x00, 0xFB]), 0xFB);
        assert_eq!(be_int(&[0xFF, 0xFE]), -2);
    }

    #[test]
    fn unescape_restores_stuffed_run() {
        let mut data = vec![0x42];
        data.extend_from_slice(&ESCAPE_SEQUENCE);
        data.extend_from_slice(&ESCAPE_SEQUENCE);
        data.push(0x43);

        let out = unescape_body(&data).unwrap();
        assert_eq!(out, vec![0x42, 0x1B, 0x1B, 0x1B, 0x1B, 0x43]);
    }

    #[test]
    fn single_escape_bytes_are_data() {
        // 0x1B on its own is ordinary data, e.g. the unit code for watts
        let out = unescape_body(&[0x62, 0x1B, 0x52, 0xFE]).unwrap();
        assert_eq!(out, vec![0x62, 0x1B, 0x52, 0xFE]);
    }

    #[test]
    fn lone_escape_sequence_is_rejected() {
        let mut data = vec![0x42];
        data.extend_from_slice(&ESCAPE_SEQUENCE);
        data.push(0x42);

        assert!(matches!(
            unescape_body(&data),
            Err(SmlError::BadEscape { pos: 1 })
        ));
    }
}
