mod common;
use common::*;

use ebz_hm_bridge::sml::{
    decode_frame, decoder, meter_reading_from_messages, ObisCode, ObisKind, ReadError, SmlError,
    TelegramReader, Unit,
};

use chrono::Utc;
use std::time::Duration;

#[test]
fn sample_telegram_decodes_every_leaf_value() {
    let frame = telegram_bytes(SAMPLE_TELEGRAM_0);
    let messages = decode_frame(&frame).unwrap();
    assert_eq!(messages.len(), 3); // open response, list response, close response

    let reading = meter_reading_from_messages(&messages, Utc::now());

    assert_eq!(reading.manufacturer().as_deref(), Some("EBZ"));
    assert_eq!(reading.device_id().as_deref(), Some("090145425A01002D16C3"));

    // cumulative energy counters at 10 uWh resolution
    let expected = 0x08BA139B6Eu64 as f64 * 1e-5;
    assert!((reading.energy_import_total().unwrap() - expected).abs() < 1e-9);

    let expected = 0x08B4255B8Eu64 as f64 * 1e-5;
    assert!((reading.energy_import_t1().unwrap() - expected).abs() < 1e-9);

    let expected = 0x05EE3FE0u64 as f64 * 1e-5;
    assert!((reading.energy_import_t2().unwrap() - expected).abs() < 1e-9);

    let expected = 0x0D185B20u64 as f64 * 1e-5;
    assert!((reading.energy_export_total().unwrap() - expected).abs() < 1e-9);

    // instantaneous power at 0.01 W resolution
    assert!((reading.power_total().unwrap() - 3.89).abs() < 1e-9);
    assert!((reading.power_phase(1).unwrap() - 3.89).abs() < 1e-9);
    assert_eq!(reading.power_phase(2), Some(0.0));
    assert_eq!(reading.power_phase(3), Some(0.0));

    // unit tags survive decoding
    let energy = reading.get(&ObisCode::ENERGY_IMPORT_TOTAL).unwrap();
    assert_eq!(energy.unit, Some(Unit::WattHour));
    assert_eq!(energy.scaler, -5);
    let power = reading.get(&ObisCode::POWER_TOTAL).unwrap();
    assert_eq!(power.unit, Some(Unit::Watt));
    assert_eq!(power.scaler, -2);

    assert!(reading.is_complete());
}

#[test]
fn flipped_payload_byte_fails_the_checksum() {
    let mut frame = telegram_bytes(SAMPLE_TELEGRAM_0);
    frame[100] ^= 0x01;

    assert!(matches!(
        decode_frame(&frame),
        Err(SmlError::ChecksumMismatch { .. })
    ));
}

#[test]
fn reader_resynchronizes_after_a_corrupt_frame() {
    let mut stream = vec![0xDE, 0xAD, 0xBE, 0xEF]; // line noise
    let mut corrupted = telegram_bytes(SAMPLE_TELEGRAM_0);
    corrupted[100] ^= 0x01;
    stream.extend_from_slice(&corrupted);
    stream.extend_from_slice(&telegram_bytes(SAMPLE_TELEGRAM_1));

    let (uart, _select) = fake_bus(stream, Vec::new());
    let mut reader = TelegramReader::new(uart);

    let reading = reader.next_reading(Duration::from_secs(2)).unwrap();
    // the valid appended telegram, not the corrupted one
    assert!((reading.power_total().unwrap() - 3.31).abs() < 1e-9);
}

#[test]
fn reader_yields_a_lazy_sequence() {
    let mut stream = telegram_bytes(SAMPLE_TELEGRAM_0);
    stream.extend_from_slice(&telegram_bytes(SAMPLE_TELEGRAM_1));

    let (uart, _select) = fake_bus(stream, Vec::new());
    let mut reader = TelegramReader::new(uart);

    let powers: Vec<f64> = reader
        .readings(Duration::from_secs(2))
        .take(2)
        .map(|r| r.unwrap().power_total().unwrap())
        .collect();

    assert!((powers[0] - 3.89).abs() < 1e-9);
    assert!((powers[1] - 3.31).abs() < 1e-9);
}

#[test]
fn silent_source_times_out() {
    let (uart, _select) = fake_bus(Vec::new(), Vec::new());
    let mut reader = TelegramReader::new(uart);

    match reader.next_reading(Duration::from_millis(50)) {
        Err(ReadError::Timeout { waited }) => assert!(waited >= Duration::from_millis(50)),
        other => panic!("expected timeout, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn garbage_only_stream_reports_the_decode_error() {
    let mut corrupted = telegram_bytes(SAMPLE_TELEGRAM_0);
    corrupted[100] ^= 0x01;

    let (uart, _select) = fake_bus(corrupted, Vec::new());
    let mut reader = TelegramReader::new(uart);

    assert!(matches!(
        reader.next_reading(Duration::from_millis(50)),
        Err(ReadError::Decode(SmlError::ChecksumMismatch { .. }))
    ));
}

/// Builds a minimal valid telegram around one list entry with an OBIS
/// code the table does not know.
fn synthetic_unknown_code_frame() -> Vec<u8> {
    let mut message = Vec::new();
    message.push(0x76); // message: list of 6
    message.extend_from_slice(&[0x03, 0xAA, 0xBB]); // transaction id
    message.extend_from_slice(&[0x62, 0x00]); // group
    message.extend_from_slice(&[0x62, 0x00]); // abort on error
    message.push(0x72); // body: [type, content]
    message.extend_from_slice(&[0x65, 0x00, 0x00, 0x07, 0x01]); // GetListResponse
    message.push(0x77); // content: list of 7
    message.push(0x01); // client id
    message.push(0x01); // server id
    message.push(0x01); // list name
    message.push(0x01); // sensor time
    message.push(0x71); // value list, one entry
    message.push(0x77); // entry: list of 7
    message.extend_from_slice(&[0x07, 0x99, 0x88, 0x77, 0x66, 0x55, 0xFF]); // unknown code
    message.push(0x01); // status
    message.push(0x01); // value time
    message.extend_from_slice(&[0x62, 0x1E]); // unit: Wh
    message.extend_from_slice(&[0x52, 0xFF]); // scaler: -1
    message.extend_from_slice(&[0x62, 0x2A]); // value: 42
    message.push(0x01); // signature
    message.push(0x01); // list signature
    message.push(0x01); // gateway time
    message.extend_from_slice(&[0x63, 0x00, 0x00]); // message crc, unchecked
    message.push(0x00); // end of message

    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x1B, 0x1B, 0x1B, 0x1B, 0x01, 0x01, 0x01, 0x01]);
    frame.extend_from_slice(&message);
    frame.extend_from_slice(&[0x1B, 0x1B, 0x1B, 0x1B, 0x1A, 0x00]);
    let crc = decoder::frame_crc(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

#[test]
fn unknown_obis_codes_pass_through_generically() {
    let frame = synthetic_unknown_code_frame();
    let messages = decode_frame(&frame).unwrap();
    let reading = meter_reading_from_messages(&messages, Utc::now());

    let code = ObisCode::new([0x99, 0x88, 0x77, 0x66, 0x55, 0xFF]);
    let value = reading.get(&code).expect("unknown code must be preserved");
    assert_eq!(value.code.kind(), ObisKind::Unrecognized);
    assert_eq!(value.unit, Some(Unit::WattHour));
    assert!((value.scaled().unwrap() - 4.2).abs() < 1e-9);

    // an identifier-free telegram is not persistable
    assert!(!reading.is_complete());
}
