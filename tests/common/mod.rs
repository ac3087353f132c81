#![allow(dead_code)]

use ebz_hm_bridge::config;
use ebz_hm_bridge::hoymiles::packet;
use ebz_hm_bridge::hoymiles::{Radio, RadioAddress};
use ebz_hm_bridge::meter::SelectLine;
use ebz_hm_bridge::sml::{ByteSource, MeterReading, ObisCode, ObisValue, SmlValue, Unit};

use anyhow::Result;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A real telegram captured from an eBZ DD3 meter.
pub const SAMPLE_TELEGRAM_0: &str = "1B 1B 1B 1B 01 01 01 01 76 05 00 95 A0 D5 62 00 62 00 72 65 00 00 01 01 76 01 01 07 65 42 5A 44 44 33 0B 09 01 45 42 5A 01 00 2D 16 C3 01 01 63 32 DE 00 76 05 00 95 A0 D6 62 00 62 00 72 65 00 00 07 01 77 01 0B 09 01 45 42 5A 01 00 2D 16 C3 01 72 62 01 65 00 18 F1 35 7A 77 07 81 81 C7 82 03 FF 01 01 01 01 04 45 42 5A 01 77 07 01 00 00 00 09 FF 01 01 01 01 0B 09 01 45 42 5A 01 00 2D 16 C3 01 77 07 01 00 01 08 00 FF 64 01 01 80 01 62 1E 52 FB 69 00 00 00 08 BA 13 9B 6E 01 77 07 01 00 01 08 01 FF 01 01 62 1E 52 FB 69 00 00 00 08 B4 25 5B 8E 01 77 07 01 00 01 08 02 FF 01 01 62 1E 52 FB 69 00 00 00 00 05 EE 3F E0 01 77 07 01 00 02 08 00 FF 64 01 01 80 01 62 1E 52 FB 69 00 00 00 00 0D 18 5B 20 01 77 07 01 00 10 07 00 FF 01 01 62 1B 52 FE 55 00 00 01 85 01 77 07 01 00 24 07 00 FF 01 01 62 1B 52 FE 55 00 00 01 85 01 77 07 01 00 38 07 00 FF 01 01 62 1B 52 FE 55 00 00 00 00 01 77 07 01 00 4C 07 00 FF 01 01 62 1B 52 FE 55 00 00 00 00 01 01 01 63 88 D6 00 76 05 00 95 A0 D7 62 00 62 00 72 65 00 00 02 01 71 01 63 76 07 00 00 00 00 1B 1B 1B 1B 1A 03 4E 67";

/// A later telegram from the same meter with different counter values.
pub const SAMPLE_TELEGRAM_1: &str = "1B 1B 1B 1B 01 01 01 01 76 05 00 95 A0 DB 62 00 62 00 72 65 00 00 01 01 76 01 01 07 65 42 5A 44 44 33 0B 09 01 45 42 5A 01 00 2D 16 C3 01 01 63 27 AC 00 76 05 00 95 A0 DC 62 00 62 00 72 65 00 00 07 01 77 01 0B 09 01 45 42 5A 01 00 2D 16 C3 01 72 62 01 65 00 18 F1 36 7A 77 07 81 81 C7 82 03 FF 01 01 01 01 04 45 42 5A 01 77 07 01 00 00 00 09 FF 01 01 01 01 0B 09 01 45 42 5A 01 00 2D 16 C3 01 77 07 01 00 01 08 00 FF 64 01 01 80 01 62 1E 52 FB 69 00 00 00 08 BA 13 9B CA 01 77 07 01 00 01 08 01 FF 01 01 62 1E 52 FB 69 00 00 00 08 B4 25 5B EA 01 77 07 01 00 01 08 02 FF 01 01 62 1E 52 FB 69 00 00 00 00 05 EE 3F E0 01 77 07 01 00 02 08 00 FF 64 01 01 80 01 62 1E 52 FB 69 00 00 00 00 0D 18 5B 20 01 77 07 01 00 10 07 00 FF 01 01 62 1B 52 FE 55 00 00 01 4B 01 77 07 01 00 24 07 00 FF 01 01 62 1B 52 FE 55 00 00 01 4B 01 77 07 01 00 38 07 00 FF 01 01 62 1B 52 FE 55 00 00 00 00 01 77 07 01 00 4C 07 00 FF 01 01 62 1B 52 FE 55 00 00 00 00 01 01 01 63 56 AB 00 76 05 00 95 A0 DD 62 00 62 00 72 65 00 00 02 01 71 01 63 44 21 00 00 00 00 1B 1B 1B 1B 1A 03 DE 02";

pub fn telegram_bytes(spaced_hex: &str) -> Vec<u8> {
    let cleaned: String = spaced_hex.split_whitespace().collect();
    hex::decode(cleaned).expect("fixture is valid hex")
}

// {{{ fake meter bus
#[derive(Default)]
pub struct FakeBusState {
    pub scripts: [VecDeque<u8>; 2],
}

/// Serves bytes from the script of whichever channel the fake select
/// line last routed.
pub struct FakeUart {
    state: Arc<Mutex<FakeBusState>>,
    selected: Arc<AtomicUsize>,
}

impl ByteSource for FakeUart {
    fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let channel = self.selected.load(Ordering::SeqCst);
        let mut state = self.state.lock().expect("bus state lock");
        let script = &mut state.scripts[channel];

        let mut n = 0;
        while n < buf.len() {
            match script.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn discard_pending(&mut self) -> std::io::Result<()> {
        // the scripted bytes are the fixture, nothing stale to drop
        Ok(())
    }
}

pub struct FakeSelectLine {
    selected: Arc<AtomicUsize>,
}

impl SelectLine for FakeSelectLine {
    fn set(&mut self, high: bool) -> Result<()> {
        self.selected.store(high as usize, Ordering::SeqCst);
        Ok(())
    }
}

pub fn fake_bus(script0: Vec<u8>, script1: Vec<u8>) -> (FakeUart, FakeSelectLine) {
    let state = Arc::new(Mutex::new(FakeBusState {
        scripts: [script0.into(), script1.into()],
    }));
    let selected = Arc::new(AtomicUsize::new(0));

    (
        FakeUart {
            state: state.clone(),
            selected: selected.clone(),
        },
        FakeSelectLine { selected },
    )
}
// }}}

// {{{ fake radio
#[derive(Default)]
pub struct FakeRadioState {
    pub current_channel: u8,
    pub tx_log: Vec<(u8, Vec<u8>)>,
    pub respond_with: Vec<Vec<u8>>,
    pub power_high: bool,
    rx_queue: VecDeque<Vec<u8>>,
}

/// Records every transmit and answers each request with a canned set of
/// packets, like the stop-and-wait link it stands in for. State is
/// shared so tests keep a handle after the engine takes the radio.
#[derive(Clone, Default)]
pub struct FakeRadio {
    pub state: Arc<Mutex<FakeRadioState>>,
}

impl FakeRadio {
    pub fn responding_with(fragments: Vec<Vec<u8>>) -> Self {
        let radio = Self::default();
        radio.state.lock().unwrap().respond_with = fragments;
        radio
    }

    pub fn tx_channels(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .tx_log
            .iter()
            .map(|(channel, _)| *channel)
            .collect()
    }

    pub fn transmit_count(&self) -> usize {
        self.state.lock().unwrap().tx_log.len()
    }
}

impl Radio for FakeRadio {
    fn set_channel(&mut self, channel: u8) -> Result<()> {
        self.state.lock().unwrap().current_channel = channel;
        Ok(())
    }

    fn transmit(&mut self, payload: &[u8]) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let channel = state.current_channel;
        state.tx_log.push((channel, payload.to_vec()));
        state.rx_queue = state.respond_with.clone().into();
        Ok(true)
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().unwrap().rx_queue.pop_front())
    }

    fn flush_rx(&mut self) -> Result<()> {
        self.state.lock().unwrap().rx_queue.clear();
        Ok(())
    }

    fn set_high_power(&mut self, on: bool) -> Result<()> {
        self.state.lock().unwrap().power_high = on;
        Ok(())
    }
}

/// Splits a message payload into wire fragments the way the inverter
/// does: CRC16 trailer, 16-byte chunks, each wrapped in a response
/// header with its own CRC8 and escaped.
pub fn response_fragments(inverter: &RadioAddress, payload: &[u8]) -> Vec<Vec<u8>> {
    let mut data = payload.to_vec();
    data.extend_from_slice(&packet::payload_crc16(payload).to_be_bytes());

    let chunks: Vec<&[u8]> = data.chunks(packet::MAX_PAYLOAD_PER_PACKET).collect();
    let count = chunks.len();

    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut frame_no = (i + 1) as u8;
            if i + 1 == count {
                frame_no |= packet::LAST_FRAME_FLAG;
            }

            let mut pkt = vec![u8::from(packet::Command::Info) | packet::RESPONSE_FLAG];
            pkt.extend_from_slice(inverter.as_bytes());
            pkt.extend_from_slice(inverter.as_bytes());
            pkt.push(frame_no);
            pkt.extend_from_slice(chunk);
            pkt.push(packet::packet_crc8(&pkt));
            packet::escape_data(&pkt)
        })
        .collect()
}
// }}}

// {{{ factories
pub fn inverter_config(retries: u32) -> config::Inverter {
    config::Inverter {
        serial: "114184020874".to_string(),
        channels: None,
        spi_bus: None,
        ce_gpio: None,
        retries: Some(retries),
        retry_delay_secs: Some(0),
        listen_window_ms: Some(40),
    }
}

pub fn meter_reading(power_w: f64, import_wh: f64) -> MeterReading {
    let mut reading = MeterReading::new(Utc::now());
    reading.insert(ObisValue {
        code: ObisCode::POWER_TOTAL,
        value: SmlValue::Int((power_w * 100.0).round() as i64),
        scaler: -2,
        unit: Some(Unit::Watt),
    });
    reading.insert(ObisValue {
        code: ObisCode::ENERGY_IMPORT_TOTAL,
        value: SmlValue::UInt((import_wh * 1e5).round() as u64),
        scaler: -5,
        unit: Some(Unit::WattHour),
    });
    reading
}
// }}}
