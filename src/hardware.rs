use crate::prelude::*;

use crate::hoymiles::{Radio, RadioAddress};
use crate::meter::SelectLine;
use crate::sml::ByteSource;

use rppal::gpio::{Gpio, OutputPin};
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};
use std::io::Read;
use std::time::Instant;

// {{{ UART
/// The shared meter UART behind the select line.
pub struct UartSource {
    port: Box<dyn serialport::SerialPort>,
}

impl UartSource {
    pub fn open(config: &config::Meters) -> Result<Self> {
        let port = serialport::new(config.uart(), config.baud())
            .timeout(Duration::from_millis(200))
            .open()
            .with_context(|| format!("cannot open meter UART {}", config.uart()))?;

        Ok(Self { port })
    }
}

impl ByteSource for UartSource {
    fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn discard_pending(&mut self) -> std::io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
} // }}}

// {{{ select line
pub struct GpioSelectLine {
    pin: OutputPin,
}

impl GpioSelectLine {
    pub fn new(bcm_pin: u8) -> Result<Self> {
        let pin = Gpio::new()
            .context("cannot access GPIO")?
            .get(bcm_pin)
            .with_context(|| format!("cannot claim GPIO {}", bcm_pin))?
            .into_output_low();

        Ok(Self { pin })
    }
}

impl SelectLine for GpioSelectLine {
    fn set(&mut self, high: bool) -> Result<()> {
        if high {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        Ok(())
    }
} // }}}

// {{{ nRF24L01+
// registers
const CONFIG: u8 = 0x00;
const EN_AA: u8 = 0x01;
const EN_RXADDR: u8 = 0x02;
const SETUP_AW: u8 = 0x03;
const SETUP_RETR: u8 = 0x04;
const RF_CH: u8 = 0x05;
const RF_SETUP: u8 = 0x06;
const STATUS: u8 = 0x07;
const RX_ADDR_P0: u8 = 0x0A;
const RX_ADDR_P1: u8 = 0x0B;
const TX_ADDR: u8 = 0x10;
const FIFO_STATUS: u8 = 0x17;
const DYNPD: u8 = 0x1C;
const FEATURE: u8 = 0x1D;

// commands
const W_REGISTER: u8 = 0x20;
const R_RX_PL_WID: u8 = 0x60;
const R_RX_PAYLOAD: u8 = 0x61;
const W_TX_PAYLOAD: u8 = 0xA0;
const FLUSH_TX: u8 = 0xE1;
const FLUSH_RX: u8 = 0xE2;

// CONFIG bits
const PRIM_RX: u8 = 1 << 0;
const PWR_UP: u8 = 1 << 1;
const CRCO: u8 = 1 << 2;
const EN_CRC: u8 = 1 << 3;

// STATUS bits
const RX_DR: u8 = 1 << 6;
const TX_DS: u8 = 1 << 5;
const MAX_RT: u8 = 1 << 4;

// FIFO_STATUS bits
const RX_EMPTY: u8 = 1 << 0;

const SPI_CLOCK_HZ: u32 = 1_000_000;
const TX_TIMEOUT: Duration = Duration::from_millis(100);

/// Driver for the nRF24L01+ transceiver, limited to the handful of
/// operations the polling engine needs: 250 kbps, 16-bit hardware CRC,
/// dynamic payloads, auto-ack, one writing and one reading pipe.
pub struct Nrf24Radio {
    spi: Spi,
    ce: OutputPin,
    listening: bool,
}

impl Nrf24Radio {
    pub fn new(
        config: &config::Inverter,
        inverter: RadioAddress,
        dtu: RadioAddress,
    ) -> Result<Self> {
        let bus = match config.spi_bus() {
            0 => Bus::Spi0,
            1 => Bus::Spi1,
            n => bail!("unsupported SPI bus {}", n),
        };
        let spi = Spi::new(bus, SlaveSelect::Ss0, SPI_CLOCK_HZ, Mode::Mode0)
            .context("cannot open SPI bus for the transceiver")?;
        let ce = Gpio::new()
            .context("cannot access GPIO")?
            .get(config.ce_gpio())
            .with_context(|| format!("cannot claim CE pin {}", config.ce_gpio()))?
            .into_output_low();

        let mut radio = Self {
            spi,
            ce,
            listening: false,
        };
        radio.initialize(inverter, dtu)?;
        Ok(radio)
    }

    fn initialize(&mut self, inverter: RadioAddress, dtu: RadioAddress) -> Result<()> {
        self.ce.set_low();

        self.write_register(CONFIG, EN_CRC | CRCO | PWR_UP)?;
        std::thread::sleep(Duration::from_millis(5));

        // readback doubles as the chip-connected check
        self.write_register(SETUP_AW, 0x03)?; // 5-byte addresses
        if self.read_register(SETUP_AW)? != 0x03 {
            bail!("nRF24L01 does not respond, check wiring");
        }

        // 250 kbps, minimum power until a poll is in flight
        self.write_register(RF_SETUP, 0x20 | 0x01)?;
        // up to 10 hardware retransmits, 1 ms apart
        self.write_register(SETUP_RETR, (3 << 4) | 10)?;
        self.write_register(EN_AA, 0x3F)?;
        self.write_register(EN_RXADDR, 0x03)?;
        self.write_register(DYNPD, 0x3F)?;
        self.write_register(FEATURE, 0x04)?; // EN_DPL

        // pipe layout of the stock DTUs: 0x01 prefix plus device address
        let mut tx_addr = [0u8; 5];
        tx_addr[0] = 0x01;
        tx_addr[1..].copy_from_slice(inverter.as_bytes());
        self.write_register_bytes(TX_ADDR, &tx_addr)?;
        self.write_register_bytes(RX_ADDR_P0, &tx_addr)?; // for the ack

        let mut rx_addr = [0u8; 5];
        rx_addr[0] = 0x01;
        rx_addr[1..].copy_from_slice(dtu.as_bytes());
        self.write_register_bytes(RX_ADDR_P1, &rx_addr)?;

        self.command(&[FLUSH_TX])?;
        self.command(&[FLUSH_RX])?;
        self.clear_status()?;

        Ok(())
    }

    fn command(&mut self, out: &[u8]) -> Result<Vec<u8>> {
        let mut read = vec![0u8; out.len()];
        self.spi
            .transfer(&mut read, out)
            .context("SPI transfer failed")?;
        Ok(read)
    }

    fn read_register(&mut self, register: u8) -> Result<u8> {
        let response = self.command(&[register, 0])?;
        Ok(response[1])
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<()> {
        self.command(&[W_REGISTER | register, value])?;
        Ok(())
    }

    fn write_register_bytes(&mut self, register: u8, value: &[u8]) -> Result<()> {
        let mut out = vec![W_REGISTER | register];
        out.extend_from_slice(value);
        self.command(&out)?;
        Ok(())
    }

    fn status(&mut self) -> Result<u8> {
        Ok(self.command(&[0xFF])?[0])
    }

    fn clear_status(&mut self) -> Result<()> {
        self.write_register(STATUS, RX_DR | TX_DS | MAX_RT)
    }

    fn stop_listening(&mut self) -> Result<()> {
        if self.listening {
            self.ce.set_low();
            let config = self.read_register(CONFIG)?;
            self.write_register(CONFIG, config & !PRIM_RX)?;
            self.listening = false;
        }
        Ok(())
    }

    fn start_listening(&mut self) -> Result<()> {
        if !self.listening {
            let config = self.read_register(CONFIG)?;
            self.write_register(CONFIG, config | PRIM_RX)?;
            self.clear_status()?;
            self.ce.set_high();
            std::thread::sleep(Duration::from_micros(130)); // RX settling
            self.listening = true;
        }
        Ok(())
    }
}

impl Radio for Nrf24Radio {
    fn set_channel(&mut self, channel: u8) -> Result<()> {
        self.write_register(RF_CH, channel & 0x7F)
    }

    fn transmit(&mut self, payload: &[u8]) -> Result<bool> {
        self.stop_listening()?;
        self.command(&[FLUSH_TX])?;
        self.clear_status()?;

        let mut out = vec![W_TX_PAYLOAD];
        out.extend_from_slice(payload);
        self.command(&out)?;

        self.ce.set_high();
        std::thread::sleep(Duration::from_micros(15));
        self.ce.set_low();

        let deadline = Instant::now() + TX_TIMEOUT;
        loop {
            let status = self.status()?;
            if status & (TX_DS | MAX_RT) != 0 {
                self.clear_status()?;
                return Ok(status & TX_DS != 0);
            }
            if Instant::now() >= deadline {
                self.command(&[FLUSH_TX])?;
                return Ok(false);
            }
        }
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        self.start_listening()?;

        if self.read_register(FIFO_STATUS)? & RX_EMPTY != 0 {
            return Ok(None);
        }

        let width = self.command(&[R_RX_PL_WID, 0])?[1] as usize;
        if width == 0 || width > 32 {
            // corrupt length, drop the FIFO as the datasheet requires
            self.command(&[FLUSH_RX])?;
            return Ok(None);
        }

        let mut out = vec![R_RX_PAYLOAD];
        out.resize(width + 1, 0);
        let response = self.command(&out)?;
        self.write_register(STATUS, RX_DR)?;

        Ok(Some(response[1..].to_vec()))
    }

    fn flush_rx(&mut self) -> Result<()> {
        self.command(&[FLUSH_RX])?;
        Ok(())
    }

    fn set_high_power(&mut self, on: bool) -> Result<()> {
        // RF_DR_LOW stays set for 250 kbps, bits 2:1 select the PA level
        let level = if on { 0b11 } else { 0b00 };
        self.write_register(RF_SETUP, 0x20 | (level << 1) | 0x01)
    }
} // }}}

/// Host-unique seed for the DTU radio address, stable across restarts
/// where the machine id is available.
pub fn dtu_seed() -> u64 {
    match std::fs::read_to_string("/etc/machine-id") {
        Ok(id) => {
            let hex: String = id.trim().chars().take(16).collect();
            u64::from_str_radix(&hex, 16).unwrap_or_else(|_| fallback_seed())
        }
        Err(_) => fallback_seed(),
    }
}

fn fallback_seed() -> u64 {
    let pid = std::process::id() as u64;
    let now = chrono::Utc::now().timestamp() as u64;
    (pid << 32) ^ now
}
