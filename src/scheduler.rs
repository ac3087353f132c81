use crate::prelude::*;

use crate::daylight::DayWindow;
use crate::hoymiles::{HmDtu, InverterReading, PollError, Radio};
use crate::meter::{MeterBus, SelectLine, METER_COUNT};
use crate::sml::{ByteSource, MeterReading, ReadError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub enum ChannelData {
    Tick(Box<AcquisitionTick>),
    Shutdown,
}

/// The inverter's slot in a tick. Being night-gated is expected and not
/// an anomaly; an exhausted poll during the day is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum InverterSlot {
    Reading(InverterReading),
    Offline,
    ExpectedOffline,
}

/// One scheduling period's merged result. Emitted exactly once per tick
/// with one shared timestamp; failed sources stay explicitly absent.
#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionTick {
    pub timestamp: DateTime<Utc>,
    pub meters: [Option<MeterReading>; METER_COUNT],
    pub inverter: InverterSlot,
}

// {{{ AcquisitionStats
#[derive(Default)]
pub struct AcquisitionStats {
    ticks_emitted: u64,
    meter_readings: [u64; METER_COUNT],
    meter_timeouts: [u64; METER_COUNT],
    meter_decode_errors: [u64; METER_COUNT],
    inverter_readings: u64,
    inverter_offline: u64,
    inverter_night_skips: u64,
}

impl AcquisitionStats {
    pub fn print_summary(&self) {
        info!("Acquisition statistics:");
        info!("  Ticks emitted: {}", self.ticks_emitted);
        for channel in 0..METER_COUNT {
            info!(
                "  Meter {}: {} readings, {} timeouts, {} decode errors",
                channel,
                self.meter_readings[channel],
                self.meter_timeouts[channel],
                self.meter_decode_errors[channel]
            );
        }
        info!(
            "  Inverter: {} readings, {} offline, {} night skips",
            self.inverter_readings, self.inverter_offline, self.inverter_night_skips
        );
    }
} // }}}

/// Drives one acquisition tick per period: meter 0, meter 1, then the
/// inverter when the day gate allows it. Sources share one UART and one
/// transceiver, so they are polled strictly in sequence, and ticks run
/// to completion before the next one starts.
pub struct AcquisitionScheduler<S, L, R> {
    config: ConfigWrapper,
    channels: Channels,
    bus: MeterBus<S, L>,
    dtu: HmDtu<R>,
    gate: DayWindow,
    stats: AcquisitionStats,
}

impl<S, L, R> AcquisitionScheduler<S, L, R>
where
    S: ByteSource + Send,
    L: SelectLine + Send,
    R: Radio + Send,
{
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        bus: MeterBus<S, L>,
        dtu: HmDtu<R>,
        gate: DayWindow,
    ) -> Self {
        Self {
            config,
            channels,
            bus,
            dtu,
            gate,
            stats: AcquisitionStats::default(),
        }
    }

    pub async fn start(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let period = self.config.period();
        info!("scheduler starting with a {:?} period", period);

        let mut interval = tokio::time::interval(period);
        // an overlong tick shifts the following ones instead of queuing
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = interval.tick() => {
                    match tokio::task::block_in_place(|| self.acquire_tick()) {
                        Ok(tick) => {
                            self.stats.ticks_emitted += 1;
                            if let Err(e) = self.channels.ticks.send(ChannelData::Tick(Box::new(tick))) {
                                debug!("no tick consumers: {}", e);
                            }
                        }
                        // a lost transport halts acquisition entirely
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown.recv() => break Ok(()),
            }
        };

        let _ = self.channels.ticks.send(ChannelData::Shutdown);
        self.stats.print_summary();
        info!("scheduler loop exiting");

        result
    }

    /// One tick's worth of work. Only resource failures (lost UART,
    /// dead transceiver) escape as errors; everything else degrades to
    /// an absent reading.
    fn acquire_tick(&mut self) -> Result<AcquisitionTick> {
        let timestamp = Utc::now();
        let read_timeout = self.config.meters().read_timeout();

        let mut meters: [Option<MeterReading>; METER_COUNT] = Default::default();
        for (channel, slot) in meters.iter_mut().enumerate() {
            match self.bus.read_one(channel, read_timeout) {
                Ok(reading) => {
                    if !reading.is_complete() {
                        warn!(
                            "meter {}: telegram lacks power or energy registers",
                            channel
                        );
                    }
                    self.stats.meter_readings[channel] += 1;
                    *slot = Some(reading);
                }
                Err(ReadError::Timeout { waited }) => {
                    self.stats.meter_timeouts[channel] += 1;
                    warn!("meter {}: silent for {:?}", channel, waited);
                }
                Err(ReadError::Decode(e)) => {
                    self.stats.meter_decode_errors[channel] += 1;
                    warn!("meter {}: {}", channel, e);
                }
                Err(ReadError::Transport(e)) => {
                    return Err(e.context(format!("meter {} transport failed", channel)));
                }
            }
        }

        let inverter = if self.gate.is_daylight(timestamp) {
            match self.dtu.poll_info() {
                Ok(reading) => {
                    self.stats.inverter_readings += 1;
                    InverterSlot::Reading(reading)
                }
                Err(PollError::RetriesExhausted { attempts, last }) => {
                    self.stats.inverter_offline += 1;
                    warn!(
                        "inverter offline inside day window ({} attempts, last: {})",
                        attempts, last
                    );
                    InverterSlot::Offline
                }
                Err(PollError::Radio(e)) => {
                    return Err(e.context("radio transport failed"));
                }
            }
        } else {
            self.stats.inverter_night_skips += 1;
            trace!("outside day window, inverter poll skipped");
            InverterSlot::ExpectedOffline
        };

        Ok(AcquisitionTick {
            timestamp,
            meters,
            inverter,
        })
    }
}
