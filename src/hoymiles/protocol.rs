use super::packet::{
    self, build_info_request, parse_fragment, rx_channels_for, Command, FragmentBuffer,
    FragmentError, InverterReading, TX_CHANNELS,
};
use super::{InverterSerial, RadioAddress};
use crate::prelude::*;

use chrono::Utc;
use std::time::Instant;
use thiserror::Error;

/// How long to sit on one receive channel before hopping to the next
/// while scanning for response fragments.
const RX_DWELL: Duration = Duration::from_millis(5);

/// The transceiver capability the engine drives. The engine owns its
/// radio exclusively; construction-time failures of the real hardware
/// are fatal to acquisition.
pub trait Radio {
    fn set_channel(&mut self, channel: u8) -> Result<()>;

    /// Sends one packet, returning whether the link layer saw an ack.
    fn transmit(&mut self, payload: &[u8]) -> Result<bool>;

    /// Non-blocking poll for one received packet.
    fn receive(&mut self) -> Result<Option<Vec<u8>>>;

    fn flush_rx(&mut self) -> Result<()>;

    /// Raised while an exchange is in flight, dropped in between.
    fn set_high_power(&mut self, on: bool) -> Result<()>;
}

// {{{ link state machine
/// Per-attempt protocol state. Every transition goes through `step`, so
/// the retry and timeout edges are auditable in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    AwaitingFragments { seq: u32, received: u8 },
    Reassembled { seq: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    RequestSent { seq: u32 },
    FragmentReceived { seq: u32, index: u8, last: bool },
    FragmentCorrupt { seq: u32 },
    AllFragmentsPresent { seq: u32 },
    WindowExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Ignore,
    Store,
    DiscardStale,
    AbortAttempt,
    Deliver,
}

pub fn step(state: LinkState, event: LinkEvent) -> (LinkState, LinkAction) {
    use LinkAction::*;
    use LinkEvent::*;
    use LinkState::*;

    match (state, event) {
        (Idle, RequestSent { seq }) | (Reassembled { .. }, RequestSent { seq }) => {
            (AwaitingFragments { seq, received: 0 }, Ignore)
        }
        (AwaitingFragments { seq, received }, FragmentReceived { seq: fragment_seq, .. }) => {
            if fragment_seq == seq {
                (
                    AwaitingFragments {
                        seq,
                        received: received.saturating_add(1),
                    },
                    Store,
                )
            } else {
                (AwaitingFragments { seq, received }, DiscardStale)
            }
        }
        (AwaitingFragments { seq, .. }, AllFragmentsPresent { seq: fragment_seq })
            if fragment_seq == seq =>
        {
            (Reassembled { seq }, Deliver)
        }
        (AwaitingFragments { .. }, FragmentCorrupt { .. }) => (Idle, AbortAttempt),
        (AwaitingFragments { .. }, WindowExpired) => (Idle, AbortAttempt),
        (Reassembled { .. }, WindowExpired) => (Idle, Ignore),
        // nothing in flight, late fragments are dropped
        (state, FragmentReceived { .. }) => (state, DiscardStale),
        (state, _) => (state, Ignore),
    }
} // }}}

/// Why one request attempt produced no reading.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("listen window expired with {received} fragment(s)")]
    Timeout { received: usize },

    #[error("a fragment failed its checksum")]
    CorruptFragment,

    #[error("reassembled payload failed its checksum")]
    PayloadChecksum,

    #[error("payload decode failed: {0}")]
    Decode(#[from] packet::DecodeError),
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("inverter did not answer after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: AttemptError },

    #[error("radio transport failed: {0}")]
    Radio(#[source] anyhow::Error),
}

enum AttemptFailure {
    Protocol(AttemptError),
    Radio(anyhow::Error),
}

impl From<AttemptError> for AttemptFailure {
    fn from(e: AttemptError) -> Self {
        AttemptFailure::Protocol(e)
    }
}

impl From<anyhow::Error> for AttemptFailure {
    fn from(e: anyhow::Error) -> Self {
        AttemptFailure::Radio(e)
    }
}

/// The DTU side of the request/response radio protocol: sends one
/// stop-and-wait request per attempt, hops channels between attempts,
/// reassembles the fragmented response and decodes it.
pub struct HmDtu<R> {
    radio: R,
    inverter_addr: RadioAddress,
    dtu_addr: RadioAddress,
    channel_count: usize,
    retries: u32,
    retry_delay: Duration,
    listen_window: Duration,
    tx_cursor: usize,
    seq: u32,
    state: LinkState,
}

impl<R: Radio> HmDtu<R> {
    pub fn new(
        radio: R,
        inverter: &config::Inverter,
        channel_count: usize,
        dtu_addr: RadioAddress,
    ) -> Result<Self> {
        let serial = InverterSerial::new(inverter.serial())?;

        Ok(Self {
            radio,
            inverter_addr: serial.radio_address()?,
            dtu_addr,
            channel_count,
            retries: inverter.retries().max(1),
            retry_delay: inverter.retry_delay(),
            listen_window: inverter.listen_window(),
            tx_cursor: 0,
            // epoch seconds seed the monotonically increasing sequence
            seq: Utc::now().timestamp() as u32,
            state: LinkState::Idle,
        })
    }

    pub fn inverter_address(&self) -> RadioAddress {
        self.inverter_addr
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Polls the inverter for live data. Bounded by
    /// attempts x (retry delay + listen window); exhausting the attempt
    /// budget is an ordinary poll failure, a radio transport error is not.
    pub fn poll_info(&mut self) -> Result<InverterReading, PollError> {
        self.radio.set_high_power(true).map_err(PollError::Radio)?;
        let result = self.poll_info_inner();
        if let Err(e) = self.radio.set_high_power(false) {
            warn!("failed to drop radio power level: {}", e);
        }
        result
    }

    fn poll_info_inner(&mut self) -> Result<InverterReading, PollError> {
        let attempts = self.retries;
        let mut last = AttemptError::Timeout { received: 0 };

        for attempt in 0..attempts {
            if attempt > 0 {
                std::thread::sleep(self.retry_delay);
            }

            let seq = self.next_seq();
            let tx_channel = TX_CHANNELS[self.tx_cursor];
            self.tx_cursor = (self.tx_cursor + 1) % TX_CHANNELS.len();

            match self.attempt(seq, tx_channel) {
                Ok(reading) => {
                    debug!(
                        "inverter {} answered on channel {} (attempt {}/{})",
                        self.inverter_addr,
                        tx_channel,
                        attempt + 1,
                        attempts
                    );
                    return Ok(reading);
                }
                Err(AttemptFailure::Protocol(e)) => {
                    debug!(
                        "poll attempt {}/{} on channel {} failed: {}",
                        attempt + 1,
                        attempts,
                        tx_channel,
                        e
                    );
                    last = e;
                }
                Err(AttemptFailure::Radio(e)) => return Err(PollError::Radio(e)),
            }
        }

        Err(PollError::RetriesExhausted { attempts, last })
    }

    /// One request/response exchange on a fixed pair of TX channel and
    /// RX scan list. Runs to completion or deadline; the caller decides
    /// about retries.
    fn attempt(&mut self, seq: u32, tx_channel: u8) -> Result<InverterReading, AttemptFailure> {
        let request = build_info_request(&self.inverter_addr, &self.dtu_addr, seq);

        self.radio.set_channel(tx_channel)?;
        self.radio.flush_rx()?;
        if !self.radio.transmit(&request)? {
            // the inverter acks lazily on some firmwares, keep listening
            trace!("no link-layer ack on channel {}", tx_channel);
        }

        self.state = step(self.state, LinkEvent::RequestSent { seq }).0;

        let rx_channels = rx_channels_for(tx_channel);
        let mut buffer = FragmentBuffer::new(seq);
        let deadline = Instant::now() + self.listen_window;
        let mut cursor = 0usize;

        while Instant::now() < deadline {
            let rx_channel = rx_channels[cursor % rx_channels.len()];
            cursor += 1;
            self.radio.set_channel(rx_channel)?;

            let dwell_end = Instant::now() + RX_DWELL;
            while Instant::now() < dwell_end {
                let raw = match self.radio.receive()? {
                    Some(raw) => raw,
                    None => continue, // the SPI round trip paces this loop
                };

                match parse_fragment(&raw, &self.inverter_addr, Command::Info, seq) {
                    Ok(fragment) => {
                        let (state, action) = step(
                            self.state,
                            LinkEvent::FragmentReceived {
                                seq: fragment.seq,
                                index: fragment.index,
                                last: fragment.last,
                            },
                        );
                        self.state = state;

                        match action {
                            LinkAction::Store => buffer.insert(fragment),
                            _ => {
                                trace!("fragment discarded ({:?})", action);
                                continue;
                            }
                        }

                        if buffer.is_complete() {
                            let (state, _) =
                                step(self.state, LinkEvent::AllFragmentsPresent { seq });
                            self.state = state;
                            return self.deliver(buffer);
                        }
                    }
                    Err(FragmentError::Checksum) => {
                        // a damaged fragment voids the whole exchange on
                        // this half-duplex link
                        self.state = step(self.state, LinkEvent::FragmentCorrupt { seq }).0;
                        return Err(AttemptError::CorruptFragment.into());
                    }
                    Err(e) => trace!("ignoring foreign packet: {}", e),
                }
            }
        }

        let received = buffer.received();
        self.state = step(self.state, LinkEvent::WindowExpired).0;
        Err(AttemptError::Timeout { received }.into())
    }

    fn deliver(&mut self, buffer: FragmentBuffer) -> Result<InverterReading, AttemptFailure> {
        self.state = LinkState::Idle;

        let data = match buffer.assemble() {
            Some(data) => data,
            None => return Err(AttemptError::Timeout { received: 0 }.into()),
        };

        let payload = packet::verify_reassembled(&data).ok_or(AttemptError::PayloadChecksum)?;
        let reading = packet::decode_reading(payload, self.channel_count)
            .map_err(AttemptError::Decode)?;
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_opens_the_collection_window() {
        let (state, action) = step(LinkState::Idle, LinkEvent::RequestSent { seq: 7 });
        assert_eq!(state, LinkState::AwaitingFragments { seq: 7, received: 0 });
        assert_eq!(action, LinkAction::Ignore);
    }

    #[test]
    fn matching_fragments_are_stored() {
        let state = LinkState::AwaitingFragments { seq: 7, received: 0 };
        let (state, action) = step(
            state,
            LinkEvent::FragmentReceived {
                seq: 7,
                index: 1,
                last: false,
            },
        );
        assert_eq!(state, LinkState::AwaitingFragments { seq: 7, received: 1 });
        assert_eq!(action, LinkAction::Store);
    }

    #[test]
    fn stale_fragments_are_discarded() {
        let state = LinkState::AwaitingFragments { seq: 7, received: 1 };
        let (state, action) = step(
            state,
            LinkEvent::FragmentReceived {
                seq: 6,
                index: 2,
                last: true,
            },
        );
        assert_eq!(state, LinkState::AwaitingFragments { seq: 7, received: 1 });
        assert_eq!(action, LinkAction::DiscardStale);
    }

    #[test]
    fn corrupt_fragment_aborts_the_attempt() {
        let state = LinkState::AwaitingFragments { seq: 7, received: 2 };
        let (state, action) = step(state, LinkEvent::FragmentCorrupt { seq: 7 });
        assert_eq!(state, LinkState::Idle);
        assert_eq!(action, LinkAction::AbortAttempt);
    }

    #[test]
    fn window_expiry_returns_to_idle() {
        let state = LinkState::AwaitingFragments { seq: 7, received: 0 };
        let (state, action) = step(state, LinkEvent::WindowExpired);
        assert_eq!(state, LinkState::Idle);
        assert_eq!(action, LinkAction::AbortAttempt);
    }

    #[test]
    fn completion_delivers() {
        let state = LinkState::AwaitingFragments { seq: 7, received: 3 };
        let (state, action) = step(state, LinkEvent::AllFragmentsPresent { seq: 7 });
        assert_eq!(state, LinkState::Reassembled { seq: 7 });
        assert_eq!(action, LinkAction::Deliver);
    }

    #[test]
    fn fragments_without_a_request_are_dropped() {
        let (state, action) = step(
            LinkState::Idle,
            LinkEvent::FragmentReceived {
                seq: 1,
                index: 1,
                last: true,
            },
        );
        assert_eq!(state, LinkState::Idle);
        assert_eq!(action, LinkAction::DiscardStale);
    }

    #[test]
    fn a_new_request_reuses_a_reassembled_link() {
        let (state, _) = step(
            LinkState::Reassembled { seq: 7 },
            LinkEvent::RequestSent { seq: 8 },
        );
        assert_eq!(state, LinkState::AwaitingFragments { seq: 8, received: 0 });
    }
}
