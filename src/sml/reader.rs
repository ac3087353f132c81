use super::decoder::{self, END_MARKER, ESCAPE_SEQUENCE, VERSION_SEQUENCE};
use super::value::MeterReading;
use super::SmlError;
use bytes::{Buf, BytesMut};
use chrono::Utc;
use log::{debug, trace};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Pause between polls of an idle source.
const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Resync threshold: no telegram is anywhere near this large.
const MAX_BUFFER: usize = 16 * 1024;

/// A pull-based byte transport the decoder is driven against. `Ok(0)`
/// means no bytes were available right now, not end of stream.
pub trait ByteSource {
    fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Drops anything buffered by the transport itself.
    fn discard_pending(&mut self) -> std::io::Result<()> {
        let mut scratch = [0u8; 256];
        while self.fill(&mut scratch)? > 0 {}
        Ok(())
    }
}

/// Why `read_one` produced no reading this attempt. Timeouts and decode
/// failures are separate cases so the scheduler can count them apart.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("no valid telegram within {waited:?}")]
    Timeout { waited: Duration },

    #[error("telegram decode failed: {0}")]
    Decode(#[from] SmlError),

    #[error("meter transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        ReadError::Transport(e.into())
    }
}

/// Restartable telegram reader over an injected byte source.
///
/// Bytes before a start marker are noise and discarded; a frame failing
/// its checksum is skipped and scanning continues at the next marker, so
/// any decode error leaves the reader ready for the following telegram.
pub struct TelegramReader<S> {
    source: S,
    buf: BytesMut,
}

impl<S: ByteSource> TelegramReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Drops transport buffers and any partially collected frame, e.g.
    /// after the meter select line switched channels.
    pub fn discard_pending(&mut self) -> std::io::Result<()> {
        self.buf.clear();
        self.source.discard_pending()
    }

    /// Blocks until one telegram with a valid checksum and at least one
    /// list entry has been decoded, or the deadline passes.
    pub fn next_reading(&mut self, timeout: Duration) -> Result<MeterReading, ReadError> {
        let started = Instant::now();
        let mut last_error: Option<SmlError> = None;

        loop {
            while let Some(frame) = self.extract_frame() {
                match decoder::decode_frame(&frame) {
                    Ok(messages) => {
                        let reading = decoder::meter_reading_from_messages(&messages, Utc::now());
                        if reading.is_empty() {
                            trace!("telegram without list response, continuing");
                            last_error = Some(SmlError::NoListResponse);
                            continue;
                        }
                        return Ok(reading);
                    }
                    Err(e) => {
                        debug!("dropping telegram: {}", e);
                        last_error = Some(e);
                    }
                }
            }

            if started.elapsed() >= timeout {
                return Err(match last_error {
                    Some(e) => ReadError::Decode(e),
                    None => ReadError::Timeout {
                        waited: started.elapsed(),
                    },
                });
            }

            let mut chunk = [0u8; 512];
            let n = self.source.fill(&mut chunk)?;
            if n == 0 {
                std::thread::sleep(POLL_INTERVAL);
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    /// Borrowing iterator of readings with a per-item timeout.
    pub fn readings(&mut self, timeout: Duration) -> Readings<'_, S> {
        Readings {
            reader: self,
            timeout,
        }
    }

    /// Pulls the next complete frame out of the buffer, discarding any
    /// noise bytes in front of the start marker. Returns None until a
    /// full frame is buffered.
    fn extract_frame(&mut self) -> Option<Vec<u8>> {
        let start = self.find_start()?;
        if start > 0 {
            trace!("discarding {} noise bytes before start marker", start);
            self.buf.advance(start);
        }

        // closing sequence: escape + 0x1A + fill byte + two checksum bytes
        let end = match self.find_end() {
            Some(end) => end,
            None => {
                if self.buf.len() > MAX_BUFFER {
                    // runaway frame, drop its marker and resync
                    self.buf.advance(8);
                }
                return None;
            }
        };
        let frame = self.buf[..end].to_vec();
        self.buf.advance(end);
        Some(frame)
    }

    fn find_start(&mut self) -> Option<usize> {
        let needle_len = ESCAPE_SEQUENCE.len() + VERSION_SEQUENCE.len();
        let pos = self
            .buf
            .windows(needle_len)
            .position(|w| w[..4] == ESCAPE_SEQUENCE && w[4..] == VERSION_SEQUENCE);

        if pos.is_none() {
            // nothing useful buffered, keep only a potential marker prefix
            if self.buf.len() > MAX_BUFFER {
                let keep = needle_len - 1;
                let drop = self.buf.len() - keep;
                self.buf.advance(drop);
            }
        }

        pos
    }

    fn find_end(&self) -> Option<usize> {
        // start scanning after the opening sequences
        let mut i = 8;
        while i + 8 <= self.buf.len() {
            if self.buf[i..i + 4] == ESCAPE_SEQUENCE {
                if self.buf[i + 4] == END_MARKER {
                    return Some(i + 8);
                }
                // skip a stuffed escape run in one step
                i += 4;
            } else {
                i += 1;
            }
        }
        None
    }
}

pub struct Readings<'a, S> {
    reader: &'a mut TelegramReader<S>,
    timeout: Duration,
}

impl<S: ByteSource> Iterator for Readings<'_, S> {
    type Item = Result<MeterReading, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.reader.next_reading(self.timeout))
    }
}
