use crate::prelude::*;
use crate::sml::{ByteSource, MeterReading, ReadError, TelegramReader};

pub const METER_COUNT: usize = 2;

/// The hardware line that multiplexes the shared UART between the two
/// meters. Channel 0 drives the line low, channel 1 high.
pub trait SelectLine {
    fn set(&mut self, high: bool) -> Result<()>;
}

/// Exclusive owner of the shared UART and its select line.
///
/// All reads go through `&mut self`, so a read on one channel can never
/// overlap a read on the other.
pub struct MeterBus<S, L> {
    reader: TelegramReader<S>,
    select: L,
    settle: Duration,
    selected: Option<usize>,
}

impl<S: ByteSource, L: SelectLine> MeterBus<S, L> {
    pub fn new(source: S, select: L, settle: Duration) -> Self {
        Self {
            reader: TelegramReader::new(source),
            select,
            settle,
            selected: None,
        }
    }

    /// Drives the select line and waits out the settle interval before
    /// any byte from the newly selected meter counts as valid. The
    /// settle time elapses on every call, switch or not, matching the
    /// line's debounce requirement.
    pub fn select_channel(&mut self, channel: usize) -> Result<(), ReadError> {
        if channel >= METER_COUNT {
            return Err(ReadError::Transport(anyhow!(
                "invalid meter channel {}",
                channel
            )));
        }

        self.select
            .set(channel == 1)
            .map_err(ReadError::Transport)?;
        std::thread::sleep(self.settle);

        // bytes that arrived while the other meter was routed through
        self.reader.discard_pending()?;
        self.selected = Some(channel);

        Ok(())
    }

    /// Selects the channel and drives the decoder until one reading is
    /// produced or the timeout elapses. A silent or garbling meter is a
    /// typed error, never a crash.
    pub fn read_one(
        &mut self,
        channel: usize,
        timeout: Duration,
    ) -> Result<MeterReading, ReadError> {
        self.select_channel(channel)?;

        let reading = self.reader.next_reading(timeout)?;
        trace!(
            "meter {}: telegram from device {}",
            channel,
            reading.device_id().unwrap_or_else(|| "?".into())
        );
        Ok(reading)
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }
}
