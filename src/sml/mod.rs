pub mod decoder;
pub mod reader;
pub mod value;

pub use decoder::{decode_frame, meter_reading_from_messages, unescape_body};
pub use reader::{ByteSource, ReadError, TelegramReader};
pub use value::{MeterReading, ObisCode, ObisKind, ObisValue, SmlValue, Unit};

use thiserror::Error;

/// Decode-level failures. Each invalidates one telegram; the reader
/// resynchronizes on the next start marker instead of terminating.
#[derive(Debug, Error)]
pub enum SmlError {
    #[error("missing escape sequence at frame start")]
    MissingStart,

    #[error("missing SML version sequence")]
    MissingVersion,

    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("missing end sequence")]
    MissingEnd,

    #[error("checksum mismatch: frame {stored:04X}, calculated {computed:04X}")]
    ChecksumMismatch { stored: u16, computed: u16 },

    #[error("unknown type length field {byte:02X} at position {pos}")]
    UnknownType { byte: u8, pos: usize },

    #[error("invalid transport escape at position {pos}")]
    BadEscape { pos: usize },

    #[error("value at position {pos} extends beyond frame")]
    OutOfBounds { pos: usize },

    #[error("message not terminated by end-of-message marker")]
    MissingEndOfMessage,

    #[error("frame contains no list response")]
    NoListResponse,
}
